//! Message kinds exchanged between peers.

use forksim_chain::ChainScore;
use forksim_types::{Block, Hash, NodeId};
use serde::{Deserialize, Serialize};

/// A gossip message.
///
/// The protocol carries no error kind; every failure is handled locally by
/// the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum WireMessage {
    /// Gossip of a new block.
    Block { block: Block },

    /// Request a block by hash.
    GetBlock { hash: Hash },

    /// Response to `GetBlock`, or an unsolicited catch-up.
    Blocks { blocks: Vec<Block> },

    /// Sent on connect; the receiver may answer with `GetBlock` if the
    /// advertised tip beats its own.
    Hello {
        node_id: NodeId,
        tip_hash: Hash,
        tip_score: ChainScore,
    },

    /// Liveness probe.
    Ping { timestamp_ms: u64 },

    /// Liveness answer, echoing the probe timestamp.
    Pong { timestamp_ms: u64 },
}

impl WireMessage {
    /// Human-readable kind name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Block { .. } => "Block",
            WireMessage::GetBlock { .. } => "GetBlock",
            WireMessage::Blocks { .. } => "Blocks",
            WireMessage::Hello { .. } => "Hello",
            WireMessage::Ping { .. } => "Ping",
            WireMessage::Pong { .. } => "Pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_has_kind_and_payload() {
        let msg = WireMessage::GetBlock {
            hash: Hash::digest(b"wanted"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["kind"], "GetBlock");
        assert!(value["payload"]["hash"].is_string());
    }

    #[test]
    fn round_trips_every_kind() {
        let block = Block::genesis();
        let score = ChainScore::new(3, 3, block.hash);
        let messages = vec![
            WireMessage::Block {
                block: block.clone(),
            },
            WireMessage::GetBlock { hash: block.hash },
            WireMessage::Blocks {
                blocks: vec![block.clone()],
            },
            WireMessage::Hello {
                node_id: 2,
                tip_hash: block.hash,
                tip_score: score,
            },
            WireMessage::Ping { timestamp_ms: 42 },
            WireMessage::Pong { timestamp_ms: 42 },
        ];
        for msg in messages {
            let json = serde_json::to_string(&msg).unwrap();
            let back: WireMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn unknown_kind_fails_to_parse() {
        let err = serde_json::from_str::<WireMessage>(r#"{"kind":"Gossip","payload":{}}"#);
        assert!(err.is_err());
    }
}
