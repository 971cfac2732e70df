//! Blocks and the canonical block hash.

use crate::{Hash, NodeId, Transaction};
use serde::{Deserialize, Serialize};

/// Hex encoding of the genesis parent pointer.
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// A block in the chain.
///
/// The hash commits to every preceding field including the nonce, so the
/// proof-of-work search re-hashes the whole canonical serialization per
/// attempt, exactly as validation re-derives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Height in the chain, genesis is 0.
    pub height: u64,

    /// Hash of the parent block.
    pub prev_hash: Hash,

    /// Payload carried by this block.
    pub transactions: Vec<Transaction>,

    /// Node that produced this block.
    pub proposer_id: NodeId,

    /// Production time in milliseconds since the Unix epoch.
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,

    /// Proof-of-work counter.
    pub nonce: u64,

    /// Hash of the canonical serialization of the fields above.
    pub hash: Hash,
}

/// Hashed fields in canonical order.
#[derive(Serialize)]
struct BlockPreimage<'a> {
    height: u64,
    prev_hash: &'a Hash,
    transactions: &'a [Transaction],
    proposer_id: NodeId,
    timestamp: u64,
    nonce: u64,
}

impl Block {
    /// Assemble a block, sealing it with its computed hash.
    pub fn assemble(
        height: u64,
        prev_hash: Hash,
        transactions: Vec<Transaction>,
        proposer_id: NodeId,
        timestamp_ms: u64,
        nonce: u64,
    ) -> Self {
        let hash = Self::hash_fields(
            height,
            &prev_hash,
            &transactions,
            proposer_id,
            timestamp_ms,
            nonce,
        );
        Self {
            height,
            prev_hash,
            transactions,
            proposer_id,
            timestamp_ms,
            nonce,
            hash,
        }
    }

    /// The genesis block.
    ///
    /// Every field is fixed, so all nodes derive the identical block (and
    /// hash) without any communication.
    pub fn genesis() -> Self {
        Self::assemble(0, Hash::ZERO, Vec::new(), 0, 0, 0)
    }

    /// Hash of the canonical serialization of the given fields.
    ///
    /// Exposed separately from [`Block::assemble`] so the mining loop can
    /// probe nonces without rebuilding the transaction vector each attempt.
    pub fn hash_fields(
        height: u64,
        prev_hash: &Hash,
        transactions: &[Transaction],
        proposer_id: NodeId,
        timestamp_ms: u64,
        nonce: u64,
    ) -> Hash {
        let preimage = BlockPreimage {
            height,
            prev_hash,
            transactions,
            proposer_id,
            timestamp: timestamp_ms,
            nonce,
        };
        let bytes = serde_json::to_vec(&preimage).expect("block preimage serializes");
        Hash::digest(&bytes)
    }

    /// Recompute the hash from the stored fields.
    pub fn compute_hash(&self) -> Hash {
        Self::hash_fields(
            self.height,
            &self.prev_hash,
            &self.transactions,
            self.proposer_id,
            self.timestamp_ms,
            self.nonce,
        )
    }

    /// Whether the stored hash matches the fields.
    pub fn verify_hash(&self) -> bool {
        self.compute_hash() == self.hash
    }

    /// Whether this is the genesis block.
    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.prev_hash == Hash::ZERO
    }
}
