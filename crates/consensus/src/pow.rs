//! Longest-chain proof of work.

use crate::engine::CANCEL_CHECK_INTERVAL;
use crate::{CancelToken, ConsensusEngine};
use forksim_chain::{ChainScore, ConsensusRules, ValidationError};
use forksim_types::{unix_millis, Block, NodeId, Transaction};
use tracing::trace;

/// Proof-of-work engine.
///
/// Production scans nonces until the block hash carries `difficulty`
/// leading zero nibbles. Fork-choice is longest chain, ties broken by the
/// smaller tip hash.
pub struct PowEngine {
    node_id: NodeId,
    difficulty: u32,
}

impl PowEngine {
    pub fn new(node_id: NodeId, difficulty: u32) -> Self {
        Self {
            node_id,
            difficulty,
        }
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }
}

impl ConsensusRules for PowEngine {
    fn validate(&self, block: &Block, parent: &Block) -> Result<(), ValidationError> {
        if block.compute_hash() != block.hash {
            return Err(ValidationError::HashMismatch);
        }
        if block.height != parent.height + 1 {
            return Err(ValidationError::NonSequentialHeight {
                parent: parent.height,
                got: block.height,
            });
        }
        if block.timestamp_ms < parent.timestamp_ms {
            return Err(ValidationError::TimestampBeforeParent {
                parent: parent.timestamp_ms,
                got: block.timestamp_ms,
            });
        }
        if !block.hash.meets_difficulty(self.difficulty) {
            return Err(ValidationError::TargetNotMet {
                difficulty: self.difficulty,
            });
        }
        Ok(())
    }

    fn score(&self, chain: &[Block]) -> ChainScore {
        let tip = chain.last().expect("non-empty chain");
        ChainScore::new(tip.height, tip.height, tip.hash)
    }
}

impl ConsensusEngine for PowEngine {
    fn name(&self) -> &'static str {
        "pow"
    }

    fn can_propose(&self, _tip: &Block, _now_ms: u64, _tip_seen_ms: u64) -> bool {
        true
    }

    fn produce(
        &self,
        tip: &Block,
        transactions: Vec<Transaction>,
        now_ms: u64,
        cancel: &CancelToken,
    ) -> Option<Block> {
        let height = tip.height + 1;
        // Timestamp refreshes each check interval so two miners working on
        // the same parent never search the same nonce space.
        let mut timestamp_ms = now_ms.max(tip.timestamp_ms);
        let mut nonce = 0u64;
        loop {
            if nonce % CANCEL_CHECK_INTERVAL == 0 {
                if cancel.is_cancelled() {
                    trace!(height, nonce, "mining cancelled");
                    return None;
                }
                timestamp_ms = unix_millis().max(tip.timestamp_ms);
            }
            let hash = Block::hash_fields(
                height,
                &tip.hash,
                &transactions,
                self.node_id,
                timestamp_ms,
                nonce,
            );
            if hash.meets_difficulty(self.difficulty) {
                return Some(Block::assemble(
                    height,
                    tip.hash,
                    transactions,
                    self.node_id,
                    timestamp_ms,
                    nonce,
                ));
            }
            nonce += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn mine(engine: &PowEngine, tip: &Block) -> Block {
        engine
            .produce(tip, vec![], 1_000, &CancelToken::new())
            .expect("low difficulty always terminates")
    }

    #[test]
    fn mined_block_validates() {
        let engine = PowEngine::new(0, 2);
        let genesis = Block::genesis();
        let block = mine(&engine, &genesis);
        assert!(block.hash.meets_difficulty(2));
        assert_eq!(block.height, 1);
        engine.validate(&block, &genesis).unwrap();
    }

    #[test]
    fn validation_rejects_weak_hashes() {
        let engine = PowEngine::new(0, 2);
        let genesis = Block::genesis();
        // Unmined block; with two leading zero nibbles required this will
        // essentially never pass by accident.
        let block = Block::assemble(1, genesis.hash, vec![], 0, 1_000, 0);
        if !block.hash.meets_difficulty(2) {
            assert_eq!(
                engine.validate(&block, &genesis),
                Err(ValidationError::TargetNotMet { difficulty: 2 })
            );
        }
    }

    #[test]
    fn validation_rejects_timestamp_regression() {
        let engine = PowEngine::new(0, 0);
        let genesis = Block::genesis();
        let parent = Block::assemble(1, genesis.hash, vec![], 0, 5_000, 0);
        let block = Block::assemble(2, parent.hash, vec![], 0, 4_000, 0);
        assert!(matches!(
            engine.validate(&block, &parent),
            Err(ValidationError::TimestampBeforeParent { .. })
        ));
    }

    #[test]
    fn cancellation_stops_the_search() {
        // Difficulty 16 is unreachable in any reasonable time, so only the
        // cancel flag can end the call.
        let engine = PowEngine::new(0, 16);
        let genesis = Block::genesis();
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });
        let result = engine.produce(&genesis, vec![], 1_000, &cancel);
        handle.join().unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn score_is_chain_length() {
        let engine = PowEngine::new(0, 1);
        let genesis = Block::genesis();
        let b1 = mine(&engine, &genesis);
        let score = engine.score(&[genesis, b1.clone()]);
        assert_eq!(score.weight, 1);
        assert_eq!(score.length, 1);
        assert_eq!(score.tip_hash, b1.hash);
    }
}
