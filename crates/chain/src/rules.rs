//! The seam between the store and the consensus engines.

use crate::ChainScore;
use forksim_types::{Block, NodeId};
use thiserror::Error;

/// Why a block failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("stored hash does not match recomputed hash")]
    HashMismatch,

    #[error("height {got} does not follow parent height {parent}")]
    NonSequentialHeight { parent: u64, got: u64 },

    #[error("timestamp {got} is earlier than parent timestamp {parent}")]
    TimestampBeforeParent { parent: u64, got: u64 },

    #[error("hash does not meet difficulty {difficulty}")]
    TargetNotMet { difficulty: u32 },

    #[error("proposer {got} is not the elected leader {expected} and no timeout elapsed")]
    UnexpectedProposer { expected: NodeId, got: NodeId },

    #[error("proposer {got} is not a member of the validator set")]
    UnknownProposer { got: NodeId },
}

/// Validation and scoring rules supplied by a consensus engine.
///
/// The store calls these under its own lock, so implementations must be
/// cheap and free of interior blocking.
pub trait ConsensusRules: Send + Sync {
    /// Structural and consensus-specific checks for a block against its
    /// already-stored parent.
    fn validate(&self, block: &Block, parent: &Block) -> Result<(), ValidationError>;

    /// Score of a full chain ordered genesis-first.
    fn score(&self, chain: &[Block]) -> ChainScore;
}
