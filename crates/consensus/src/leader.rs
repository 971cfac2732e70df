//! Deterministic stake-weighted leader election.

use forksim_types::{Hash, NodeId};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Invalid stake configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StakeError {
    #[error("stake table is empty")]
    Empty,

    #[error("total stake is zero")]
    ZeroTotal,
}

/// Maps a `(parent hash, slot)` pair to the node whose cumulative stake
/// interval contains the draw.
///
/// The draw hashes `parent || slot` and reduces the first 16 digest bytes
/// into `[0, total_stake)`. Integer arithmetic only, so every node with the
/// same stake table computes the same leader.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaderSchedule {
    stakes: Vec<u64>,
    total: u64,
}

impl LeaderSchedule {
    pub fn new(stakes: Vec<u64>) -> Result<Self, StakeError> {
        if stakes.is_empty() {
            return Err(StakeError::Empty);
        }
        let total: u64 = stakes.iter().sum();
        if total == 0 {
            return Err(StakeError::ZeroTotal);
        }
        Ok(Self { stakes, total })
    }

    /// Leader of the slot built on the given parent.
    pub fn leader_for(&self, parent: &Hash, slot: u64) -> NodeId {
        let mut hasher = Sha256::new();
        hasher.update(parent.as_bytes());
        hasher.update(slot.to_be_bytes());
        let digest = hasher.finalize();

        let mut wide = [0u8; 16];
        wide.copy_from_slice(&digest[..16]);
        let draw = (u128::from_be_bytes(wide) % self.total as u128) as u64;

        let mut cumulative = 0u64;
        for (i, stake) in self.stakes.iter().enumerate() {
            cumulative += stake;
            if draw < cumulative {
                return i as NodeId;
            }
        }
        // Unreachable: draw < total == final cumulative.
        (self.stakes.len() - 1) as NodeId
    }

    /// Stake of a node, zero if out of range.
    pub fn stake_of(&self, node: NodeId) -> u64 {
        self.stakes.get(node as usize).copied().unwrap_or(0)
    }

    /// Number of participants.
    pub fn len(&self) -> usize {
        self.stakes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stakes.is_empty()
    }

    pub fn total_stake(&self) -> u64 {
        self.total
    }
}
