//! Fork-choice scores.

use forksim_types::Hash;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Comparable weight of a chain, produced by a consensus engine and
/// consumed by the store's tip selection.
///
/// A greater score wins. Comparison order: `weight` first, then `length`,
/// then the lexicographically *smaller* tip hash, so that every node breaks
/// ties identically. For proof-of-work the weight is simply the chain
/// length; for the hybrid engine it is the cumulative stake of the chain's
/// proposers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainScore {
    /// Engine-specific weight.
    pub weight: u64,

    /// Tip height.
    pub length: u64,

    /// Hash of the chain tip.
    pub tip_hash: Hash,
}

impl ChainScore {
    /// Score of the chain consisting only of the given tip-of-chain data.
    pub fn new(weight: u64, length: u64, tip_hash: Hash) -> Self {
        Self {
            weight,
            length,
            tip_hash,
        }
    }
}

impl Ord for ChainScore {
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight
            .cmp(&other.weight)
            .then(self.length.cmp(&other.length))
            // Smaller hash is the better tie break.
            .then_with(|| other.tip_hash.cmp(&self.tip_hash))
    }
}

impl PartialOrd for ChainScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
