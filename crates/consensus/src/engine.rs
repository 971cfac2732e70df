//! The engine contract and cooperative cancellation.

use forksim_chain::ConsensusRules;
use forksim_types::{Block, Transaction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How many nonces a producer tries between cancellation checks.
pub(crate) const CANCEL_CHECK_INTERVAL: u64 = 2048;

/// Cooperative cancellation flag for an in-flight production attempt.
///
/// The scheduler fires the token when the tip changes; the producer observes
/// it within a few thousand hashing attempts and returns without a block.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the producer to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Common contract of the consensus engines.
///
/// Validation and scoring come from [`ConsensusRules`] so the chain store
/// can use an engine directly as its rule set.
pub trait ConsensusEngine: ConsensusRules {
    /// Engine name for logs and diagnostics.
    fn name(&self) -> &'static str;

    /// May this node attempt to produce a successor of `tip` now?
    ///
    /// `tip_seen_ms` is when this node first observed `tip`; the hybrid
    /// engine measures its leader timeout from that instant.
    fn can_propose(&self, tip: &Block, now_ms: u64, tip_seen_ms: u64) -> bool;

    /// Synthesise a valid successor of `tip`, or `None` if `cancel` fired
    /// before a block was found.
    fn produce(
        &self,
        tip: &Block,
        transactions: Vec<Transaction>,
        now_ms: u64,
        cancel: &CancelToken,
    ) -> Option<Block>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_starts_clear_and_latches() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
