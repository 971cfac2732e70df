//! Consensus engines.
//!
//! Two engines share one contract ([`ConsensusEngine`]):
//!
//! - [`PowEngine`]: longest-chain proof of work. Any node may mine at any
//!   time; fork-choice weight is chain length.
//! - [`HybridEngine`]: stake-weighted deterministic leader election bound to
//!   a light proof of work. Fork-choice weight is the cumulative stake of
//!   the chain's proposers.
//!
//! Engines are pure rule sets: they never touch the network or the store.
//! Block production is CPU-bound and cooperatively cancellable through a
//! [`CancelToken`] observed between hashing attempts.

mod engine;
mod hybrid;
mod leader;
mod pow;

pub use engine::{CancelToken, ConsensusEngine};
pub use hybrid::HybridEngine;
pub use leader::{LeaderSchedule, StakeError};
pub use pow::PowEngine;
