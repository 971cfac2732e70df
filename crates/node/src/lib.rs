//! Per-node scheduler.
//!
//! Wires the chain store, a consensus engine, the gossip transport and a
//! scenario controller into one running node:
//!
//! 1. **Production loop**: restarts `produce` with a fresh cancel token
//!    whenever the tip changes; a hybrid fallback proposer re-checks after
//!    its leader timeout.
//! 2. **Inbound loop**: dispatches decoded gossip by kind into the store
//!    and answers `GetBlock`/`Hello` catch-up requests.
//! 3. **Finality observer**: every tip change advances the finalised
//!    prefix and is written to the structured event log.
//! 4. **Scenario timer**: lifts the partition filter at the heal instant
//!    and re-announces the tip.
//!
//! The chain store is the only shared mutable state; it sits behind a
//! single mutex and every insert runs under it.

mod events;
mod runtime;
mod txgen;

pub use events::EventLog;
pub use runtime::{NodeConfig, NodeError, NodeHandle};
pub use txgen::TxPool;
