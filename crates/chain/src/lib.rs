//! Chain store and fork-choice.
//!
//! The store keeps a DAG of every block it has ever accepted, selects the
//! best tip through a consensus-supplied [`ChainScore`], and tracks the
//! k-deep finalised prefix. It performs no I/O and knows nothing about which
//! consensus algorithm is running; engines plug in through the
//! [`ConsensusRules`] trait.
//!
//! # Architecture
//!
//! ```text
//! insert(block) ─► validate against parent ─► link into DAG
//!                                              │
//!                         drain pending pool ◄─┘
//!                                              │
//!                    recompute best tip ◄──────┘
//!                                              │
//!              advance finalised prefix ◄──────┘
//! ```
//!
//! The block index is append-only within a run. Reorganisation only moves
//! the tip pointer; stored blocks are never mutated or deleted.

mod audit;
mod rules;
mod score;
mod store;

pub use audit::{audit_finalized_chain, AuditError};
pub use rules::{ConsensusRules, ValidationError};
pub use score::ChainScore;
pub use store::{ChainStore, InsertOutcome, InsertReport, Reorg, SafetyViolation, TipChange};
