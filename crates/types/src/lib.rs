//! Core types for the forksim consensus simulator.
//!
//! This crate provides the foundational data model shared by every other
//! crate:
//!
//! - [`Hash`]: a SHA-256 digest with a hex wire representation
//! - [`Transaction`]: an opaque transfer record identified by its hash
//! - [`Block`]: the unit of consensus, hashed over its canonical serialization
//!
//! Everything here is pure data. Networking, fork-choice and block
//! production live in the crates layered on top.

mod block;
mod hash;
mod transaction;

pub use block::{Block, GENESIS_PREV_HASH};
pub use hash::Hash;
pub use transaction::Transaction;

use std::time::{SystemTime, UNIX_EPOCH};

/// Node identifier, a fixed integer in `[0, N)`.
pub type NodeId = u32;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
