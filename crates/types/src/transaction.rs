//! Transfer transactions.
//!
//! Consensus treats transactions as opaque payload. They only matter to the
//! block hash and to the offline ledger audit over finalised chains.

use crate::{Hash, NodeId};
use serde::{Deserialize, Serialize};

/// A transfer between two node accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sending account.
    pub sender: NodeId,

    /// Receiving account.
    pub recipient: NodeId,

    /// Amount transferred.
    pub amount: u64,

    /// Per-sender sequence number.
    pub nonce: u64,

    /// Creation time in milliseconds since the Unix epoch.
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,

    /// Hash of the canonical serialization of the fields above.
    pub hash: Hash,
}

/// Hashed fields in canonical order.
#[derive(Serialize)]
struct TxPreimage<'a> {
    sender: &'a NodeId,
    recipient: &'a NodeId,
    amount: &'a u64,
    nonce: &'a u64,
    timestamp: &'a u64,
}

impl Transaction {
    /// Create a transaction, computing its identifying hash.
    pub fn new(
        sender: NodeId,
        recipient: NodeId,
        amount: u64,
        nonce: u64,
        timestamp_ms: u64,
    ) -> Self {
        let hash = Self::hash_fields(sender, recipient, amount, nonce, timestamp_ms);
        Self {
            sender,
            recipient,
            amount,
            nonce,
            timestamp_ms,
            hash,
        }
    }

    /// Hash of the canonical serialization of the given fields.
    pub fn hash_fields(
        sender: NodeId,
        recipient: NodeId,
        amount: u64,
        nonce: u64,
        timestamp_ms: u64,
    ) -> Hash {
        let preimage = TxPreimage {
            sender: &sender,
            recipient: &recipient,
            amount: &amount,
            nonce: &nonce,
            timestamp: &timestamp_ms,
        };
        let bytes = serde_json::to_vec(&preimage).expect("transaction preimage serializes");
        Hash::digest(&bytes)
    }

    /// Whether the stored hash matches the fields.
    pub fn verify_hash(&self) -> bool {
        Self::hash_fields(
            self.sender,
            self.recipient,
            self.amount,
            self.nonce,
            self.timestamp_ms,
        ) == self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_commits_to_all_fields() {
        let base = Transaction::new(0, 1, 10, 0, 1000);
        assert!(base.verify_hash());
        assert_ne!(base.hash, Transaction::new(1, 1, 10, 0, 1000).hash);
        assert_ne!(base.hash, Transaction::new(0, 2, 10, 0, 1000).hash);
        assert_ne!(base.hash, Transaction::new(0, 1, 11, 0, 1000).hash);
        assert_ne!(base.hash, Transaction::new(0, 1, 10, 1, 1000).hash);
        assert_ne!(base.hash, Transaction::new(0, 1, 10, 0, 1001).hash);
    }

    #[test]
    fn tampering_is_detected() {
        let mut tx = Transaction::new(2, 3, 5, 7, 99);
        tx.amount = 500;
        assert!(!tx.verify_hash());
    }
}
