//! Offline ledger audit over finalised chains.
//!
//! Block acceptance treats transactions as opaque payload, so double-spend
//! checking happens here instead: replay a finalised chain against the
//! configured starting balances and flag anything inconsistent.

use forksim_types::{Block, Hash, NodeId};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// A finalised chain that fails the ledger replay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditError {
    #[error("account {account} overdrawn at height {height}")]
    Overdraft { account: NodeId, height: u64 },

    #[error("transaction {tx_hash} appears twice, second time at height {height}")]
    DuplicateTransaction { tx_hash: Hash, height: u64 },

    #[error("block {block_hash} at height {height} fails hash verification")]
    CorruptBlock { block_hash: Hash, height: u64 },
}

/// Replay a finalised chain and return the resulting balances.
///
/// `initial_balances[i]` funds account `i`. Accounts outside the table start
/// at zero. The chain must be ordered genesis-first.
pub fn audit_finalized_chain(
    chain: &[Block],
    initial_balances: &[u64],
) -> Result<HashMap<NodeId, u64>, AuditError> {
    let mut balances: HashMap<NodeId, u64> = initial_balances
        .iter()
        .enumerate()
        .map(|(i, b)| (i as NodeId, *b))
        .collect();
    let mut seen: HashSet<Hash> = HashSet::new();

    for block in chain {
        if !block.verify_hash() {
            return Err(AuditError::CorruptBlock {
                block_hash: block.hash,
                height: block.height,
            });
        }
        for tx in &block.transactions {
            if !seen.insert(tx.hash) {
                return Err(AuditError::DuplicateTransaction {
                    tx_hash: tx.hash,
                    height: block.height,
                });
            }
            let sender = balances.entry(tx.sender).or_insert(0);
            let Some(debited) = sender.checked_sub(tx.amount) else {
                return Err(AuditError::Overdraft {
                    account: tx.sender,
                    height: block.height,
                });
            };
            *sender = debited;
            *balances.entry(tx.recipient).or_insert(0) += tx.amount;
        }
    }
    Ok(balances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forksim_types::Transaction;

    fn block_with(parent: &Block, txs: Vec<Transaction>) -> Block {
        Block::assemble(
            parent.height + 1,
            parent.hash,
            txs,
            0,
            parent.timestamp_ms + 1,
            0,
        )
    }

    #[test]
    fn replay_moves_balances() {
        let genesis = Block::genesis();
        let b1 = block_with(&genesis, vec![Transaction::new(0, 1, 30, 0, 10)]);
        let b2 = block_with(&b1, vec![Transaction::new(1, 2, 10, 0, 20)]);

        let balances = audit_finalized_chain(&[genesis, b1, b2], &[100, 100, 100]).unwrap();
        assert_eq!(balances[&0], 70);
        assert_eq!(balances[&1], 120);
        assert_eq!(balances[&2], 110);
    }

    #[test]
    fn overdraft_is_flagged() {
        let genesis = Block::genesis();
        let b1 = block_with(&genesis, vec![Transaction::new(0, 1, 500, 0, 10)]);
        let err = audit_finalized_chain(&[genesis, b1], &[100, 100]).unwrap_err();
        assert!(matches!(err, AuditError::Overdraft { account: 0, .. }));
    }

    #[test]
    fn replayed_transaction_is_flagged() {
        let genesis = Block::genesis();
        let tx = Transaction::new(0, 1, 5, 0, 10);
        let b1 = block_with(&genesis, vec![tx.clone()]);
        let b2 = block_with(&b1, vec![tx]);
        let err = audit_finalized_chain(&[genesis, b1, b2], &[100, 100]).unwrap_err();
        assert!(matches!(err, AuditError::DuplicateTransaction { .. }));
    }
}
