//! Synthetic transaction traffic.
//!
//! Each node feeds its own pending pool from a seeded generator; the wire
//! protocol carries no transaction gossip. Blocks drain the pool up to the
//! configured cap, and a cancelled production attempt puts its payload
//! back.

use forksim_types::{unix_millis, NodeId, Transaction};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// FIFO pool of locally generated transactions.
#[derive(Default)]
pub struct TxPool {
    queue: Mutex<VecDeque<Transaction>>,
}

impl TxPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, tx: Transaction) {
        self.queue.lock().expect("tx pool lock").push_back(tx);
    }

    /// Take up to `max` transactions, oldest first.
    pub fn take(&self, max: usize) -> Vec<Transaction> {
        let mut queue = self.queue.lock().expect("tx pool lock");
        let count = queue.len().min(max);
        queue.drain(..count).collect()
    }

    /// Return transactions from an abandoned production attempt.
    pub fn requeue(&self, txs: Vec<Transaction>) {
        let mut queue = self.queue.lock().expect("tx pool lock");
        for tx in txs.into_iter().rev() {
            queue.push_front(tx);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("tx pool lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodically feed the pool with seeded transfer traffic.
pub(crate) async fn generate_loop(
    pool: std::sync::Arc<TxPool>,
    seed: u64,
    node_id: NodeId,
    num_nodes: u32,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(node_id as u64));
    let mut nonce = 0u64;
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = tick.tick() => {
                let recipient = if num_nodes > 1 {
                    // Any node but ourselves.
                    let r = rng.gen_range(0..num_nodes - 1);
                    if r >= node_id { r + 1 } else { r }
                } else {
                    node_id
                };
                let amount = rng.gen_range(1..=10);
                let tx = Transaction::new(node_id, recipient, amount, nonce, unix_millis());
                nonce += 1;
                debug!(recipient, amount, nonce, "generated transaction");
                pool.push(tx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_is_fifo_and_bounded() {
        let pool = TxPool::new();
        for i in 0..5 {
            pool.push(Transaction::new(0, 1, 1, i, 0));
        }
        let taken = pool.take(3);
        assert_eq!(taken.len(), 3);
        assert_eq!(taken[0].nonce, 0);
        assert_eq!(taken[2].nonce, 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn requeue_restores_order() {
        let pool = TxPool::new();
        for i in 0..4 {
            pool.push(Transaction::new(0, 1, 1, i, 0));
        }
        let taken = pool.take(2);
        pool.requeue(taken);
        let again = pool.take(4);
        let nonces: Vec<u64> = again.iter().map(|t| t.nonce).collect();
        assert_eq!(nonces, vec![0, 1, 2, 3]);
    }
}
