//! Uniform per-message delay injection.

use forksim_gossip::{LinkPolicy, LinkVerdict};
use forksim_types::NodeId;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Delays every outbound message by a uniform sample from
/// `[min_delay, max_delay]`.
///
/// Each link `(node, peer)` owns a `ChaCha8Rng` seeded from the run seed
/// and both endpoint ids, so the sequence of delays on a link is a pure
/// function of the run configuration.
pub struct DelayPolicy {
    min_delay: Duration,
    max_delay: Duration,
    rngs: HashMap<NodeId, Mutex<ChaCha8Rng>>,
}

impl DelayPolicy {
    pub fn new(
        seed: u64,
        node_id: NodeId,
        num_nodes: u32,
        min_delay: Duration,
        max_delay: Duration,
    ) -> Self {
        let rngs = (0..num_nodes)
            .filter(|peer| *peer != node_id)
            .map(|peer| {
                let link_seed = link_seed(seed, node_id, peer);
                (peer, Mutex::new(ChaCha8Rng::seed_from_u64(link_seed)))
            })
            .collect();
        Self {
            min_delay,
            max_delay,
            rngs,
        }
    }

    /// Next delay sample for a link.
    pub fn sample(&self, to: NodeId) -> Duration {
        let Some(rng) = self.rngs.get(&to) else {
            return Duration::ZERO;
        };
        let mut rng = rng.lock().expect("delay rng lock");
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        Duration::from_millis(rng.gen_range(min..=max))
    }
}

/// Mix the run seed with both endpoints of a link.
fn link_seed(seed: u64, node_id: NodeId, peer: NodeId) -> u64 {
    seed.wrapping_add(((node_id as u64) << 32) | peer as u64)
        .wrapping_mul(0x517cc1b727220a95)
}

impl LinkPolicy for DelayPolicy {
    fn outbound(&self, to: NodeId) -> LinkVerdict {
        LinkVerdict::Deliver {
            delay: self.sample(to),
        }
    }

    fn inbound_allowed(&self, _from: NodeId) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(seed: u64, node: NodeId) -> DelayPolicy {
        DelayPolicy::new(
            seed,
            node,
            5,
            Duration::from_millis(50),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn samples_stay_within_bounds() {
        let policy = policy(42, 0);
        for _ in 0..500 {
            let d = policy.sample(1);
            assert!(d >= Duration::from_millis(50));
            assert!(d <= Duration::from_millis(200));
        }
    }

    #[test]
    fn same_seed_same_sequence() {
        let a = policy(42, 0);
        let b = policy(42, 0);
        for _ in 0..100 {
            assert_eq!(a.sample(3), b.sample(3));
        }
    }

    #[test]
    fn different_links_sample_independently() {
        let policy = policy(42, 0);
        let to_one: Vec<_> = (0..32).map(|_| policy.sample(1)).collect();
        let fresh = self::policy(42, 0);
        let to_two: Vec<_> = (0..32).map(|_| fresh.sample(2)).collect();
        assert_ne!(to_one, to_two);
    }

    #[test]
    fn never_drops() {
        let policy = policy(7, 2);
        for peer in [0u32, 1, 3, 4] {
            assert!(matches!(
                policy.outbound(peer),
                LinkVerdict::Deliver { .. }
            ));
            assert!(policy.inbound_allowed(peer));
            assert!(!policy.blocked(peer));
        }
    }
}
