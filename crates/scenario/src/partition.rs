//! Partition filtering and heal.

use forksim_gossip::{LinkPolicy, LinkVerdict};
use forksim_types::NodeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

/// Drops cross-group traffic in both directions until healed.
///
/// Group membership is fixed at construction and identical on every node,
/// so all sides of the partition filter consistently. Nodes not listed in
/// any group are never filtered.
pub struct PartitionPolicy {
    node_id: NodeId,
    groups: Vec<Vec<NodeId>>,
    group_of: HashMap<NodeId, usize>,
    healed: AtomicBool,
}

impl PartitionPolicy {
    pub fn new(node_id: NodeId, groups: &[Vec<NodeId>]) -> Self {
        let group_of = groups
            .iter()
            .enumerate()
            .flat_map(|(idx, members)| members.iter().map(move |m| (*m, idx)))
            .collect();
        Self {
            node_id,
            groups: groups.to_vec(),
            group_of,
            healed: AtomicBool::new(false),
        }
    }

    /// Whether traffic between us and `other` crosses the partition.
    fn severed(&self, other: NodeId) -> bool {
        if self.healed.load(Ordering::Relaxed) {
            return false;
        }
        match (
            self.group_of.get(&self.node_id),
            self.group_of.get(&other),
        ) {
            (Some(ours), Some(theirs)) => ours != theirs,
            _ => false,
        }
    }

    /// Lift the filter. Returns `true` the first time.
    pub fn heal(&self) -> bool {
        let was_active = !self.healed.swap(true, Ordering::Relaxed);
        if was_active {
            info!(node_id = self.node_id, "partition filter lifted");
        }
        was_active
    }

    pub fn is_healed(&self) -> bool {
        self.healed.load(Ordering::Relaxed)
    }

    pub fn groups(&self) -> &[Vec<NodeId>] {
        &self.groups
    }
}

impl LinkPolicy for PartitionPolicy {
    fn outbound(&self, to: NodeId) -> LinkVerdict {
        if self.severed(to) {
            LinkVerdict::Drop
        } else {
            LinkVerdict::Deliver {
                delay: Duration::ZERO,
            }
        }
    }

    fn inbound_allowed(&self, from: NodeId) -> bool {
        !self.severed(from)
    }

    fn blocked(&self, to: NodeId) -> bool {
        self.severed(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups() -> Vec<Vec<NodeId>> {
        vec![vec![0, 1], vec![2, 3, 4]]
    }

    #[test]
    fn cross_group_traffic_is_dropped_both_ways() {
        let policy = PartitionPolicy::new(1, &groups());
        assert_eq!(policy.outbound(0), LinkVerdict::Deliver { delay: Duration::ZERO });
        assert_eq!(policy.outbound(3), LinkVerdict::Drop);
        assert!(policy.inbound_allowed(0));
        assert!(!policy.inbound_allowed(4));
        assert!(policy.blocked(2));
        assert!(!policy.blocked(0));
    }

    #[test]
    fn heal_restores_full_connectivity() {
        let policy = PartitionPolicy::new(3, &groups());
        assert_eq!(policy.outbound(0), LinkVerdict::Drop);
        assert!(policy.heal());
        assert!(!policy.heal());
        for peer in [0u32, 1, 2, 4] {
            assert!(matches!(
                policy.outbound(peer),
                LinkVerdict::Deliver { .. }
            ));
            assert!(policy.inbound_allowed(peer));
        }
    }

    #[test]
    fn unlisted_nodes_are_never_filtered() {
        let policy = PartitionPolicy::new(7, &groups());
        assert!(matches!(policy.outbound(0), LinkVerdict::Deliver { .. }));
        assert!(policy.inbound_allowed(2));
    }
}
