//! Scenario controller.
//!
//! A scenario configures the transport's per-link filter. Both scenarios
//! derive all of their state from the shared run seed and configuration,
//! so every node in the cluster applies consistent behaviour without any
//! coordination:
//!
//! - [`ScenarioKind::Delays`]: every outbound message is delayed by a
//!   uniform sample from a per-link seeded RNG; per-link FIFO order is
//!   preserved by the transport.
//! - [`ScenarioKind::Partition`]: the node set is split into fixed groups
//!   and cross-group traffic is dropped in both directions until the heal
//!   instant.

mod delay;
mod partition;

pub use delay::DelayPolicy;
pub use partition::PartitionPolicy;

use forksim_gossip::{LinkPolicy, OpenLink};
use forksim_types::NodeId;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Which scenario a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioKind {
    Delays,
    Partition,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown scenario {0:?}, expected \"delays\" or \"partition\"")]
pub struct UnknownScenario(String);

impl FromStr for ScenarioKind {
    type Err = UnknownScenario;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delays" => Ok(ScenarioKind::Delays),
            "partition" => Ok(ScenarioKind::Partition),
            other => Err(UnknownScenario(other.to_string())),
        }
    }
}

/// Tunables shared by both scenarios.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Lower delay bound for the delays scenario.
    pub delay_min_ms: u64,

    /// Upper delay bound for the delays scenario.
    pub delay_max_ms: u64,

    /// Partition membership. Nodes outside every group are unrestricted.
    pub partition_groups: Vec<Vec<NodeId>>,

    /// When the partition filter lifts, measured from node start.
    pub heal_after_ms: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            delay_min_ms: 50,
            delay_max_ms: 200,
            partition_groups: vec![vec![0, 1], vec![2, 3, 4]],
            heal_after_ms: 15_000,
        }
    }
}

/// Per-node scenario state: the link policy plus the heal schedule.
pub struct ScenarioController {
    kind: ScenarioKind,
    policy: Arc<dyn LinkPolicy>,
    partition: Option<Arc<PartitionPolicy>>,
    heal_after: Duration,
}

impl ScenarioController {
    /// Build the controller for one node.
    ///
    /// `seed` is the shared run seed; combined with the node and peer ids
    /// it fully determines every delay sample, so a rerun with the same
    /// seed injects the same network behaviour.
    pub fn new(
        kind: ScenarioKind,
        config: &ScenarioConfig,
        seed: u64,
        node_id: NodeId,
        num_nodes: u32,
    ) -> Self {
        match kind {
            ScenarioKind::Delays => {
                let policy = Arc::new(DelayPolicy::new(
                    seed,
                    node_id,
                    num_nodes,
                    Duration::from_millis(config.delay_min_ms),
                    Duration::from_millis(config.delay_max_ms),
                ));
                Self {
                    kind,
                    policy,
                    partition: None,
                    heal_after: Duration::ZERO,
                }
            }
            ScenarioKind::Partition => {
                let partition = Arc::new(PartitionPolicy::new(node_id, &config.partition_groups));
                Self {
                    kind,
                    policy: Arc::clone(&partition) as Arc<dyn LinkPolicy>,
                    partition: Some(partition),
                    heal_after: Duration::from_millis(config.heal_after_ms),
                }
            }
        }
    }

    /// Controller that filters nothing. Single-node runs use this.
    pub fn unrestricted() -> Self {
        Self {
            kind: ScenarioKind::Delays,
            policy: Arc::new(OpenLink),
            partition: None,
            heal_after: Duration::ZERO,
        }
    }

    pub fn kind(&self) -> ScenarioKind {
        self.kind
    }

    /// The filter installed into the transport.
    pub fn policy(&self) -> Arc<dyn LinkPolicy> {
        Arc::clone(&self.policy)
    }

    /// Delay until the heal instant, if this scenario partitions.
    pub fn heal_after(&self) -> Option<Duration> {
        self.partition.as_ref().map(|_| self.heal_after)
    }

    /// The partition groups, if this scenario partitions.
    pub fn partition_groups(&self) -> Option<Vec<Vec<NodeId>>> {
        self.partition.as_ref().map(|p| p.groups().to_vec())
    }

    /// Lift the partition filter. Returns `true` if a filter was active.
    pub fn heal(&self) -> bool {
        match &self.partition {
            Some(partition) => partition.heal(),
            None => false,
        }
    }
}
