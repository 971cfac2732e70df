//! TCP gossip transport.
//!
//! One listener per node on `127.0.0.1:base_port + node_id`. Each node
//! dials every other node with exponential backoff and keeps the
//! connection open; a node receives on its accepted sockets and sends on
//! its dialed sockets. All traffic passes through a [`LinkPolicy`] so the
//! scenario controller can delay or drop individual links without the
//! transport knowing why.
//!
//! The transport surfaces everything the scheduler needs through a single
//! event stream: identified peer connects/disconnects and decoded messages.
//! `Ping`/`Pong` liveness is handled internally and never reaches the
//! scheduler.

mod dedup;
mod listener;
mod peer;
mod policy;
mod transport;

pub use dedup::RecentSet;
pub use policy::{LinkPolicy, LinkVerdict, OpenLink};
pub use transport::{GossipEvent, GossipHandle, GossipTransport, HelloState};

use forksim_types::NodeId;
use std::time::Duration;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// This node's identity.
    pub node_id: NodeId,

    /// Total number of nodes; peers are every id in `[0, num_nodes)`
    /// except our own.
    pub num_nodes: u32,

    /// Listener port for node 0; node `i` listens on `base_port + i`.
    pub base_port: u16,

    /// How often to probe each peer.
    pub ping_interval: Duration,

    /// How long without a `Pong` before the link is torn down.
    pub pong_timeout: Duration,

    /// First redial delay; doubles up to `dial_backoff_max`.
    pub dial_backoff_min: Duration,
    pub dial_backoff_max: Duration,

    /// Capacity of the recent-hash broadcast dedup set.
    pub recent_capacity: usize,
}

impl GossipConfig {
    /// Defaults for a cluster of `num_nodes` nodes.
    pub fn new(node_id: NodeId, num_nodes: u32) -> Self {
        let n = num_nodes as usize;
        Self {
            node_id,
            num_nodes,
            base_port: 9000,
            ping_interval: Duration::from_secs(2),
            pong_timeout: Duration::from_secs(5),
            dial_backoff_min: Duration::from_millis(100),
            dial_backoff_max: Duration::from_secs(2),
            recent_capacity: (n * n * 16).max(256),
        }
    }

    /// Override the base listener port.
    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    /// Listener port of a node.
    pub fn port_of(&self, node: NodeId) -> u16 {
        self.base_port + node as u16
    }

    /// Every peer id, excluding our own.
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.num_nodes).filter(|id| *id != self.node_id)
    }
}
