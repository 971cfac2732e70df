//! Transport assembly: shared state, spawn, and the scheduler-facing
//! handle.

use crate::{listener, peer, GossipConfig, LinkPolicy, LinkVerdict, RecentSet};
use forksim_chain::ChainScore;
use forksim_messages::WireMessage;
use forksim_types::{Block, Hash, NodeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Current tip advertisement, embedded in `Hello` frames.
#[derive(Debug, Clone)]
pub struct HelloState {
    pub tip_hash: Hash,
    pub tip_score: ChainScore,
}

/// Everything the transport reports upward.
#[derive(Debug)]
pub enum GossipEvent {
    /// A link to `peer` came up. `inbound` distinguishes the accepted
    /// socket from the dialed one.
    PeerConnected { peer: NodeId, inbound: bool },

    /// A link to `peer` went down.
    PeerDisconnected { peer: NodeId, inbound: bool },

    /// A decoded, link-filtered message. `Ping`/`Pong` never appear here.
    Message { from: NodeId, message: WireMessage },
}

/// A message waiting in a per-peer outbound queue.
pub(crate) struct Queued {
    pub message: WireMessage,
    /// Earliest instant the message may hit the socket. The per-peer
    /// worker clamps this to be non-decreasing so FIFO order survives
    /// uneven delay samples.
    pub send_at: Instant,
}

/// State shared by the listener, the readers and the outbound workers.
pub(crate) struct Shared {
    pub config: GossipConfig,
    pub policy: Arc<dyn LinkPolicy>,
    pub outbound: HashMap<NodeId, mpsc::UnboundedSender<Queued>>,
    pub events: mpsc::UnboundedSender<GossipEvent>,
    pub last_pong: Mutex<HashMap<NodeId, Instant>>,
    pub recent: Mutex<RecentSet>,
    pub hello: watch::Receiver<HelloState>,
    pub shutdown: watch::Receiver<bool>,
}

impl Shared {
    /// Compose a `Hello` from the current tip advertisement.
    pub fn hello_message(&self) -> WireMessage {
        let state = self.hello.borrow().clone();
        WireMessage::Hello {
            node_id: self.config.node_id,
            tip_hash: state.tip_hash,
            tip_score: state.tip_score,
        }
    }

    /// Queue a message for a peer, applying the link policy.
    pub fn send_to(&self, to: NodeId, message: WireMessage) {
        match self.policy.outbound(to) {
            LinkVerdict::Drop => {
                debug!(to, kind = message.kind(), "link policy dropped message");
            }
            LinkVerdict::Deliver { delay } => {
                if let Some(tx) = self.outbound.get(&to) {
                    let _ = tx.send(Queued {
                        message,
                        send_at: Instant::now() + delay,
                    });
                }
            }
        }
    }

    /// Record liveness for a peer (a received `Pong`, or a fresh link).
    pub fn note_pong(&self, peer: NodeId) {
        self.last_pong
            .lock()
            .expect("liveness lock")
            .insert(peer, Instant::now());
    }

    /// Instant of the last recorded liveness signal from a peer.
    pub fn last_pong_at(&self, peer: NodeId) -> Option<Instant> {
        self.last_pong
            .lock()
            .expect("liveness lock")
            .get(&peer)
            .copied()
    }
}

/// Block until the shutdown flag flips.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// The transport entry point.
pub struct GossipTransport;

impl GossipTransport {
    /// Bind this node's listener and spawn every transport task.
    ///
    /// Returns the control handle and the event stream. Failing to bind is
    /// fatal for the node, so the error propagates.
    pub async fn spawn(
        config: GossipConfig,
        policy: Arc<dyn LinkPolicy>,
        hello: watch::Receiver<HelloState>,
    ) -> std::io::Result<(GossipHandle, mpsc::UnboundedReceiver<GossipEvent>)> {
        let addr = format!("127.0.0.1:{}", config.port_of(config.node_id));
        let socket = TcpListener::bind(&addr).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut outbound = HashMap::new();
        let mut queues = Vec::new();
        for peer_id in config.peers() {
            let (tx, rx) = mpsc::unbounded_channel();
            outbound.insert(peer_id, tx);
            queues.push((peer_id, rx));
        }

        let recent = RecentSet::new(config.recent_capacity);
        let shared = Arc::new(Shared {
            config,
            policy,
            outbound,
            events: events_tx,
            last_pong: Mutex::new(HashMap::new()),
            recent: Mutex::new(recent),
            hello,
            shutdown: shutdown_rx,
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(listener::accept_loop(
            Arc::clone(&shared),
            socket,
        )));
        for (peer_id, rx) in queues {
            tasks.push(tokio::spawn(peer::outbound_loop(
                Arc::clone(&shared),
                peer_id,
                rx,
            )));
        }

        let handle = GossipHandle {
            shared,
            shutdown: shutdown_tx,
            tasks,
        };
        Ok((handle, events_rx))
    }
}

/// Scheduler-facing transport handle.
pub struct GossipHandle {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl GossipHandle {
    /// Queue a message for one peer.
    pub fn send_to(&self, to: NodeId, message: WireMessage) {
        self.shared.send_to(to, message);
    }

    /// Flood a block to every peer except `except` (the sender it arrived
    /// from). Returns `false` if the hash was suppressed as recently
    /// broadcast.
    pub fn broadcast_block(&self, block: &Block, except: Option<NodeId>) -> bool {
        if !self
            .shared
            .recent
            .lock()
            .expect("recent lock")
            .insert(block.hash)
        {
            return false;
        }
        for peer_id in self.shared.config.peers() {
            if Some(peer_id) == except {
                continue;
            }
            self.shared.send_to(
                peer_id,
                WireMessage::Block {
                    block: block.clone(),
                },
            );
        }
        true
    }

    /// Send the current `Hello` to every peer. Called after a heal so both
    /// sides of a former partition can start catch-up.
    pub fn announce_tip(&self) {
        let hello = self.shared.hello_message();
        for peer_id in self.shared.config.peers() {
            self.shared.send_to(peer_id, hello.clone());
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.shared.config.node_id
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.shared.config.peers().collect()
    }

    /// Stop every transport task.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}
