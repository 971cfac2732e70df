//! Node assembly and the scheduler tasks.

use crate::{events::EventLog, txgen, TxPool};
use forksim_chain::{ChainStore, ConsensusRules, InsertOutcome, SafetyViolation};
use forksim_consensus::{CancelToken, ConsensusEngine};
use forksim_gossip::{GossipConfig, GossipEvent, GossipHandle, GossipTransport, HelloState};
use forksim_messages::WireMessage;
use forksim_scenario::ScenarioController;
use forksim_types::{unix_millis, Block, Hash, NodeId};
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// How often an idle producer re-evaluates `can_propose`.
const PROPOSAL_RECHECK: Duration = Duration::from_millis(50);

/// Per-node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub num_nodes: u32,
    pub base_port: u16,
    pub seed: u64,
    pub finality_depth: u64,

    /// Pacing between successful production attempts.
    pub block_time: Duration,

    /// Transaction cap per produced block.
    pub max_block_transactions: usize,

    /// Cadence of the synthetic transaction generator.
    pub tx_interval: Duration,

    /// Starting balances for the ledger audit.
    pub initial_balances: Vec<u64>,

    /// Directory for the structured event log.
    pub log_dir: PathBuf,
}

impl NodeConfig {
    pub fn new(node_id: NodeId, num_nodes: u32) -> Self {
        Self {
            node_id,
            num_nodes,
            base_port: 9000,
            seed: 42,
            finality_depth: 4,
            block_time: Duration::from_millis(2_000),
            max_block_transactions: 10,
            tx_interval: Duration::from_millis(1_000),
            initial_balances: vec![1_000; num_nodes as usize],
            log_dir: PathBuf::from("logs"),
        }
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_finality_depth(mut self, depth: u64) -> Self {
        self.finality_depth = depth;
        self
    }

    pub fn with_block_time(mut self, block_time: Duration) -> Self {
        self.block_time = block_time;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_initial_balances(mut self, balances: Vec<u64>) -> Self {
        self.initial_balances = balances;
        self
    }
}

/// Why a node stopped abnormally.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("transport: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Safety(#[from] SafetyViolation),
}

/// State shared by every scheduler task.
struct Ctx {
    config: NodeConfig,
    store: Mutex<ChainStore>,
    gossip: GossipHandle,
    events: EventLog,
    tip_tx: watch::Sender<Hash>,
    hello_tx: watch::Sender<HelloState>,
    fatal_tx: watch::Sender<Option<SafetyViolation>>,
}

/// A running node.
///
/// Dropping the handle does not stop the node; call
/// [`NodeHandle::run_for`] to drive it to the end of its run budget (or to
/// a fatal safety violation, whichever comes first).
pub struct NodeHandle {
    ctx: Arc<Ctx>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    fatal_rx: watch::Receiver<Option<SafetyViolation>>,
}

impl NodeHandle {
    /// Build and start a node: bind the listener, start dialing peers and
    /// spawn every scheduler task.
    pub async fn spawn<E: ConsensusEngine + 'static>(
        config: NodeConfig,
        engine: Arc<E>,
        scenario: ScenarioController,
    ) -> Result<NodeHandle, NodeError> {
        let events = EventLog::open(&config.log_dir, config.node_id)?;

        let rules: Arc<dyn ConsensusRules> = Arc::clone(&engine) as Arc<dyn ConsensusRules>;
        let store = ChainStore::new(rules, config.finality_depth);
        let genesis = store.current_tip();
        let genesis_score = store.tip_score();

        let (tip_tx, tip_rx) = watch::channel(genesis);
        let (hello_tx, hello_rx) = watch::channel(HelloState {
            tip_hash: genesis,
            tip_score: genesis_score,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = watch::channel(None);

        let scenario = Arc::new(scenario);
        let gossip_config =
            GossipConfig::new(config.node_id, config.num_nodes).with_base_port(config.base_port);
        let (gossip, gossip_events) =
            GossipTransport::spawn(gossip_config, scenario.policy(), hello_rx).await?;

        let ctx = Arc::new(Ctx {
            config: config.clone(),
            store: Mutex::new(store),
            gossip,
            events,
            tip_tx,
            hello_tx,
            fatal_tx,
        });

        info!(
            node_id = config.node_id,
            consensus = engine.name(),
            seed = config.seed,
            "node started"
        );
        ctx.events.emit(
            "startup",
            json!({
                "consensus": engine.name(),
                "seed": config.seed,
                "num_nodes": config.num_nodes,
                "finality_depth": config.finality_depth,
            }),
        );
        if let Some(groups) = scenario.partition_groups() {
            ctx.events
                .emit("partition_start", json!({ "groups": groups }));
        }

        let pool = Arc::new(TxPool::new());
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(inbound_loop(
            Arc::clone(&ctx),
            gossip_events,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(production_loop(
            Arc::clone(&ctx),
            engine,
            Arc::clone(&pool),
            tip_rx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(txgen::generate_loop(
            pool,
            config.seed,
            config.node_id,
            config.num_nodes,
            config.tx_interval,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(monitor_loop(
            Arc::clone(&ctx),
            shutdown_rx.clone(),
        )));
        if let Some(heal_after) = scenario.heal_after() {
            tasks.push(tokio::spawn(heal_loop(
                Arc::clone(&ctx),
                Arc::clone(&scenario),
                heal_after,
                shutdown_rx,
            )));
        }

        Ok(NodeHandle {
            ctx,
            tasks,
            shutdown_tx,
            fatal_rx,
        })
    }

    /// Run until the budget expires or a safety violation fires, then shut
    /// everything down.
    pub async fn run_for(&mut self, duration: Duration) -> Result<(), NodeError> {
        let fatal = tokio::select! {
            _ = sleep(duration) => None,
            violation = wait_fatal(&mut self.fatal_rx) => Some(violation),
        };
        self.stop().await;
        match fatal {
            Some(violation) => Err(NodeError::Safety(violation)),
            None => Ok(()),
        }
    }

    async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.ctx.gossip.shutdown();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.ctx.events.emit("shutdown", json!({}));
        self.ctx.events.flush();
        info!(node_id = self.ctx.config.node_id, "node stopped");
    }

    pub fn node_id(&self) -> NodeId {
        self.ctx.config.node_id
    }

    pub fn current_tip(&self) -> Hash {
        self.ctx.store.lock().expect("chain store lock").current_tip()
    }

    pub fn final_height(&self) -> u64 {
        self.ctx.store.lock().expect("chain store lock").final_height()
    }

    pub fn finalized_entries(&self) -> Vec<(u64, Hash)> {
        self.ctx
            .store
            .lock()
            .expect("chain store lock")
            .finalized_entries()
            .collect()
    }

    pub fn best_chain(&self) -> Vec<Block> {
        self.ctx.store.lock().expect("chain store lock").best_chain()
    }

    pub fn block_count(&self) -> usize {
        self.ctx.store.lock().expect("chain store lock").block_count()
    }
}

/// Block until the shutdown flag flips.
async fn wait_flag(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Resolve with the violation once one is recorded; never resolves
/// otherwise.
async fn wait_fatal(rx: &mut watch::Receiver<Option<SafetyViolation>>) -> SafetyViolation {
    loop {
        if let Some(violation) = rx.borrow_and_update().clone() {
            return violation;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Offer a block to the store and act on the outcome.
///
/// `from` is the peer the block arrived from, `None` for locally produced
/// blocks. Returns the violation if this insert broke the finality
/// invariant; the caller must stop processing.
fn handle_block(ctx: &Ctx, block: Block, from: Option<NodeId>) -> Result<(), SafetyViolation> {
    let height = block.height;
    let hash = block.hash;
    if let Some(from) = from {
        ctx.events.emit(
            "block_received",
            json!({ "height": height, "hash": hash, "from": from }),
        );
    }

    let result = {
        let mut store = ctx.store.lock().expect("chain store lock");
        store.insert(block.clone())
    };
    let report = match result {
        Ok(report) => report,
        Err(violation) => {
            error!(
                height = violation.height,
                existing = %violation.existing,
                incoming = %violation.incoming,
                "finality conflict, halting"
            );
            ctx.events.emit(
                "safety_violation",
                json!({
                    "height": violation.height,
                    "existing": violation.existing,
                    "incoming": violation.incoming,
                }),
            );
            ctx.events.flush();
            let _ = ctx.fatal_tx.send(Some(violation.clone()));
            return Err(violation);
        }
    };

    match report.outcome {
        InsertOutcome::Accepted => {
            ctx.events.emit(
                "block_accepted",
                json!({ "height": height, "hash": hash, "proposer": block.proposer_id }),
            );
            ctx.gossip.broadcast_block(&block, from);

            if let Some(change) = report.tip_change {
                debug!(old = %change.old.short(), new = %change.new.short(), "tip changed");
                ctx.events
                    .emit("tip_changed", json!({ "old": change.old, "new": change.new }));
                if let Some(reorg) = &report.reorg {
                    warn!(
                        ancestor_height = reorg.ancestor_height,
                        old_tip = %reorg.old_tip.short(),
                        new_tip = %reorg.new_tip.short(),
                        "reorganisation"
                    );
                    ctx.events.emit(
                        "reorg",
                        json!({
                            "ancestor_height": reorg.ancestor_height,
                            "old_tip": reorg.old_tip,
                            "new_tip": reorg.new_tip,
                        }),
                    );
                }
                for (final_height, final_hash) in &report.finalized {
                    ctx.events.emit(
                        "finalized",
                        json!({ "height": final_height, "hash": final_hash }),
                    );
                }
                let _ = ctx.tip_tx.send(change.new);
                let _ = ctx.hello_tx.send(HelloState {
                    tip_hash: change.new,
                    tip_score: change.new_score,
                });
            }
        }
        InsertOutcome::Orphaned { missing_parent } => {
            debug!(
                hash = %hash.short(),
                missing = %missing_parent.short(),
                "orphan parked, requesting parent"
            );
            if let Some(from) = from {
                ctx.gossip.send_to(
                    from,
                    WireMessage::GetBlock {
                        hash: missing_parent,
                    },
                );
            }
        }
        InsertOutcome::Duplicate => {}
        InsertOutcome::Invalid { reason } => {
            warn!(hash = %hash.short(), %reason, "block rejected");
            ctx.events.emit(
                "block_rejected",
                json!({ "height": height, "hash": hash, "reason": reason.to_string() }),
            );
        }
    }
    Ok(())
}

/// Dispatch transport events into the store.
async fn inbound_loop(
    ctx: Arc<Ctx>,
    mut gossip_events: mpsc::UnboundedReceiver<GossipEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = wait_flag(&mut shutdown) => return,
            event = gossip_events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        match event {
            GossipEvent::PeerConnected { peer, inbound } => {
                ctx.events.emit(
                    "peer_connected",
                    json!({ "peer": peer, "direction": if inbound { "in" } else { "out" } }),
                );
            }
            GossipEvent::PeerDisconnected { peer, inbound } => {
                ctx.events.emit(
                    "peer_disconnected",
                    json!({ "peer": peer, "direction": if inbound { "in" } else { "out" } }),
                );
            }
            GossipEvent::Message { from, message } => match message {
                WireMessage::Block { block } => {
                    if handle_block(&ctx, block, Some(from)).is_err() {
                        return;
                    }
                }
                WireMessage::Blocks { blocks } => {
                    debug!(from, count = blocks.len(), "catch-up batch");
                    for block in blocks {
                        if handle_block(&ctx, block, Some(from)).is_err() {
                            return;
                        }
                    }
                }
                WireMessage::GetBlock { hash } => {
                    let chain = {
                        let store = ctx.store.lock().expect("chain store lock");
                        store.chain_to(&hash)
                    };
                    match chain {
                        Some(blocks) => {
                            ctx.gossip.send_to(from, WireMessage::Blocks { blocks });
                        }
                        None => {
                            debug!(from, hash = %hash.short(), "get_block for unknown hash");
                        }
                    }
                }
                WireMessage::Hello {
                    node_id,
                    tip_hash,
                    tip_score,
                } => {
                    let (known, ours) = {
                        let store = ctx.store.lock().expect("chain store lock");
                        (store.contains(&tip_hash), store.tip_score())
                    };
                    if !known && tip_score > ours {
                        debug!(peer = node_id, tip = %tip_hash.short(), "peer is ahead, requesting tip");
                        ctx.gossip
                            .send_to(from, WireMessage::GetBlock { hash: tip_hash });
                    }
                }
                // Liveness traffic never leaves the transport.
                WireMessage::Ping { .. } | WireMessage::Pong { .. } => {}
            },
        }
    }
}

/// Drive block production against the current tip.
async fn production_loop<E: ConsensusEngine + 'static>(
    ctx: Arc<Ctx>,
    engine: Arc<E>,
    pool: Arc<TxPool>,
    mut tip_rx: watch::Receiver<Hash>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_tip = *tip_rx.borrow_and_update();
    let mut tip_seen_ms = unix_millis();

    loop {
        if *shutdown.borrow() {
            return;
        }
        let tip_hash = *tip_rx.borrow_and_update();
        if tip_hash != last_tip {
            last_tip = tip_hash;
            tip_seen_ms = unix_millis();
        }
        let tip = {
            let store = ctx.store.lock().expect("chain store lock");
            store.get(&tip_hash).cloned()
        };
        let Some(tip) = tip else {
            sleep(PROPOSAL_RECHECK).await;
            continue;
        };

        if !engine.can_propose(&tip, unix_millis(), tip_seen_ms) {
            tokio::select! {
                _ = wait_flag(&mut shutdown) => return,
                _ = tip_rx.changed() => {}
                _ = sleep(PROPOSAL_RECHECK) => {}
            }
            continue;
        }

        let txs = pool.take(ctx.config.max_block_transactions);
        let cancel = CancelToken::new();
        let mut worker = {
            let engine = Arc::clone(&engine);
            let tip = tip.clone();
            let txs = txs.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || engine.produce(&tip, txs, unix_millis(), &cancel))
        };

        tokio::select! {
            _ = wait_flag(&mut shutdown) => {
                cancel.cancel();
                let _ = (&mut worker).await;
                return;
            }
            _ = tip_rx.changed() => {
                // A better tip arrived; abandon this attempt.
                cancel.cancel();
                let _ = (&mut worker).await;
                pool.requeue(txs);
            }
            produced = &mut worker => {
                match produced {
                    Ok(Some(block)) => {
                        info!(
                            height = block.height,
                            hash = %block.hash.short(),
                            transactions = block.transactions.len(),
                            "block produced"
                        );
                        ctx.events.emit(
                            "block_created",
                            json!({
                                "height": block.height,
                                "hash": block.hash,
                                "transactions": block.transactions.len(),
                            }),
                        );
                        if handle_block(&ctx, block, None).is_err() {
                            return;
                        }
                        tokio::select! {
                            _ = wait_flag(&mut shutdown) => return,
                            _ = sleep(ctx.config.block_time) => {}
                        }
                    }
                    Ok(None) => pool.requeue(txs),
                    Err(err) => {
                        warn!(%err, "production worker failed");
                        pool.requeue(txs);
                    }
                }
            }
        }
    }
}

/// Periodic chain status at INFO.
async fn monitor_loop(ctx: Arc<Ctx>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = wait_flag(&mut shutdown) => return,
            _ = tick.tick() => {
                let (height, tip, final_height, blocks) = {
                    let store = ctx.store.lock().expect("chain store lock");
                    (
                        store.tip_block().height,
                        store.current_tip(),
                        store.final_height(),
                        store.block_count(),
                    )
                };
                info!(height, tip = %tip.short(), final_height, blocks, "chain status");
            }
        }
    }
}

/// Lift the partition at the heal instant and kick off catch-up.
async fn heal_loop(
    ctx: Arc<Ctx>,
    scenario: Arc<ScenarioController>,
    heal_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = wait_flag(&mut shutdown) => return,
        _ = sleep(heal_after) => {}
    }
    if scenario.heal() {
        info!("partition healed, announcing tip");
        ctx.events.emit("partition_heal", json!({}));
        ctx.gossip.announce_tip();
    }
}
