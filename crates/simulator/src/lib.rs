//! Per-node run assembly.
//!
//! Loads the consensus configuration, builds the engine and scenario
//! controller for this node, and drives the node through its run budget.
//! One process per node; the cluster is just N invocations of the same
//! binary with different `--node-id`s.

mod config;

pub use config::{
    load_hybrid_config, load_pow_config, load_scenario_config, ConfigError, HybridConfig,
    PowConfig,
};

use forksim_consensus::{HybridEngine, LeaderSchedule, PowEngine};
use forksim_node::{NodeConfig, NodeError, NodeHandle};
use forksim_scenario::{ScenarioController, ScenarioKind};
use forksim_types::NodeId;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Which engine a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusKind {
    Pow,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown consensus {0:?}, expected \"pow\" or \"hybrid\"")]
pub struct UnknownConsensus(String);

impl FromStr for ConsensusKind {
    type Err = UnknownConsensus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pow" => Ok(ConsensusKind::Pow),
            "hybrid" => Ok(ConsensusKind::Hybrid),
            other => Err(UnknownConsensus(other.to_string())),
        }
    }
}

/// Everything the binary parses from its command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub node_id: NodeId,
    pub consensus: ConsensusKind,
    pub scenario: ScenarioKind,
    pub seed: u64,
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
    pub duration: Duration,
    pub base_port: u16,
}

/// Why a run failed.
#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Node(#[from] NodeError),
}

/// Run one node to completion.
pub async fn run_node(options: RunOptions) -> Result<(), SimulatorError> {
    let scenario_config = load_scenario_config(&options.config_dir)?;

    match options.consensus {
        ConsensusKind::Pow => {
            let config = load_pow_config(&options.config_dir)?;
            let num_nodes = config.num_nodes();
            check_node_id(options.node_id, num_nodes)?;

            let node_config = node_config(&options, num_nodes)
                .with_finality_depth(config.finality_depth)
                .with_block_time(Duration::from_millis(config.block_time_ms))
                .with_initial_balances(config.initial_balances.clone());
            let engine = Arc::new(PowEngine::new(options.node_id, config.difficulty));
            let scenario = ScenarioController::new(
                options.scenario,
                &scenario_config,
                options.seed,
                options.node_id,
                num_nodes,
            );

            info!(difficulty = config.difficulty, num_nodes, "starting pow node");
            let mut handle = NodeHandle::spawn(node_config, engine, scenario).await?;
            handle.run_for(options.duration).await?;
        }
        ConsensusKind::Hybrid => {
            let config = load_hybrid_config(&options.config_dir)?;
            let num_nodes = config.num_nodes();
            check_node_id(options.node_id, num_nodes)?;

            let schedule = LeaderSchedule::new(config.stakes.clone())
                .map_err(|err| ConfigError::Invalid(err.to_string()))?;
            let node_config = node_config(&options, num_nodes)
                .with_block_time(Duration::from_millis(config.block_time_ms));
            let engine = Arc::new(HybridEngine::new(
                options.node_id,
                schedule,
                config.light_difficulty,
                config.leader_timeout_ms,
            ));
            let scenario = ScenarioController::new(
                options.scenario,
                &scenario_config,
                options.seed,
                options.node_id,
                num_nodes,
            );

            info!(
                light_difficulty = config.light_difficulty,
                leader_timeout_ms = config.leader_timeout_ms,
                num_nodes,
                "starting hybrid node"
            );
            let mut handle = NodeHandle::spawn(node_config, engine, scenario).await?;
            handle.run_for(options.duration).await?;
        }
    }
    Ok(())
}

fn node_config(options: &RunOptions, num_nodes: u32) -> NodeConfig {
    NodeConfig::new(options.node_id, num_nodes)
        .with_seed(options.seed)
        .with_base_port(options.base_port)
        .with_log_dir(options.log_dir.clone())
}

fn check_node_id(node_id: NodeId, num_nodes: u32) -> Result<(), ConfigError> {
    if node_id >= num_nodes {
        return Err(ConfigError::Invalid(format!(
            "node id {node_id} out of range for a {num_nodes} node cluster"
        )));
    }
    Ok(())
}
