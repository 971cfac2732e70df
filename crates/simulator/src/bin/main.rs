//! Forksim node CLI.
//!
//! One process per node; start N of them to form a cluster:
//!
//! ```bash
//! forksim-node --node-id 0 --consensus pow --scenario delays
//! forksim-node --node-id 1 --consensus pow --scenario delays
//! ...
//! ```
//!
//! Exit code 0 on a clean run, 1 on configuration or I/O failure, 2 on a
//! finality safety violation.

use clap::Parser;
use forksim_scenario::ScenarioKind;
use forksim_simulator::{run_node, ConsensusKind, RunOptions, SimulatorError};
use forksim_node::NodeError;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "forksim-node")]
#[command(version, about = "Blockchain consensus simulator node", long_about = None)]
struct Args {
    /// This node's identity, an integer in [0, N).
    #[arg(long)]
    node_id: u32,

    /// Consensus algorithm: pow or hybrid.
    #[arg(long)]
    consensus: ConsensusKind,

    /// Network scenario: delays or partition.
    #[arg(long)]
    scenario: ScenarioKind,

    /// Shared run seed.
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Directory holding pow_config.json / hybrid_config.json.
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Diagnostic log level (DEBUG, INFO, WARN, ERROR).
    #[arg(long, default_value = "INFO")]
    log_level: String,

    /// Run budget in seconds.
    #[arg(long, default_value = "30")]
    duration: u64,

    /// Listener port of node 0; node i listens on base_port + i.
    #[arg(long, default_value = "9000")]
    base_port: u16,

    /// Directory for the structured event logs.
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_lowercase())),
        )
        .init();

    let options = RunOptions {
        node_id: args.node_id,
        consensus: args.consensus,
        scenario: args.scenario,
        seed: args.seed,
        config_dir: args.config_dir,
        log_dir: args.log_dir,
        duration: Duration::from_secs(args.duration),
        base_port: args.base_port,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");

    match runtime.block_on(run_node(options)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(SimulatorError::Config(err)) => {
            eprintln!("configuration error: {err}");
            ExitCode::from(1)
        }
        Err(SimulatorError::Node(NodeError::Safety(violation))) => {
            eprintln!("safety violation: {violation}");
            ExitCode::from(2)
        }
        Err(SimulatorError::Node(err)) => {
            eprintln!("node failed: {err}");
            ExitCode::from(1)
        }
    }
}
