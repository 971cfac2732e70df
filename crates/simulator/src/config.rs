//! Configuration files.
//!
//! A run reads `<consensus>_config.json` from the config directory, plus an
//! optional `network_config.json` for scenario tuning. A broken or
//! inconsistent configuration refuses to start the node.

use forksim_scenario::ScenarioConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration problems that abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// `pow_config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowConfig {
    /// Leading zero nibbles required of a block hash.
    pub difficulty: u32,

    /// Pacing between successful productions.
    pub block_time_ms: u64,

    /// Burial depth for finality.
    pub finality_depth: u64,

    /// Starting balance per node; the table length fixes the cluster size.
    pub initial_balances: Vec<u64>,
}

impl Default for PowConfig {
    fn default() -> Self {
        Self {
            difficulty: 4,
            block_time_ms: 2_000,
            finality_depth: 4,
            initial_balances: vec![1_000; 5],
        }
    }
}

impl PowConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_balances.is_empty() {
            return Err(ConfigError::Invalid(
                "initial_balances must name at least one node".into(),
            ));
        }
        if self.difficulty > 16 {
            return Err(ConfigError::Invalid(format!(
                "difficulty {} would never terminate",
                self.difficulty
            )));
        }
        Ok(())
    }

    pub fn num_nodes(&self) -> u32 {
        self.initial_balances.len() as u32
    }
}

/// `hybrid_config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    /// Leading zero nibbles for the light proof of work.
    pub light_difficulty: u32,

    /// Pacing between successful productions.
    pub block_time_ms: u64,

    /// Stake per node; the table length fixes the cluster size.
    pub stakes: Vec<u64>,

    /// How long a node waits for the elected leader before proposing
    /// itself.
    pub leader_timeout_ms: u64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            light_difficulty: 2,
            block_time_ms: 1_000,
            stakes: vec![200, 300, 150, 250, 100],
            leader_timeout_ms: 1_000,
        }
    }
}

impl HybridConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.stakes.is_empty() {
            return Err(ConfigError::Invalid("stakes must not be empty".into()));
        }
        if self.stakes.iter().sum::<u64>() == 0 {
            return Err(ConfigError::Invalid("total stake is zero".into()));
        }
        if self.leader_timeout_ms == 0 {
            return Err(ConfigError::Invalid("leader_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn num_nodes(&self) -> u32 {
        self.stakes.len() as u32
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load and validate `pow_config.json`.
pub fn load_pow_config(dir: &Path) -> Result<PowConfig, ConfigError> {
    let config: PowConfig = read_json(&dir.join("pow_config.json"))?;
    config.validate()?;
    Ok(config)
}

/// Load and validate `hybrid_config.json`.
pub fn load_hybrid_config(dir: &Path) -> Result<HybridConfig, ConfigError> {
    let config: HybridConfig = read_json(&dir.join("hybrid_config.json"))?;
    config.validate()?;
    Ok(config)
}

/// Load `network_config.json` if present, defaults otherwise.
pub fn load_scenario_config(dir: &Path) -> Result<ScenarioConfig, ConfigError> {
    let path = dir.join("network_config.json");
    if !path.exists() {
        return Ok(ScenarioConfig::default());
    }
    let config: ScenarioConfig = read_json(&path)?;
    if config.delay_min_ms > config.delay_max_ms {
        return Err(ConfigError::Invalid(format!(
            "delay bounds are inverted: [{}, {}]",
            config.delay_min_ms, config.delay_max_ms
        )));
    }
    Ok(config)
}
