//! Unit behaviour and whole-simulation configuration

use serde::{Deserialize, Serialize};
use services_registry::DiscoveryConfig;
use services_storage::StorageConfig;
use sim_kernel::{SchedulerConfig, TimerConfig};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// How a managed unit behaves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    /// Iterations before the unit terminates
    pub max_iterations: u32,
    /// Duration of one unit of simulated work
    pub work_ms: u64,
    /// Chance per iteration of issuing a blocking request
    pub block_probability: f64,
    /// Base seed for the per-unit RNG; unit `i` uses `seed + i`
    pub seed: Option<u64>,
    /// Give up waiting for a resume after this long
    pub resume_timeout_ms: Option<u64>,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            work_ms: 1_000,
            block_probability: 0.25,
            seed: None,
            resume_timeout_ms: None,
        }
    }
}

impl UnitConfig {
    pub fn work(&self) -> Duration {
        Duration::from_millis(self.work_ms)
    }

    /// RNG seed for the unit in slot `index`
    pub fn seed_for(&self, index: usize) -> Option<u64> {
        self.seed.map(|seed| seed.wrapping_add(index as u64))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.block_probability) {
            return Err(ConfigError::Invalid(format!(
                "block_probability {} is outside [0, 1]",
                self.block_probability
            )));
        }
        Ok(())
    }
}

/// Everything needed to run one simulation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub scheduler: SchedulerConfig,
    pub timer: TimerConfig,
    pub unit: UnitConfig,
    pub discovery: DiscoveryConfig,
    pub storage: StorageConfig,
}

/// Errors related to loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl SimulationConfig {
    /// Defaults with the discovery handle and state files placed in `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            discovery: DiscoveryConfig::in_dir(dir),
            storage: StorageConfig {
                state_dir: dir.to_path_buf(),
                ..StorageConfig::default()
            },
            ..Self::default()
        }
    }

    /// Loads a JSON config; missing fields keep their defaults
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path.as_ref())
            .map_err(|err| ConfigError::Io(format!("{}: {}", path.as_ref().display(), err)))?;
        let config: SimulationConfig =
            serde_json::from_str(&data).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        self.timer
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        self.unit.validate()?;
        if self.discovery.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "discovery max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
