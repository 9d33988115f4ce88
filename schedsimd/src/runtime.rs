//! # Host Runtime
//!
//! Resolves the configuration and drives one simulation from start to
//! shutdown.

use services_logger::LogFacadeSink;
use services_process_manager::{
    ConfigError, ProcessManager, ProcessManagerError, SimulationConfig, SimulationReport,
};
use services_registry::discovery::DEFAULT_HANDLE_NAME;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Host runtime error types
#[derive(Debug, Error)]
pub enum HostRuntimeError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Process manager error: {0}")]
    ProcessManagerError(#[from] ProcessManagerError),

    #[error("Simulation failed: {}", .0.join("; "))]
    SimulationFailed(Vec<String>),
}

/// Command-line adjustments applied on top of the loaded config
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub units: Option<usize>,
    pub slice_ms: Option<u64>,
    pub io_ms: Option<u64>,
    pub work_ms: Option<u64>,
    pub max_iterations: Option<u32>,
    pub seed: Option<u64>,
    /// Directory for the discovery handle and the state files
    pub state_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Applies every set override to `config`
    pub fn apply(&self, config: &mut SimulationConfig) {
        if let Some(units) = self.units {
            config.scheduler.unit_count = units;
        }
        if let Some(slice_ms) = self.slice_ms {
            config.timer.slice_interval_ms = slice_ms;
        }
        if let Some(io_ms) = self.io_ms {
            config.timer.io_interval_ms = io_ms;
        }
        if let Some(work_ms) = self.work_ms {
            config.unit.work_ms = work_ms;
        }
        if let Some(max_iterations) = self.max_iterations {
            config.unit.max_iterations = max_iterations;
        }
        if let Some(seed) = self.seed {
            config.unit.seed = Some(seed);
        }
        if let Some(dir) = &self.state_dir {
            config.discovery.handle_path = dir.join(DEFAULT_HANDLE_NAME);
            config.storage.state_dir = dir.clone();
        }
    }
}

/// Host runtime configuration
#[derive(Debug, Clone, Default)]
pub struct HostRuntimeConfig {
    /// Optional JSON simulation config
    pub config_path: Option<PathBuf>,
    /// Flags applied after the file is loaded
    pub overrides: ConfigOverrides,
    /// Stop after this long even if units are still running
    pub duration_ms: Option<u64>,
}

impl HostRuntimeConfig {
    /// Loads the config file (or defaults), applies overrides and validates
    pub fn resolve(&self) -> Result<SimulationConfig, HostRuntimeError> {
        let mut config = match &self.config_path {
            Some(path) => SimulationConfig::load_from_path(path)?,
            None => SimulationConfig::default(),
        };
        self.overrides.apply(&mut config);
        config.validate()?;
        Ok(config)
    }
}

/// Host runtime
pub struct HostRuntime {
    /// Fully resolved simulation config
    simulation: SimulationConfig,
    /// Run limit
    duration: Option<Duration>,
}

impl HostRuntime {
    /// Creates a new host runtime; configuration errors surface here
    pub fn new(config: HostRuntimeConfig) -> Result<Self, HostRuntimeError> {
        Ok(Self {
            simulation: config.resolve()?,
            duration: config.duration_ms.map(Duration::from_millis),
        })
    }

    pub fn simulation_config(&self) -> &SimulationConfig {
        &self.simulation
    }

    /// Runs until every unit finishes or the duration elapses
    pub fn run(&mut self) -> Result<SimulationReport, HostRuntimeError> {
        log::info!(
            "starting simulation: {} units, slice {} ms, io {} ms",
            self.simulation.scheduler.unit_count,
            self.simulation.timer.slice_interval_ms,
            self.simulation.timer.io_interval_ms
        );

        let manager = ProcessManager::start(self.simulation.clone(), Arc::new(LogFacadeSink))?;
        if !manager.wait_until_finished(self.duration) {
            log::info!("run limit reached or kernel stopped; shutting down");
        }
        let report = manager.shutdown();

        log::info!(
            "simulation finished: {}/{} units completed",
            report.completed_units(),
            report.units.len()
        );
        if !report.is_success() {
            return Err(HostRuntimeError::SimulationFailed(report.failures));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    #[test]
    fn test_defaults_resolve() {
        let config = HostRuntimeConfig::default().resolve().unwrap();
        assert_eq!(config, SimulationConfig::default());
    }

    #[test]
    fn test_overrides_apply_after_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.json");
        fs::write(
            &path,
            r#"{ "scheduler": { "unit_count": 5 }, "timer": { "slice_interval_ms": 200, "io_interval_ms": 600 } }"#,
        )
        .unwrap();

        let host = HostRuntimeConfig {
            config_path: Some(path),
            overrides: ConfigOverrides {
                units: Some(4),
                io_ms: Some(900),
                state_dir: Some(dir.path().to_path_buf()),
                ..ConfigOverrides::default()
            },
            duration_ms: None,
        };
        let config = host.resolve().unwrap();

        assert_eq!(config.scheduler.unit_count, 4);
        assert_eq!(config.timer.slice_interval_ms, 200);
        assert_eq!(config.timer.io_interval_ms, 900);
        assert_eq!(config.storage.state_dir, dir.path());
        assert_eq!(config.discovery.handle_path, dir.path().join("kernel_pid"));
    }

    #[test]
    fn test_invalid_override_rejected() {
        let host = HostRuntimeConfig {
            overrides: ConfigOverrides {
                slice_ms: Some(500),
                io_ms: Some(100),
                ..ConfigOverrides::default()
            },
            ..HostRuntimeConfig::default()
        };
        assert!(matches!(
            HostRuntime::new(host),
            Err(HostRuntimeError::ConfigError(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn test_missing_config_file() {
        let host = HostRuntimeConfig {
            config_path: Some(Path::new("/nonexistent/sim.json").to_path_buf()),
            ..HostRuntimeConfig::default()
        };
        assert!(matches!(
            host.resolve(),
            Err(HostRuntimeError::ConfigError(ConfigError::Io(_)))
        ));
    }

    #[test]
    fn test_short_run_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let host = HostRuntimeConfig {
            config_path: None,
            overrides: ConfigOverrides {
                units: Some(2),
                slice_ms: Some(5),
                io_ms: Some(15),
                work_ms: Some(2),
                max_iterations: Some(3),
                seed: Some(3),
                state_dir: Some(dir.path().to_path_buf()),
            },
            duration_ms: Some(20_000),
        };

        let mut runtime = HostRuntime::new(host).unwrap();
        let report = runtime.run().unwrap();
        assert_eq!(report.completed_units(), 2);
        assert!(!dir.path().join("kernel_pid").exists());
    }
}
