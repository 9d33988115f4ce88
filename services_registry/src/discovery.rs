//! Discovery handle: the kernel's published identity on disk

use core_types::KernelId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HANDLE_NAME: &str = "kernel_pid";

/// Discovery configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Location of the handle file
    pub handle_path: PathBuf,
    /// Delay between polls while the handle is missing
    pub poll_interval_ms: u64,
    /// Polls before giving up
    pub max_attempts: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            handle_path: PathBuf::from(DEFAULT_HANDLE_NAME),
            poll_interval_ms: 100,
            max_attempts: 100,
        }
    }
}

impl DiscoveryConfig {
    /// Default configuration with the handle placed in `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            handle_path: dir.as_ref().join(DEFAULT_HANDLE_NAME),
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Discovery handle I/O error at {path}: {message}")]
    Io { path: String, message: String },

    #[error("Kernel not discovered at {path} after {attempts} attempts")]
    Timeout { path: String, attempts: u32 },

    #[error("Service registry unavailable")]
    RegistryUnavailable,
}

/// The well-known handle through which a kernel publishes its identity
#[derive(Debug, Clone)]
pub struct DiscoveryHandle {
    config: DiscoveryConfig,
}

impl DiscoveryHandle {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config.handle_path
    }

    /// Publishes `id`, replacing any value left by a previous run
    pub fn publish(&self, id: KernelId) -> Result<(), DiscoveryError> {
        self.remove()?;
        fs::write(self.path(), format!("{}\n", id)).map_err(|err| self.io_error(err))
    }

    /// Reads the handle once
    ///
    /// A missing handle, or one whose contents do not parse yet (a writer
    /// may be mid-write), reads as `None`.
    pub fn try_read(&self) -> Result<Option<KernelId>, DiscoveryError> {
        match fs::read_to_string(self.path()) {
            Ok(text) => Ok(text.parse().ok()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(self.io_error(err)),
        }
    }

    /// Polls the handle until it appears or the attempt budget runs out
    pub fn lookup_with_retry(&self) -> Result<KernelId, DiscoveryError> {
        for _ in 0..self.config.max_attempts {
            if let Some(id) = self.try_read()? {
                return Ok(id);
            }
            thread::sleep(self.config.poll_interval());
        }
        Err(DiscoveryError::Timeout {
            path: self.path().display().to_string(),
            attempts: self.config.max_attempts,
        })
    }

    /// Removes the handle; a missing handle is not an error
    pub fn remove(&self) -> Result<(), DiscoveryError> {
        match fs::remove_file(self.path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(err)),
        }
    }

    fn io_error(&self, err: std::io::Error) -> DiscoveryError {
        DiscoveryError::Io {
            path: self.path().display().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_in(dir: &Path) -> DiscoveryHandle {
        let mut config = DiscoveryConfig::in_dir(dir);
        config.poll_interval_ms = 1;
        config.max_attempts = 5;
        DiscoveryHandle::new(config)
    }

    #[test]
    fn test_publish_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle_in(dir.path());
        let id = KernelId::new();

        handle.publish(id).unwrap();
        assert_eq!(handle.try_read().unwrap(), Some(id));
        assert_eq!(handle.lookup_with_retry().unwrap(), id);
    }

    #[test]
    fn test_publish_overwrites_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle_in(dir.path());
        let old = KernelId::new();
        let new = KernelId::new();

        handle.publish(old).unwrap();
        handle.publish(new).unwrap();
        assert_eq!(handle.try_read().unwrap(), Some(new));
    }

    #[test]
    fn test_missing_and_partial_handles_read_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle_in(dir.path());

        assert_eq!(handle.try_read().unwrap(), None);

        fs::write(handle.path(), "1234").unwrap();
        assert_eq!(handle.try_read().unwrap(), None);
    }

    #[test]
    fn test_lookup_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle_in(dir.path());

        match handle.lookup_with_retry() {
            Err(DiscoveryError::Timeout { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("Expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_lookup_waits_for_late_publisher() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DiscoveryConfig::in_dir(dir.path());
        config.poll_interval_ms = 5;
        config.max_attempts = 200;
        let reader = DiscoveryHandle::new(config.clone());
        let writer = DiscoveryHandle::new(config);
        let id = KernelId::new();

        let publisher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.publish(id).unwrap();
        });

        assert_eq!(reader.lookup_with_retry().unwrap(), id);
        publisher.join().unwrap();
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle_in(dir.path());

        handle.publish(KernelId::new()).unwrap();
        handle.remove().unwrap();
        assert!(!handle.path().exists());
        handle.remove().unwrap();
    }
}
