//! Program counter persistence

use core_types::UnitId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// The persisted iteration counter of a unit
pub type ProgramCounter = u32;

pub const DEFAULT_FILE_PREFIX: &str = "pc_state_";

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one record per unit
    pub state_dir: PathBuf,
    /// File name prefix; the unit's UUID follows it
    pub file_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("."),
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Program counter I/O error for {unit}: {message}")]
    Io { unit: UnitId, message: String },

    #[error("Corrupt program counter record for {unit}: {contents:?}")]
    Corrupt { unit: UnitId, contents: String },

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Durable home of every unit's program counter
///
/// Each unit only ever touches its own key.
pub trait ProgramCounterStore: Send + Sync {
    /// Returns the persisted value, or 0 when nothing was ever saved
    fn load(&self, unit: UnitId) -> Result<ProgramCounter, StorageError>;

    /// Creates or overwrites the record
    fn save(&self, unit: UnitId, pc: ProgramCounter) -> Result<(), StorageError>;

    /// Deletes the record; deleting a missing record succeeds
    fn delete(&self, unit: UnitId) -> Result<(), StorageError>;

    /// Checks whether a record exists
    fn exists(&self, unit: UnitId) -> Result<bool, StorageError>;
}

/// One file per unit, containing a single decimal integer
#[derive(Debug, Clone)]
pub struct FileProgramCounterStore {
    config: StorageConfig,
}

impl FileProgramCounterStore {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    /// Store rooted at `dir` with the default prefix
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(StorageConfig {
            state_dir: dir.as_ref().to_path_buf(),
            ..StorageConfig::default()
        })
    }

    /// Path of the record for `unit`
    pub fn record_path(&self, unit: UnitId) -> PathBuf {
        self.config
            .state_dir
            .join(format!("{}{}", self.config.file_prefix, unit.as_uuid()))
    }

    fn io_error(unit: UnitId, err: std::io::Error) -> StorageError {
        StorageError::Io {
            unit,
            message: err.to_string(),
        }
    }
}

impl ProgramCounterStore for FileProgramCounterStore {
    fn load(&self, unit: UnitId) -> Result<ProgramCounter, StorageError> {
        let text = match fs::read_to_string(self.record_path(unit)) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(Self::io_error(unit, err)),
        };
        text.trim().parse().map_err(|_| StorageError::Corrupt {
            unit,
            contents: text.clone(),
        })
    }

    fn save(&self, unit: UnitId, pc: ProgramCounter) -> Result<(), StorageError> {
        fs::write(self.record_path(unit), format!("{}\n", pc))
            .map_err(|err| Self::io_error(unit, err))
    }

    fn delete(&self, unit: UnitId) -> Result<(), StorageError> {
        match fs::remove_file(self.record_path(unit)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_error(unit, err)),
        }
    }

    fn exists(&self, unit: UnitId) -> Result<bool, StorageError> {
        Ok(self.record_path(unit).exists())
    }
}

/// In-memory store with the same contract as the file store
#[derive(Debug, Default)]
pub struct MemoryProgramCounterStore {
    records: Mutex<HashMap<UnitId, ProgramCounter>>,
}

impl MemoryProgramCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProgramCounterStore for MemoryProgramCounterStore {
    fn load(&self, unit: UnitId) -> Result<ProgramCounter, StorageError> {
        let records = self.records.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(records.get(&unit).copied().unwrap_or(0))
    }

    fn save(&self, unit: UnitId, pc: ProgramCounter) -> Result<(), StorageError> {
        let mut records = self.records.lock().map_err(|_| StorageError::Poisoned)?;
        records.insert(unit, pc);
        Ok(())
    }

    fn delete(&self, unit: UnitId) -> Result<(), StorageError> {
        let mut records = self.records.lock().map_err(|_| StorageError::Poisoned)?;
        records.remove(&unit);
        Ok(())
    }

    fn exists(&self, unit: UnitId) -> Result<bool, StorageError> {
        let records = self.records.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(records.contains_key(&unit))
    }
}
