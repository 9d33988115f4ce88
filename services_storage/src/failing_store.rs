//! # Failing Store
//!
//! A ProgramCounterStore wrapper that can simulate failures for testing how
//! units react when their state cannot be persisted or recovered.

use crate::{ProgramCounter, ProgramCounterStore, StorageError};
use core_types::UnitId;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Policy for when failures should occur
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Never fail (passthrough)
    Never,
    /// Fail every save after N successful saves
    AfterSaves(usize),
    /// Fail every load after N successful loads
    AfterLoads(usize),
}

/// Wrapper around a store that can simulate failures
pub struct FailingStore<S: ProgramCounterStore> {
    inner: S,
    policy: FailurePolicy,
    saves: AtomicUsize,
    loads: AtomicUsize,
}

impl<S: ProgramCounterStore> FailingStore<S> {
    pub fn new(inner: S, policy: FailurePolicy) -> Self {
        Self {
            inner,
            policy,
            saves: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
        }
    }

    /// Get the underlying store (for inspection)
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of save attempts so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn injected(unit: UnitId, what: &str) -> StorageError {
        StorageError::Io {
            unit,
            message: format!("injected {} failure", what),
        }
    }
}

impl<S: ProgramCounterStore> ProgramCounterStore for FailingStore<S> {
    fn load(&self, unit: UnitId) -> Result<ProgramCounter, StorageError> {
        let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
        if let FailurePolicy::AfterLoads(n) = self.policy {
            if attempt >= n {
                return Err(Self::injected(unit, "load"));
            }
        }
        self.inner.load(unit)
    }

    fn save(&self, unit: UnitId, pc: ProgramCounter) -> Result<(), StorageError> {
        let attempt = self.saves.fetch_add(1, Ordering::SeqCst);
        if let FailurePolicy::AfterSaves(n) = self.policy {
            if attempt >= n {
                return Err(Self::injected(unit, "save"));
            }
        }
        self.inner.save(unit, pc)
    }

    fn delete(&self, unit: UnitId) -> Result<(), StorageError> {
        self.inner.delete(unit)
    }

    fn exists(&self, unit: UnitId) -> Result<bool, StorageError> {
        self.inner.exists(unit)
    }
}
