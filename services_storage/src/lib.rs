//! # Storage Service
//!
//! This crate persists each managed unit's program counter.
//!
//! ## Philosophy
//!
//! The program counter is the unit's *entire* recoverable state. It is
//! written before the unit yields and read back when it resumes, so the
//! store must never hand back a default value when the real one could not
//! be read: a missing record means "never started", anything else that goes
//! wrong is an error.
//!
//! ## Design
//!
//! - **ProgramCounterStore**: the seam units are written against
//! - **FileProgramCounterStore**: one small text file per unit
//! - **MemoryProgramCounterStore**: same contract, no filesystem
//! - **FailingStore**: wraps a store and fails on demand (tests)

pub mod failing_store;
pub mod pc_store;

pub use failing_store::{FailingStore, FailurePolicy};
pub use pc_store::{
    FileProgramCounterStore, MemoryProgramCounterStore, ProgramCounter, ProgramCounterStore,
    StorageConfig, StorageError,
};
