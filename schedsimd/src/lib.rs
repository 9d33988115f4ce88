//! # SchedSim Host Runtime
//!
//! This crate provides the host runtime for the scheduler simulation.
//!
//! ## Philosophy
//!
//! - **Host owns I/O**: Components never print; they log structured entries
//! - **Config first, then overrides**: A JSON file sets the baseline and
//!   command-line flags adjust it
//! - **Fail loudly**: Any fatal component error becomes a non-zero exit
//!
//! ## Responsibilities
//!
//! The host runtime:
//! - Resolves and validates the simulation configuration
//! - Starts the process manager and waits for the units to finish
//! - Shuts everything down and reports the outcome
//!
//! ## Non-Responsibilities
//!
//! The host does NOT:
//! - Make scheduling decisions
//! - Touch unit state files directly

pub mod runtime;

pub use runtime::{ConfigOverrides, HostRuntime, HostRuntimeConfig, HostRuntimeError};
