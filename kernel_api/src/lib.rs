//! # Kernel API
//!
//! This crate defines the interface between the scheduler core and the
//! components that drive it.
//!
//! ## Philosophy
//!
//! The kernel is the single arbiter:
//! - Interrupt sources and units only *submit events* into its inbox
//! - The kernel only *issues commands* back to units
//! - No component talks to another component directly
//!
//! ## Non-Goals
//!
//! This is NOT:
//! - POSIX (no signals, no pids, no stop/continue)
//! - A specific transport (the inbox happens to be a channel)

pub mod error;
pub mod event;
pub mod kernel;

pub use error::KernelError;
pub use event::{KernelEvent, UnitCommand};
pub use kernel::{KernelApi, KernelHandle, UnitControl};
