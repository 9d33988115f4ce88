//! Kernel error types

use thiserror::Error;

/// Errors that can occur when interacting with the kernel
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KernelError {
    /// The kernel inbox is closed; the scheduler core has exited
    #[error("Kernel inbox closed")]
    InboxClosed,

    /// A command could not be delivered to a unit
    #[error("Failed to deliver command to unit: {0}")]
    CommandFailed(String),

    /// Scheduler bookkeeping is inconsistent; processing must stop
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration was rejected before anything started
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Discovery handle could not be published or removed
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// The kernel thread panicked
    #[error("Kernel thread panicked")]
    Panicked,
}
