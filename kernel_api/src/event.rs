//! Events consumed by the scheduler core and commands it produces

use core_types::UnitId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An event delivered to the kernel inbox
///
/// Events are processed strictly in arrival order, one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelEvent {
    /// Periodic time-slice expiry (IRQ0)
    TimeSliceExpired,
    /// Periodic I/O completion (IRQ1)
    IoCompleted,
    /// A unit asks to be suspended until I/O completes
    BlockingRequest(UnitId),
    /// A unit finished all of its iterations
    UnitTerminated(UnitId),
    /// Drain the inbox and exit
    Shutdown,
}

impl KernelEvent {
    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            KernelEvent::TimeSliceExpired => "time_slice_expired",
            KernelEvent::IoCompleted => "io_completed",
            KernelEvent::BlockingRequest(_) => "blocking_request",
            KernelEvent::UnitTerminated(_) => "unit_terminated",
            KernelEvent::Shutdown => "shutdown",
        }
    }
}

/// A command sent from the kernel to a single unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitCommand {
    /// Persist the program counter and suspend until `Resume`
    Pause,
    /// Reload the program counter and continue
    Resume,
    /// Teardown: drop persisted state and exit immediately
    Terminate,
}

impl fmt::Display for UnitCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitCommand::Pause => write!(f, "pause"),
            UnitCommand::Resume => write!(f, "resume"),
            UnitCommand::Terminate => write!(f, "terminate"),
        }
    }
}
