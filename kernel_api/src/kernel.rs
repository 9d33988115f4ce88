//! Kernel addressing: how events reach the kernel and commands reach units

use crate::{KernelError, KernelEvent, UnitCommand};
use core_types::KernelId;
use crossbeam_channel::Sender;

/// The kernel API trait
///
/// Anything that can accept kernel events. The timer source and the managed
/// units are written against this trait so they can be driven by a real
/// kernel inbox or by a test double.
pub trait KernelApi {
    /// Returns the identity of the kernel behind this handle
    fn kernel_id(&self) -> KernelId;

    /// Enqueues an event into the kernel inbox
    ///
    /// Never blocks. Fails only when the kernel has exited.
    fn submit(&self, event: KernelEvent) -> Result<(), KernelError>;
}

/// Handle to a running kernel's inbox
///
/// Cloneable and cheap; every producer holds its own copy.
#[derive(Debug, Clone)]
pub struct KernelHandle {
    id: KernelId,
    inbox: Sender<KernelEvent>,
}

impl KernelHandle {
    /// Creates a handle from an identity and the sending half of an inbox
    pub fn new(id: KernelId, inbox: Sender<KernelEvent>) -> Self {
        Self { id, inbox }
    }
}

impl KernelApi for KernelHandle {
    fn kernel_id(&self) -> KernelId {
        self.id
    }

    fn submit(&self, event: KernelEvent) -> Result<(), KernelError> {
        self.inbox
            .send(event)
            .map_err(|_| KernelError::InboxClosed)
    }
}

/// Command sink for one managed unit
///
/// The kernel owns one of these per unit and never inspects the unit's
/// internal state through it.
pub trait UnitControl: Send {
    fn send(&self, command: UnitCommand) -> Result<(), KernelError>;
}

impl UnitControl for Sender<UnitCommand> {
    fn send(&self, command: UnitCommand) -> Result<(), KernelError> {
        Sender::send(self, command)
            .map_err(|err| KernelError::CommandFailed(format!("{} not delivered", err.0)))
    }
}
