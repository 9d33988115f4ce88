//! # Simulated Kernel
//!
//! This crate provides the scheduler core of the simulation and the timer
//! that drives it.
//!
//! ## Purpose
//!
//! The simulated kernel multiplexes one virtual CPU across a fixed set of
//! managed units:
//! - Runs under `cargo test`
//! - Handlers are plain methods, so scheduling can be tested without threads
//! - The same scheduler runs behind a real inbox thread in a live simulation
//! - Inspectable (snapshot and audit log are always available)
//!
//! ## Philosophy
//!
//! **Every state change goes through one inbox.**
//!
//! Interrupts, blocking requests and termination notices are all
//! [`KernelEvent`]s on a single FIFO. The inbox loop takes one event at a
//! time and runs its handler to completion, so handlers never interleave.

pub mod io_queue;
pub mod scheduler;
pub mod test_utils;
pub mod timer;

pub use io_queue::{IoWaitQueue, QueueError};
pub use scheduler::{
    HandlerOutcome, IgnoreReason, Lifecycle, ScheduleEvent, Scheduler, SchedulerConfig,
    SchedulerSnapshot, UnitRecord,
};
pub use timer::{TimerConfig, TimerSource, TimerStats};

use core_types::{KernelId, UnitId};
use crossbeam_channel::{self as chan, Receiver};
use kernel_api::{KernelError, KernelEvent, KernelHandle, UnitControl};
use lifecycle::Deadline;
use services_logger::{LogEntry, LogLevel, LogSink};
use services_registry::{DiscoveryHandle, SharedRegistry};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const COMPONENT: &str = "kernel";

/// Simulated kernel
///
/// Owns the scheduler until it is handed to an inbox loop, either on the
/// calling thread with [`SimulatedKernel::run`] or on its own thread with
/// [`SimulatedKernel::spawn`].
pub struct SimulatedKernel {
    id: KernelId,
    config: SchedulerConfig,
    scheduler: Scheduler,
    sink: Arc<dyn LogSink>,
}

impl SimulatedKernel {
    /// Creates a kernel over `units`, in slot order
    pub fn new(
        config: SchedulerConfig,
        units: Vec<(UnitId, Box<dyn UnitControl>)>,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, KernelError> {
        config.validate()?;
        if units.len() != config.unit_count {
            return Err(KernelError::InvalidConfig(format!(
                "expected {} units, got {}",
                config.unit_count,
                units.len()
            )));
        }
        let scheduler = Scheduler::new(units, sink.clone())?;
        Ok(Self {
            id: KernelId::new(),
            config,
            scheduler,
            sink,
        })
    }

    pub fn id(&self) -> KernelId {
        self.id
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Runs the inbox loop on the calling thread
    ///
    /// Performs the initial dispatch, then handles events in arrival order
    /// until [`KernelEvent::Shutdown`] arrives or every sender is gone.
    /// Events already queued behind the shutdown request are drained within
    /// the configured grace period. An invariant violation stops the loop.
    pub fn run(mut self, inbox: Receiver<KernelEvent>) -> Result<SchedulerSnapshot, KernelError> {
        let result = self.run_loop(&inbox);
        if let Err(err) = &result {
            self.sink.record(
                LogEntry::new(LogLevel::Error, COMPONENT, "scheduler stopped on error")
                    .with_field("event", "fatal")
                    .with_field("error", err),
            );
        }
        result
    }

    /// Publishes the kernel and runs its inbox loop on a new thread
    ///
    /// The initial dispatch happens before this returns, so every unit's
    /// first command is already waiting in its channel when the unit
    /// starts. The kernel is registered in `registry` and its identity
    /// written to the discovery handle, so components started afterwards
    /// can locate it. Both are withdrawn when the loop exits, whatever the
    /// outcome.
    pub fn spawn(
        mut self,
        registry: &SharedRegistry,
        discovery: DiscoveryHandle,
    ) -> Result<KernelRuntime, KernelError> {
        self.scheduler.start()?;
        let id = self.id;
        let sink = self.sink.clone();
        let (tx, rx) = chan::unbounded();
        let handle = KernelHandle::new(id, tx);

        registry
            .lock()
            .map_err(|_| KernelError::Discovery("service registry unavailable".to_string()))?
            .register(id, handle.clone())
            .map_err(|err| KernelError::Discovery(format!("{:?}", err)))?;

        if let Err(err) = discovery.publish(id) {
            withdraw(id, registry, &discovery, sink.as_ref());
            return Err(KernelError::Discovery(err.to_string()));
        }
        sink.record(
            LogEntry::new(LogLevel::Info, COMPONENT, "kernel published")
                .with_field("event", "published")
                .with_field("kernel", id)
                .with_field("handle", discovery.path().display()),
        );

        let thread_registry = registry.clone();
        let thread_discovery = discovery.clone();
        let thread_sink = sink.clone();
        let spawned = thread::Builder::new()
            .name("kernel".to_string())
            .spawn(move || {
                let result = self.run(rx);
                withdraw(id, &thread_registry, &thread_discovery, thread_sink.as_ref());
                result
            });

        match spawned {
            Ok(thread) => Ok(KernelRuntime {
                handle,
                thread: Some(thread),
            }),
            Err(err) => {
                withdraw(id, registry, &discovery, sink.as_ref());
                Err(KernelError::InvalidConfig(format!(
                    "cannot spawn kernel thread: {}",
                    err
                )))
            }
        }
    }

    fn run_loop(&mut self, inbox: &Receiver<KernelEvent>) -> Result<SchedulerSnapshot, KernelError> {
        self.scheduler.start()?;

        let mut handled: u64 = 0;
        loop {
            match inbox.recv() {
                Ok(KernelEvent::Shutdown) | Err(_) => break,
                Ok(event) => {
                    self.scheduler.handle_event(event)?;
                    handled += 1;
                }
            }
        }

        let grace = Deadline::after(Duration::from_millis(self.config.shutdown_grace_ms));
        let mut drained: u64 = 0;
        while !grace.is_expired() {
            match inbox.try_recv() {
                Ok(KernelEvent::Shutdown) => continue,
                Ok(event) => {
                    self.scheduler.handle_event(event)?;
                    drained += 1;
                }
                Err(_) => break,
            }
        }

        self.sink.record(
            LogEntry::new(LogLevel::Info, COMPONENT, "kernel stopped")
                .with_field("event", "stopped")
                .with_field("handled", handled)
                .with_field("drained", drained),
        );
        Ok(self.scheduler.snapshot())
    }
}

/// Removes the kernel from the registry and deletes its discovery handle
fn withdraw(
    id: KernelId,
    registry: &SharedRegistry,
    discovery: &DiscoveryHandle,
    sink: &dyn LogSink,
) {
    if let Ok(mut registry) = registry.lock() {
        let _ = registry.unregister(id);
    }
    if let Err(err) = discovery.remove() {
        sink.record(
            LogEntry::new(LogLevel::Error, COMPONENT, "failed to remove discovery handle")
                .with_field("event", "withdraw_failed")
                .with_field("error", err),
        );
    }
}

/// A kernel whose inbox loop runs on its own thread
pub struct KernelRuntime {
    handle: KernelHandle,
    thread: Option<JoinHandle<Result<SchedulerSnapshot, KernelError>>>,
}

impl KernelRuntime {
    /// Returns a handle for submitting events
    pub fn handle(&self) -> KernelHandle {
        self.handle.clone()
    }

    pub fn id(&self) -> KernelId {
        kernel_api::KernelApi::kernel_id(&self.handle)
    }

    /// Asks the inbox loop to drain and exit
    pub fn shutdown(&self) -> Result<(), KernelError> {
        kernel_api::KernelApi::submit(&self.handle, KernelEvent::Shutdown)
    }

    /// Returns true once the inbox loop has exited
    pub fn is_finished(&self) -> bool {
        self.thread
            .as_ref()
            .map(|thread| thread.is_finished())
            .unwrap_or(true)
    }

    /// Waits for the inbox loop and returns the final scheduler state
    pub fn join(mut self) -> Result<SchedulerSnapshot, KernelError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| KernelError::Panicked)?,
            None => Err(KernelError::Panicked),
        }
    }
}
