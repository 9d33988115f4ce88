//! Simulation orchestrator
//!
//! Starts the kernel, the timer and the managed units in that order, and
//! tears them down with one stop request each.

use crate::descriptor::{ConfigError, SimulationConfig, UnitConfig};
use crate::state::{SharedUnitState, UnitState};
use crate::unit::{ManagedUnit, UnitError, UnitExit};
use core_types::UnitId;
use crossbeam_channel::{unbounded, Receiver, Sender};
use kernel_api::{KernelApi, KernelError, KernelEvent, KernelHandle, UnitCommand, UnitControl};
use lifecycle::{CancellationReason, CancellationSource, CancellationToken, Deadline};
use serde::{Deserialize, Serialize};
use services_logger::{LogEntry, LogLevel, LogSink};
use services_registry::{
    locate_kernel, DiscoveryError, DiscoveryHandle, ServiceRegistry, SharedRegistry,
};
use services_storage::{FileProgramCounterStore, ProgramCounterStore, StorageError};
use sim_kernel::{KernelRuntime, SchedulerSnapshot, SimulatedKernel, TimerSource, TimerStats};
use std::fs;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

const COMPONENT: &str = "manager";
const FINISH_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum ProcessManagerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to spawn {what}: {message}")]
    Spawn { what: String, message: String },
}

/// Handle to a managed unit's thread
pub struct UnitHandle {
    pub id: UnitId,
    pub index: usize,
    commands: Sender<UnitCommand>,
    state: SharedUnitState,
    thread: Option<JoinHandle<Result<UnitExit, UnitError>>>,
}

impl UnitHandle {
    pub fn state(&self) -> UnitState {
        self.state.get()
    }

    pub fn is_finished(&self) -> bool {
        self.thread
            .as_ref()
            .map(|thread| thread.is_finished())
            .unwrap_or(true)
    }
}

/// Outcome of one unit's thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitReport {
    pub id: UnitId,
    pub index: usize,
    pub exit: Result<UnitExit, String>,
}

/// Final state of a simulation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationReport {
    /// Scheduler state at exit; `None` if the kernel failed
    pub snapshot: Option<SchedulerSnapshot>,
    pub timer: TimerStats,
    pub units: Vec<UnitReport>,
    /// One diagnostic per component that failed
    pub failures: Vec<String>,
}

impl SimulationReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Units that reached their iteration limit
    pub fn completed_units(&self) -> usize {
        self.units
            .iter()
            .filter(|report| matches!(report.exit, Ok(UnitExit::Completed { .. })))
            .count()
    }
}

/// Process manager: owns every thread of one simulation
pub struct ProcessManager {
    config: SimulationConfig,
    registry: SharedRegistry,
    discovery: DiscoveryHandle,
    sink: Arc<dyn LogSink>,
    kernel: Option<KernelRuntime>,
    timer: Option<TimerSource>,
    units: Vec<UnitHandle>,
    stop: CancellationSource,
}

impl ProcessManager {
    /// Starts a simulation with file-backed program counters
    pub fn start(
        config: SimulationConfig,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, ProcessManagerError> {
        fs::create_dir_all(&config.storage.state_dir).map_err(|err| {
            ConfigError::Io(format!(
                "{}: {}",
                config.storage.state_dir.display(),
                err
            ))
        })?;
        let store = Arc::new(FileProgramCounterStore::new(config.storage.clone()));
        Self::start_with_store(config, store, sink)
    }

    /// Starts a simulation against an arbitrary program counter store
    ///
    /// The kernel is published before the timer and units start; each of
    /// them then finds it through the discovery handle.
    pub fn start_with_store(
        config: SimulationConfig,
        store: Arc<dyn ProgramCounterStore>,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, ProcessManagerError> {
        config.validate()?;
        let registry = ServiceRegistry::shared();
        let discovery = DiscoveryHandle::new(config.discovery.clone());

        let count = config.scheduler.unit_count;
        let mut slots: Vec<(UnitId, Box<dyn UnitControl>)> = Vec::with_capacity(count);
        let mut pending = Vec::with_capacity(count);
        for index in 0..count {
            let id = UnitId::new();
            let (tx, rx) = unbounded();
            slots.push((id, Box::new(tx.clone()) as Box<dyn UnitControl>));
            pending.push((index, id, tx, rx));
        }

        let kernel = SimulatedKernel::new(config.scheduler.clone(), slots, sink.clone())?;
        let runtime = kernel.spawn(&registry, discovery.clone())?;

        let mut manager = Self {
            config,
            registry,
            discovery,
            sink,
            kernel: Some(runtime),
            timer: None,
            units: Vec::with_capacity(count),
            stop: CancellationSource::new(),
        };

        let handle = locate_kernel(&manager.discovery, &manager.registry)?;
        manager.timer = Some(TimerSource::start(
            manager.config.timer,
            handle.clone(),
            manager.sink.clone(),
        )?);

        for (index, id, commands, receiver) in pending {
            let state = SharedUnitState::new();
            let launch = UnitLaunch {
                id,
                config: UnitConfig {
                    seed: manager.config.unit.seed_for(index),
                    ..manager.config.unit.clone()
                },
                discovery: manager.discovery.clone(),
                registry: manager.registry.clone(),
                fallback: handle.clone(),
                store: store.clone(),
                commands: receiver,
                state: state.clone(),
                cancel: manager.stop.token(),
                sink: manager.sink.clone(),
            };

            let thread = thread::Builder::new()
                .name(format!("unit-{}", index))
                .spawn(move || launch.run())
                .map_err(|err| ProcessManagerError::Spawn {
                    what: format!("unit {}", index),
                    message: err.to_string(),
                })?;

            manager.units.push(UnitHandle {
                id,
                index,
                commands,
                state,
                thread: Some(thread),
            });
        }

        manager.sink.record(
            LogEntry::new(LogLevel::Info, COMPONENT, "simulation started")
                .with_field("event", "started")
                .with_field("units", count),
        );
        Ok(manager)
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn units(&self) -> &[UnitHandle] {
        &self.units
    }

    /// Returns true once every unit thread has exited
    pub fn all_units_finished(&self) -> bool {
        self.units.iter().all(UnitHandle::is_finished)
    }

    /// Returns true if the kernel thread has exited on its own
    pub fn kernel_exited(&self) -> bool {
        self.kernel
            .as_ref()
            .map(KernelRuntime::is_finished)
            .unwrap_or(true)
    }

    /// Waits until every unit has exited, the kernel has stopped, or
    /// `limit` elapses
    ///
    /// Returns true if all units finished.
    pub fn wait_until_finished(&self, limit: Option<Duration>) -> bool {
        let deadline = limit.map(Deadline::after);
        loop {
            if self.all_units_finished() {
                return true;
            }
            if self.kernel_exited() || deadline.map(|d| d.is_expired()).unwrap_or(false) {
                return false;
            }
            thread::sleep(FINISH_POLL);
        }
    }

    /// Stops everything and collects the results
    ///
    /// Stops the timer, tells every unit to terminate, asks the kernel to
    /// drain and exit, then joins every thread.
    pub fn shutdown(mut self) -> SimulationReport {
        self.request_stop(CancellationReason::Shutdown);

        let timer = self.timer.take().map(TimerSource::join).unwrap_or_default();
        let mut failures = Vec::new();

        let units: Vec<UnitReport> = self
            .units
            .iter_mut()
            .map(|unit| {
                let exit = match unit.thread.take().map(JoinHandle::join) {
                    Some(Ok(Ok(exit))) => Ok(exit),
                    Some(Ok(Err(err))) => Err(err.to_string()),
                    Some(Err(_)) => Err("unit thread panicked".to_string()),
                    None => Err("unit thread missing".to_string()),
                };
                if let Err(message) = &exit {
                    failures.push(format!("unit {} ({}): {}", unit.index, unit.id, message));
                }
                UnitReport {
                    id: unit.id,
                    index: unit.index,
                    exit,
                }
            })
            .collect();

        let snapshot = match self.kernel.take().map(KernelRuntime::join) {
            Some(Ok(snapshot)) => Some(snapshot),
            Some(Err(err)) => {
                failures.push(format!("kernel: {}", err));
                None
            }
            None => None,
        };

        let report = SimulationReport {
            snapshot,
            timer,
            units,
            failures,
        };
        let level = if report.is_success() {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        self.sink.record(
            LogEntry::new(level, COMPONENT, "simulation stopped")
                .with_field("event", "stopped")
                .with_field("completed", report.completed_units())
                .with_field("failures", report.failures.len()),
        );
        report
    }

    fn request_stop(&mut self, reason: CancellationReason) {
        if let Some(timer) = self.timer.as_mut() {
            timer.stop();
        }
        self.stop.cancel(reason);
        for unit in &self.units {
            // A unit that already exited has dropped its receiver.
            let _ = unit.commands.send(UnitCommand::Terminate);
        }
        if let Some(kernel) = self.kernel.as_ref() {
            if let Err(err) = kernel.shutdown() {
                self.sink.record(
                    LogEntry::new(LogLevel::Debug, COMPONENT, "kernel already stopped")
                        .with_field("error", err),
                );
            }
        }
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.request_stop(CancellationReason::OwnerDropped);
    }
}

/// What a unit thread is handed at spawn time
struct UnitLaunch {
    id: UnitId,
    config: UnitConfig,
    discovery: DiscoveryHandle,
    registry: SharedRegistry,
    /// The orchestrator's own handle, used only to retract the unit if it
    /// never finds the kernel
    fallback: KernelHandle,
    store: Arc<dyn ProgramCounterStore>,
    commands: Receiver<UnitCommand>,
    state: SharedUnitState,
    cancel: CancellationToken,
    sink: Arc<dyn LogSink>,
}

impl UnitLaunch {
    /// Locates the kernel, then runs the unit on the calling thread
    fn run(self) -> Result<UnitExit, UnitError> {
        let kernel = match locate_kernel(&self.discovery, &self.registry) {
            Ok(kernel) => kernel,
            Err(err) => {
                self.sink.record(
                    LogEntry::new(LogLevel::Error, COMPONENT, "unit could not locate kernel")
                        .with_source(self.id)
                        .with_field("event", "admission_failed")
                        .with_field("error", &err),
                );
                // The slot stays in the scheduler until it hears otherwise.
                if let Err(notice) = self.fallback.submit(KernelEvent::UnitTerminated(self.id)) {
                    self.sink.record(
                        LogEntry::new(LogLevel::Warn, COMPONENT, "retraction not delivered")
                            .with_source(self.id)
                            .with_field("error", notice),
                    );
                }
                let _ = self.state.transition(UnitState::Terminated);
                return Err(err.into());
            }
        };
        ManagedUnit::new(
            self.id,
            self.config,
            kernel,
            self.store,
            self.commands,
            self.sink,
        )
        .with_state(self.state)
        .with_cancellation(self.cancel)
        .run()
    }
}
