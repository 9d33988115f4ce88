//! Managed unit runtime
//!
//! A unit counts to a fixed maximum, one iteration per unit of simulated
//! work, and occasionally asks the kernel for I/O. It only makes progress
//! while the kernel lets it: a Pause command makes it write its program
//! counter and block on its command channel until Resume arrives, and a
//! resumed unit continues from exactly the value it wrote.

use crate::descriptor::UnitConfig;
use crate::state::{SharedUnitState, UnitState};
use core_types::UnitId;
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use kernel_api::{KernelApi, KernelError, KernelEvent, UnitCommand};
use lifecycle::{CancellationToken, Deadline};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use services_logger::{LogEntry, LogLevel, LogSink};
use services_registry::DiscoveryError;
use services_storage::{ProgramCounter, ProgramCounterStore, StorageError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const COMPONENT: &str = "unit";

/// How a unit's thread ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitExit {
    /// Reached the iteration limit and notified the kernel
    Completed { iterations: ProgramCounter },
    /// Stopped early by a Terminate command or a vanished kernel
    TornDown { pc: ProgramCounter },
}

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Illegal state transition {from} -> {to}")]
    InvalidTransition { from: UnitState, to: UnitState },

    #[error("No resume received within {timeout_ms} ms")]
    ResumeTimeout { timeout_ms: u64 },
}

/// Whether the run loop should keep going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// One managed unit, bound to a kernel and its own command channel
pub struct ManagedUnit<K: KernelApi> {
    id: UnitId,
    config: UnitConfig,
    kernel: K,
    store: Arc<dyn ProgramCounterStore>,
    commands: Receiver<UnitCommand>,
    state: SharedUnitState,
    sink: Arc<dyn LogSink>,
    rng: StdRng,
    cancel: CancellationToken,
    pc: ProgramCounter,
    notified: bool,
}

impl<K: KernelApi> ManagedUnit<K> {
    pub fn new(
        id: UnitId,
        config: UnitConfig,
        kernel: K,
        store: Arc<dyn ProgramCounterStore>,
        commands: Receiver<UnitCommand>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            id,
            config,
            kernel,
            store,
            commands,
            state: SharedUnitState::new(),
            sink,
            rng,
            cancel: CancellationToken::none(),
            pc: 0,
            notified: false,
        }
    }

    /// Publishes state changes through `state` instead of a private cell
    pub fn with_state(mut self, state: SharedUnitState) -> Self {
        self.state = state;
        self
    }

    /// Tears the unit down between iterations once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn state(&self) -> SharedUnitState {
        self.state.clone()
    }

    /// Runs the unit to completion or teardown
    ///
    /// On error the kernel is still told the unit terminated, so it is
    /// never dispatched again, and the persisted counter is removed.
    pub fn run(mut self) -> Result<UnitExit, UnitError> {
        match self.run_iterations() {
            Ok(exit) => Ok(exit),
            Err(err) => {
                self.log(LogLevel::Error, "unit failed")
                    .with_field("error", &err)
                    .emit(self.sink.as_ref());
                if let Err(cleanup) = self.store.delete(self.id) {
                    self.log(LogLevel::Warn, "persisted counter not removed")
                        .with_field("error", cleanup)
                        .emit(self.sink.as_ref());
                }
                self.notify_terminated();
                let _ = self.state.transition(UnitState::Terminated);
                Err(err)
            }
        }
    }

    fn run_iterations(&mut self) -> Result<UnitExit, UnitError> {
        self.pc = self.store.load(self.id)?;
        self.transition(UnitState::Running)?;
        self.log(LogLevel::Info, "unit admitted")
            .with_field("event", "admitted")
            .with_field("pc", self.pc)
            .emit(self.sink.as_ref());

        while self.pc < self.config.max_iterations {
            if let Some(reason) = self.cancel.reason() {
                self.log(LogLevel::Debug, "stop requested")
                    .with_field("reason", reason)
                    .emit(self.sink.as_ref());
                return self.tear_down();
            }
            // A Pause queued while the unit was not looking must take
            // effect before the next count.
            if self.poll_commands()? == Flow::Stop {
                return self.tear_down();
            }
            self.pc += 1;
            self.log(LogLevel::Info, "unit running")
                .with_field("event", "running")
                .with_field("pc", self.pc)
                .emit(self.sink.as_ref());
            self.store.save(self.id, self.pc)?;

            if self.work()? == Flow::Stop {
                return self.tear_down();
            }

            if self.rng.gen_bool(self.config.block_probability) {
                self.log(LogLevel::Info, "unit requesting I/O")
                    .with_field("event", "io_request")
                    .with_field("pc", self.pc)
                    .emit(self.sink.as_ref());
                if self
                    .kernel
                    .submit(KernelEvent::BlockingRequest(self.id))
                    .is_err()
                {
                    return self.tear_down();
                }
                if self.pause_and_wait()? == Flow::Stop {
                    return self.tear_down();
                }
            }
        }

        self.complete()
    }

    /// Handles every command already queued, without waiting
    ///
    /// Resume while running is stale and dropped.
    fn poll_commands(&mut self) -> Result<Flow, UnitError> {
        loop {
            match self.commands.try_recv() {
                Err(TryRecvError::Empty) => return Ok(Flow::Continue),
                Err(TryRecvError::Disconnected) | Ok(UnitCommand::Terminate) => {
                    return Ok(Flow::Stop)
                }
                Ok(UnitCommand::Resume) => {}
                Ok(UnitCommand::Pause) => {
                    if self.pause_and_wait()? == Flow::Stop {
                        return Ok(Flow::Stop);
                    }
                }
            }
        }
    }

    /// One unit of simulated work, interruptible by commands
    ///
    /// Time spent paused does not count as work.
    fn work(&mut self) -> Result<Flow, UnitError> {
        let mut left = self.config.work();
        loop {
            if left.is_zero() {
                return Ok(Flow::Continue);
            }
            let deadline = Deadline::after(left);
            let started = Instant::now();
            match self.commands.recv_timeout(left) {
                Err(RecvTimeoutError::Timeout) => return Ok(Flow::Continue),
                Err(RecvTimeoutError::Disconnected) | Ok(UnitCommand::Terminate) => {
                    return Ok(Flow::Stop)
                }
                Ok(UnitCommand::Resume) => {}
                Ok(UnitCommand::Pause) => {
                    left = deadline.time_remaining(Instant::now()).unwrap_or_default();
                    if self.pause_and_wait()? == Flow::Stop {
                        return Ok(Flow::Stop);
                    }
                    continue;
                }
            }
            left = left.saturating_sub(started.elapsed());
        }
    }

    /// Persists the counter and suspends until Resume
    fn pause_and_wait(&mut self) -> Result<Flow, UnitError> {
        self.store.save(self.id, self.pc)?;
        self.transition(UnitState::PausedPersisted)?;
        self.log(LogLevel::Info, "unit paused")
            .with_field("event", "paused")
            .with_field("pc", self.pc)
            .emit(self.sink.as_ref());

        loop {
            let command = match self.config.resume_timeout_ms {
                Some(timeout_ms) => match self
                    .commands
                    .recv_timeout(Duration::from_millis(timeout_ms))
                {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(UnitError::ResumeTimeout { timeout_ms })
                    }
                    Err(RecvTimeoutError::Disconnected) => return Ok(Flow::Stop),
                },
                None => match self.commands.recv() {
                    Ok(command) => command,
                    Err(_) => return Ok(Flow::Stop),
                },
            };

            match command {
                UnitCommand::Pause => continue,
                UnitCommand::Terminate => return Ok(Flow::Stop),
                UnitCommand::Resume => {
                    self.pc = self.store.load(self.id)?;
                    self.transition(UnitState::Running)?;
                    self.log(LogLevel::Info, "unit resumed")
                        .with_field("event", "resumed")
                        .with_field("pc", self.pc)
                        .emit(self.sink.as_ref());
                    return Ok(Flow::Continue);
                }
            }
        }
    }

    fn complete(&mut self) -> Result<UnitExit, UnitError> {
        self.store.delete(self.id)?;
        self.transition(UnitState::Terminated)?;
        self.log(LogLevel::Info, "unit finished")
            .with_field("event", "finished")
            .with_field("pc", self.pc)
            .emit(self.sink.as_ref());
        self.notify_terminated();
        Ok(UnitExit::Completed {
            iterations: self.pc,
        })
    }

    fn tear_down(&mut self) -> Result<UnitExit, UnitError> {
        self.store.delete(self.id)?;
        self.transition(UnitState::Terminated)?;
        self.log(LogLevel::Info, "unit torn down")
            .with_field("event", "torn_down")
            .with_field("pc", self.pc)
            .emit(self.sink.as_ref());
        Ok(UnitExit::TornDown { pc: self.pc })
    }

    /// Sends the termination notice at most once
    fn notify_terminated(&mut self) {
        if self.notified {
            return;
        }
        self.notified = true;
        if let Err(err) = self.kernel.submit(KernelEvent::UnitTerminated(self.id)) {
            self.log(LogLevel::Warn, "termination notice not delivered")
                .with_field("error", err)
                .emit(self.sink.as_ref());
        }
    }

    fn transition(&self, next: UnitState) -> Result<(), UnitError> {
        self.state
            .transition(next)
            .map(|_| ())
            .map_err(|(from, to)| UnitError::InvalidTransition { from, to })
    }

    fn log(&self, level: LogLevel, message: &str) -> UnitLog {
        UnitLog(LogEntry::new(level, COMPONENT, message).with_source(self.id))
    }
}

/// Builder that lets a log line be finished after borrowing the unit
struct UnitLog(LogEntry);

impl UnitLog {
    fn with_field(self, key: &str, value: impl ToString) -> Self {
        UnitLog(self.0.with_field(key, value))
    }

    fn emit(self, sink: &dyn LogSink) {
        sink.record(self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::KernelId;
    use crossbeam_channel::{unbounded, Sender};
    use kernel_api::KernelHandle;
    use services_logger::MemoryLogSink;
    use services_storage::{FailingStore, FailurePolicy, MemoryProgramCounterStore};
    use std::thread;
    use std::time::Duration;

    struct Harness {
        id: UnitId,
        kernel_rx: Receiver<KernelEvent>,
        commands: Sender<UnitCommand>,
        store: Arc<MemoryProgramCounterStore>,
        log: Arc<MemoryLogSink>,
        state: SharedUnitState,
        unit: Option<ManagedUnit<KernelHandle>>,
    }

    fn harness(config: UnitConfig) -> Harness {
        let id = UnitId::new();
        let (kernel_tx, kernel_rx) = unbounded();
        let (commands, command_rx) = unbounded();
        let store = Arc::new(MemoryProgramCounterStore::new());
        let log = Arc::new(MemoryLogSink::new());
        let unit = ManagedUnit::new(
            id,
            config,
            KernelHandle::new(KernelId::new(), kernel_tx),
            store.clone(),
            command_rx,
            log.clone(),
        );
        let state = unit.state();
        Harness {
            id,
            kernel_rx,
            commands,
            store,
            log,
            state,
            unit: Some(unit),
        }
    }

    fn quick(max_iterations: u32, block_probability: f64) -> UnitConfig {
        UnitConfig {
            max_iterations,
            work_ms: 1,
            block_probability,
            seed: Some(7),
            resume_timeout_ms: Some(5_000),
        }
    }

    fn wait_for_state(state: &SharedUnitState, wanted: UnitState) {
        let deadline = Deadline::after(Duration::from_secs(5));
        while state.get() != wanted {
            assert!(!deadline.is_expired(), "unit never reached {}", wanted);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_unit_completes_and_notifies_once() {
        let mut h = harness(quick(3, 0.0));
        let exit = h.unit.take().unwrap().run().unwrap();

        assert_eq!(exit, UnitExit::Completed { iterations: 3 });
        assert_eq!(h.state.get(), UnitState::Terminated);
        assert!(!h.store.exists(h.id).unwrap());

        let events: Vec<KernelEvent> = h.kernel_rx.try_iter().collect();
        assert_eq!(events, vec![KernelEvent::UnitTerminated(h.id)]);

        let running = h.log.events("running");
        let pcs: Vec<&str> = running.iter().filter_map(|e| e.field("pc")).collect();
        assert_eq!(pcs, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_unit_resumes_from_persisted_counter() {
        let mut h = harness(quick(4, 0.0));
        h.store.save(h.id, 2).unwrap();

        let exit = h.unit.take().unwrap().run().unwrap();
        assert_eq!(exit, UnitExit::Completed { iterations: 4 });
        assert_eq!(h.log.events("running").len(), 2);
    }

    #[test]
    fn test_pause_persists_and_resume_continues_exactly() {
        let mut config = quick(2, 0.0);
        config.work_ms = 200;
        let mut h = harness(config);
        let unit = h.unit.take().unwrap();
        let runner = thread::spawn(move || unit.run());

        thread::sleep(Duration::from_millis(50));
        h.commands.send(UnitCommand::Pause).unwrap();
        wait_for_state(&h.state, UnitState::PausedPersisted);
        assert_eq!(h.store.load(h.id).unwrap(), 1);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(h.state.get(), UnitState::PausedPersisted);

        h.commands.send(UnitCommand::Resume).unwrap();
        let exit = runner.join().unwrap().unwrap();
        assert_eq!(exit, UnitExit::Completed { iterations: 2 });

        let resumed = h.log.events("resumed");
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].field("pc"), Some("1"));
    }

    #[test]
    fn test_blocking_request_waits_for_resume() {
        let mut h = harness(quick(2, 1.0));
        let unit = h.unit.take().unwrap();
        let runner = thread::spawn(move || unit.run());

        let first = h.kernel_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, KernelEvent::BlockingRequest(h.id));
        wait_for_state(&h.state, UnitState::PausedPersisted);

        // The kernel's pause is redundant; only resume matters.
        h.commands.send(UnitCommand::Pause).unwrap();
        h.commands.send(UnitCommand::Resume).unwrap();

        let second = h.kernel_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(second, KernelEvent::BlockingRequest(h.id));
        h.commands.send(UnitCommand::Resume).unwrap();

        let exit = runner.join().unwrap().unwrap();
        assert_eq!(exit, UnitExit::Completed { iterations: 2 });
        assert_eq!(
            h.kernel_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            KernelEvent::UnitTerminated(h.id)
        );
    }

    #[test]
    fn test_terminate_tears_down_without_notice() {
        let mut config = quick(10, 0.0);
        config.work_ms = 1_000;
        let mut h = harness(config);
        let unit = h.unit.take().unwrap();
        let runner = thread::spawn(move || unit.run());

        thread::sleep(Duration::from_millis(20));
        h.commands.send(UnitCommand::Terminate).unwrap();

        let exit = runner.join().unwrap().unwrap();
        assert_eq!(exit, UnitExit::TornDown { pc: 1 });
        assert!(!h.store.exists(h.id).unwrap());
        assert!(h.kernel_rx.try_recv().is_err());
    }

    #[test]
    fn test_terminate_while_paused() {
        let mut config = quick(10, 0.0);
        config.work_ms = 1_000;
        let mut h = harness(config);
        let unit = h.unit.take().unwrap();
        let runner = thread::spawn(move || unit.run());

        thread::sleep(Duration::from_millis(20));
        h.commands.send(UnitCommand::Pause).unwrap();
        wait_for_state(&h.state, UnitState::PausedPersisted);
        h.commands.send(UnitCommand::Terminate).unwrap();

        assert_eq!(runner.join().unwrap().unwrap(), UnitExit::TornDown { pc: 1 });
        assert_eq!(h.state.get(), UnitState::Terminated);
    }

    #[test]
    fn test_cancelled_token_stops_before_next_iteration() {
        let source = lifecycle::CancellationSource::new();
        source.cancel(lifecycle::CancellationReason::Shutdown);
        let mut h = harness(quick(5, 0.0));
        h.store.save(h.id, 3).unwrap();

        let unit = h.unit.take().unwrap().with_cancellation(source.token());
        assert_eq!(unit.run().unwrap(), UnitExit::TornDown { pc: 3 });
        assert!(h.log.events("running").is_empty());
        assert!(!h.store.exists(h.id).unwrap());
        assert!(h.kernel_rx.try_recv().is_err());
    }

    #[test]
    fn test_queued_pause_stops_unit_before_first_count() {
        let mut h = harness(quick(2, 0.0));
        h.commands.send(UnitCommand::Pause).unwrap();
        let unit = h.unit.take().unwrap();
        let runner = thread::spawn(move || unit.run());

        wait_for_state(&h.state, UnitState::PausedPersisted);
        thread::sleep(Duration::from_millis(20));
        assert!(h.log.events("running").is_empty());
        assert_eq!(h.log.events("paused")[0].field("pc"), Some("0"));

        h.commands.send(UnitCommand::Resume).unwrap();
        assert_eq!(
            runner.join().unwrap().unwrap(),
            UnitExit::Completed { iterations: 2 }
        );
        let pcs: Vec<String> = h
            .log
            .events("running")
            .iter()
            .filter_map(|e| e.field("pc").map(str::to_string))
            .collect();
        assert_eq!(pcs, vec!["1", "2"]);
    }

    #[test]
    fn test_pause_queued_between_iterations_takes_effect_first() {
        let mut h = harness(quick(3, 0.0));
        h.store.save(h.id, 1).unwrap();
        // Stale resume, then the preemption that followed it.
        h.commands.send(UnitCommand::Resume).unwrap();
        h.commands.send(UnitCommand::Pause).unwrap();
        h.commands.send(UnitCommand::Terminate).unwrap();

        let exit = h.unit.take().unwrap().run().unwrap();
        assert_eq!(exit, UnitExit::TornDown { pc: 1 });
        assert!(h.log.events("running").is_empty());
        assert_eq!(h.log.events("paused").len(), 1);
    }

    #[test]
    fn test_stale_resume_while_running_is_ignored() {
        let mut h = harness(quick(2, 0.0));
        h.commands.send(UnitCommand::Resume).unwrap();

        let exit = h.unit.take().unwrap().run().unwrap();
        assert_eq!(exit, UnitExit::Completed { iterations: 2 });
        assert!(h.log.events("paused").is_empty());
    }

    #[test]
    fn test_storage_failure_is_fatal_and_reported() {
        let id = UnitId::new();
        let (kernel_tx, kernel_rx) = unbounded();
        let (_commands, command_rx) = unbounded();
        let store = Arc::new(FailingStore::new(
            MemoryProgramCounterStore::new(),
            FailurePolicy::AfterSaves(1),
        ));
        let unit = ManagedUnit::new(
            id,
            quick(5, 0.0),
            KernelHandle::new(KernelId::new(), kernel_tx),
            store.clone(),
            command_rx,
            Arc::new(MemoryLogSink::new()),
        );
        let state = unit.state();

        let result = unit.run();
        assert!(matches!(result, Err(UnitError::Storage(StorageError::Io { .. }))));
        assert_eq!(state.get(), UnitState::Terminated);
        // The counter saved before the failure does not outlive the unit.
        assert!(!store.exists(id).unwrap());
        assert_eq!(
            kernel_rx.try_iter().collect::<Vec<_>>(),
            vec![KernelEvent::UnitTerminated(id)]
        );
    }

    #[test]
    fn test_resume_timeout() {
        let mut config = quick(3, 1.0);
        config.resume_timeout_ms = Some(20);
        let mut h = harness(config);

        let result = h.unit.take().unwrap().run();
        assert!(matches!(result, Err(UnitError::ResumeTimeout { timeout_ms: 20 })));
    }

    #[test]
    fn test_seeded_units_block_identically() {
        let runs: Vec<Vec<String>> = (0..2)
            .map(|_| {
                let mut h = harness(UnitConfig {
                    max_iterations: 20,
                    work_ms: 0,
                    block_probability: 0.25,
                    seed: Some(99),
                    resume_timeout_ms: Some(5_000),
                });
                let unit = h.unit.take().unwrap();
                let runner = thread::spawn(move || unit.run());
                // Act as the kernel: resume the unit after each request.
                loop {
                    match h.kernel_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                        KernelEvent::BlockingRequest(_) => {
                            wait_for_state(&h.state, UnitState::PausedPersisted);
                            h.commands.send(UnitCommand::Resume).unwrap();
                        }
                        KernelEvent::UnitTerminated(_) => break,
                        other => panic!("unexpected event {:?}", other),
                    }
                }
                runner.join().unwrap().unwrap();
                h.log
                    .events("io_request")
                    .iter()
                    .filter_map(|e| e.field("pc").map(str::to_string))
                    .collect()
            })
            .collect();
        assert_eq!(runs[0], runs[1]);
    }
}
