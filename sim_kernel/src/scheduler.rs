//! Round-Robin Scheduler Core
//!
//! This module owns the authoritative state of every managed unit and makes
//! every dispatch decision.
//!
//! ## Philosophy
//!
//! - **Single arbiter**: Nothing else reads or writes `SchedulerState`.
//! - **One event at a time**: Each handler runs to completion before the
//!   next event is looked at, so handlers never nest.
//! - **Stale events are normal**: Under asynchrony an event can refer to a
//!   unit that has since terminated or blocked. Such events are logged and
//!   ignored.
//! - **Broken bookkeeping is not normal**: A queue overflow or an index that
//!   is blocked but not queued means a handler is wrong. Those stop the core.
//!
//! ## Design
//!
//! - **Fixed slots**: Units are indexed `0..N` for the whole run.
//! - **Forward scan**: The next unit is searched from `current + 1`, wrapping
//!   modulo N, so no eligible unit is skipped forever.
//! - **FIFO I/O queue**: Completions unblock units in the order they blocked.
//! - **No implicit switch on unblock**: A unit made eligible by an I/O
//!   completion waits for the next time slice or blocking request.

use crate::io_queue::IoWaitQueue;
use core_types::UnitId;
use kernel_api::{KernelError, KernelEvent, UnitCommand, UnitControl};
use serde::{Deserialize, Serialize};
use services_logger::{LogEntry, LogLevel, LogSink};
use std::collections::HashSet;
use std::sync::Arc;

const COMPONENT: &str = "kernel";

/// Lifecycle of a unit as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    Active,
    /// Set exactly once, never reversed
    Terminated,
}

/// Scheduler-side record of one managed unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub id: UnitId,
    pub lifecycle: Lifecycle,
    /// Awaiting I/O completion
    pub blocked: bool,
}

impl UnitRecord {
    fn new(id: UnitId) -> Self {
        Self {
            id,
            lifecycle: Lifecycle::Active,
            blocked: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    /// Active and not blocked
    pub fn is_runnable(&self) -> bool {
        self.is_active() && !self.blocked
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of managed units (N); also the I/O queue capacity
    pub unit_count: usize,
    /// Upper bound on draining the inbox after a shutdown request
    pub shutdown_grace_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            unit_count: 3,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.unit_count == 0 {
            return Err(KernelError::InvalidConfig(
                "unit_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Why a handler left the state untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IgnoreReason {
    /// The event names a unit the scheduler does not know
    UnknownUnit,
    /// The event refers to a unit that already terminated
    AlreadyTerminated,
    /// A blocking request from a unit that is already blocked
    AlreadyBlocked,
    /// I/O completion with nothing waiting
    QueueEmpty,
    /// Time slice expired but the current unit cannot be preempted
    CurrentNotRunnable,
    /// Time slice expired with nothing running and nothing eligible
    NothingToDispatch,
    /// Shutdown is handled by the inbox loop, not the scheduler
    Shutdown,
}

/// Result of handling one event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerOutcome {
    Applied,
    Ignored(IgnoreReason),
}

/// Scheduling event for audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleEvent {
    /// Unit was designated current and told to resume
    Dispatched { index: usize },
    /// Current unit was told to pause at time-slice expiry
    Preempted { index: usize },
    /// Unit blocked on I/O and was told to pause
    Blocked { index: usize },
    /// I/O completed for the unit; it is eligible again
    Unblocked { index: usize },
    /// Unit terminated
    Terminated { index: usize },
    /// A scan found no eligible unit; current is none
    NoEligibleUnit,
    /// An event was ignored
    Stale { event: String, reason: IgnoreReason },
}

/// Point-in-time view of the scheduler state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub current: Option<usize>,
    pub io_queue: Vec<usize>,
    pub units: Vec<UnitRecord>,
}

/// Round-robin scheduler
///
/// Owns `units`, `current` and the I/O wait queue. At most one unit is ever
/// current: `current` is a single `Option<usize>`.
pub struct Scheduler {
    units: Vec<UnitRecord>,
    controls: Vec<Box<dyn UnitControl>>,
    current: Option<usize>,
    /// Last index that was current; scans resume from here when none is
    cursor: usize,
    io_queue: IoWaitQueue,
    sink: Arc<dyn LogSink>,
    started: bool,
    audit_log: Vec<ScheduleEvent>,
}

impl Scheduler {
    /// Creates a scheduler over a fixed set of units
    ///
    /// The slot order is the order of `units`. Nothing is dispatched until
    /// [`Scheduler::start`].
    pub fn new(
        units: Vec<(UnitId, Box<dyn UnitControl>)>,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, KernelError> {
        if units.is_empty() {
            return Err(KernelError::InvalidConfig(
                "scheduler needs at least one unit".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for (id, _) in &units {
            if !seen.insert(*id) {
                return Err(KernelError::InvalidConfig(format!(
                    "duplicate unit identity {}",
                    id
                )));
            }
        }

        let capacity = units.len();
        let (records, controls): (Vec<UnitRecord>, Vec<Box<dyn UnitControl>>) = units
            .into_iter()
            .map(|(id, control)| (UnitRecord::new(id), control))
            .unzip();

        Ok(Self {
            units: records,
            controls,
            current: None,
            cursor: capacity - 1,
            io_queue: IoWaitQueue::with_capacity(capacity),
            sink,
            started: false,
            audit_log: Vec::new(),
        })
    }

    /// Initial dispatch
    ///
    /// The first runnable unit (index 0 unless it already terminated) becomes
    /// current and is resumed; every other active unit is told to pause so
    /// that only one unit makes progress. Calling this twice is a no-op.
    pub fn start(&mut self) -> Result<(), KernelError> {
        if self.started {
            return Ok(());
        }
        self.started = true;

        let first = self.next_eligible(self.cursor, None);
        for index in 0..self.units.len() {
            if Some(index) != first && self.units[index].is_active() {
                self.command(index, UnitCommand::Pause);
            }
        }
        match first {
            Some(index) => self.dispatch(index, "start"),
            None => self.no_eligible_unit("start"),
        }
        self.check_invariants()
    }

    /// Handles one inbox event and verifies the bookkeeping afterwards
    pub fn handle_event(&mut self, event: KernelEvent) -> Result<HandlerOutcome, KernelError> {
        let outcome = match event {
            KernelEvent::TimeSliceExpired => self.on_time_slice_expired(),
            KernelEvent::IoCompleted => self.on_io_completed(),
            KernelEvent::BlockingRequest(unit) => self.on_blocking_request(unit),
            KernelEvent::UnitTerminated(unit) => self.on_unit_terminated(unit),
            KernelEvent::Shutdown => Ok(HandlerOutcome::Ignored(IgnoreReason::Shutdown)),
        }?;
        self.check_invariants()?;
        Ok(outcome)
    }

    /// Time-slice expiry (IRQ0)
    ///
    /// Pauses the current unit and resumes the next eligible one after it.
    /// If the current unit is terminated or blocked the event is stale. If
    /// nothing is current, the scan starts after the last unit that was.
    pub fn on_time_slice_expired(&mut self) -> Result<HandlerOutcome, KernelError> {
        const EVENT: &str = "time_slice_expired";

        let Some(current) = self.current else {
            return Ok(match self.next_eligible(self.cursor, None) {
                Some(next) => {
                    self.dispatch(next, EVENT);
                    HandlerOutcome::Applied
                }
                None => self.ignore(EVENT, None, IgnoreReason::NothingToDispatch),
            });
        };

        if !self.units[current].is_runnable() {
            return Ok(self.ignore(EVENT, Some(current), IgnoreReason::CurrentNotRunnable));
        }

        self.command(current, UnitCommand::Pause);
        self.audit_log.push(ScheduleEvent::Preempted { index: current });
        self.trace(LogLevel::Info, "time slice expired, pausing unit", "preempt", Some(current));

        match self.next_eligible(current, Some(current)) {
            Some(next) => self.dispatch(next, EVENT),
            None => self.no_eligible_unit(EVENT),
        }
        Ok(HandlerOutcome::Applied)
    }

    /// I/O completion (IRQ1)
    ///
    /// Unblocks the unit at the head of the wait queue. Does not switch.
    pub fn on_io_completed(&mut self) -> Result<HandlerOutcome, KernelError> {
        const EVENT: &str = "io_completed";

        let Some(index) = self.io_queue.pop() else {
            return Ok(self.ignore(EVENT, None, IgnoreReason::QueueEmpty));
        };

        if !self.units[index].is_active() {
            self.units[index].blocked = false;
            return Ok(self.ignore(EVENT, Some(index), IgnoreReason::AlreadyTerminated));
        }

        self.units[index].blocked = false;
        self.audit_log.push(ScheduleEvent::Unblocked { index });
        self.trace(LogLevel::Info, "I/O completed, unblocking unit", "unblock", Some(index));
        Ok(HandlerOutcome::Applied)
    }

    /// Blocking request (I/O syscall) from a unit
    ///
    /// Marks the unit blocked, queues it, pauses it, and if it was the
    /// current unit hands the CPU to the next eligible one.
    pub fn on_blocking_request(&mut self, unit: UnitId) -> Result<HandlerOutcome, KernelError> {
        const EVENT: &str = "blocking_request";

        let Some(index) = self.index_of(unit) else {
            return Ok(self.ignore_unknown(EVENT, unit));
        };
        if !self.units[index].is_active() {
            return Ok(self.ignore(EVENT, Some(index), IgnoreReason::AlreadyTerminated));
        }
        if self.units[index].blocked {
            return Ok(self.ignore(EVENT, Some(index), IgnoreReason::AlreadyBlocked));
        }

        self.units[index].blocked = true;
        self.io_queue
            .push(index)
            .map_err(|err| KernelError::InvariantViolation(err.to_string()))?;
        self.command(index, UnitCommand::Pause);

        let was_current = self.current == Some(index);
        let origin = self.current.unwrap_or(self.cursor);
        if was_current {
            self.current = None;
        }
        self.audit_log.push(ScheduleEvent::Blocked { index });
        self.trace(LogLevel::Info, "unit requested I/O, blocking", "block", Some(index));

        if self.current.is_none() {
            match self.next_eligible(origin, Some(index)) {
                Some(next) => self.dispatch(next, EVENT),
                None => self.no_eligible_unit(EVENT),
            }
        }
        Ok(HandlerOutcome::Applied)
    }

    /// Termination notification from a unit
    ///
    /// Terminated units are never scheduled again and are pruned from the
    /// I/O queue, keeping the order of the remaining entries.
    pub fn on_unit_terminated(&mut self, unit: UnitId) -> Result<HandlerOutcome, KernelError> {
        const EVENT: &str = "unit_terminated";

        let Some(index) = self.index_of(unit) else {
            return Ok(self.ignore_unknown(EVENT, unit));
        };
        if !self.units[index].is_active() {
            return Ok(self.ignore(EVENT, Some(index), IgnoreReason::AlreadyTerminated));
        }

        let record = &mut self.units[index];
        record.lifecycle = Lifecycle::Terminated;
        record.blocked = false;
        self.io_queue.remove(index);

        let was_current = self.current == Some(index);
        if was_current {
            self.current = None;
        }
        self.audit_log.push(ScheduleEvent::Terminated { index });
        self.trace(LogLevel::Info, "unit terminated", "terminate", Some(index));

        if was_current {
            match self.next_eligible(index, Some(index)) {
                Some(next) => self.dispatch(next, EVENT),
                None => self.no_eligible_unit(EVENT),
            }
        }
        Ok(HandlerOutcome::Applied)
    }

    /// Forward scan for the next runnable unit
    ///
    /// Considers `origin+1, origin+2, ..., origin+N` (mod N) in that order,
    /// skipping `exclude`, and returns the first runnable index.
    pub fn next_eligible(&self, origin: usize, exclude: Option<usize>) -> Option<usize> {
        let n = self.units.len();
        (1..=n)
            .map(|step| (origin + step) % n)
            .find(|&index| Some(index) != exclude && self.units[index].is_runnable())
    }

    /// Verifies every bookkeeping invariant
    ///
    /// - the I/O queue holds no duplicates and only blocked units
    /// - every blocked unit is queued
    /// - terminated units are neither blocked, queued nor current
    /// - the current unit, if any, is active and not blocked
    pub fn check_invariants(&self) -> Result<(), KernelError> {
        let violation = |msg: String| Err(KernelError::InvariantViolation(msg));
        let n = self.units.len();
        let queue = self.io_queue.to_vec();

        if queue.len() > self.io_queue.capacity() {
            return violation(format!(
                "I/O queue holds {} entries, capacity {}",
                queue.len(),
                self.io_queue.capacity()
            ));
        }
        for (pos, &index) in queue.iter().enumerate() {
            if index >= n {
                return violation(format!("I/O queue holds unknown index {}", index));
            }
            if queue[..pos].contains(&index) {
                return violation(format!("unit {} queued twice", index));
            }
            if !self.units[index].blocked {
                return violation(format!("unit {} queued but not blocked", index));
            }
        }
        for (index, record) in self.units.iter().enumerate() {
            if record.blocked && !queue.contains(&index) {
                return violation(format!("unit {} blocked but not queued", index));
            }
            if !record.is_active() && record.blocked {
                return violation(format!("terminated unit {} is blocked", index));
            }
        }
        if let Some(current) = self.current {
            if current >= n {
                return violation(format!("current index {} out of range", current));
            }
            if !self.units[current].is_runnable() {
                return violation(format!("current unit {} is not runnable", current));
            }
        }
        Ok(())
    }

    /// Returns the current unit index
    pub fn current(&self) -> Option<usize> {
        self.current
    }

    /// Returns the I/O wait queue contents, head first
    pub fn io_queue(&self) -> Vec<usize> {
        self.io_queue.to_vec()
    }

    /// Returns the record at `index`
    pub fn unit(&self, index: usize) -> Option<&UnitRecord> {
        self.units.get(index)
    }

    /// Returns all unit records in slot order
    pub fn units(&self) -> &[UnitRecord] {
        &self.units
    }

    /// Resolves a unit identity to its slot index
    pub fn index_of(&self, unit: UnitId) -> Option<usize> {
        self.units.iter().position(|record| record.id == unit)
    }

    /// Returns true once every unit has terminated
    pub fn all_terminated(&self) -> bool {
        self.units.iter().all(|record| !record.is_active())
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            current: self.current,
            io_queue: self.io_queue.to_vec(),
            units: self.units.clone(),
        }
    }

    /// Returns a reference to the audit log
    pub fn audit_log(&self) -> &[ScheduleEvent] {
        &self.audit_log
    }

    /// Clears the audit log
    pub fn clear_audit_log(&mut self) {
        self.audit_log.clear();
    }

    /// Marks a unit blocked without queueing it
    #[cfg(test)]
    pub(crate) fn corrupt_blocked_flag(&mut self, index: usize) {
        self.units[index].blocked = true;
    }

    fn dispatch(&mut self, index: usize, trigger: &str) {
        self.current = Some(index);
        self.cursor = index;
        self.command(index, UnitCommand::Resume);
        self.audit_log.push(ScheduleEvent::Dispatched { index });
        self.sink.record(
            self.entry(LogLevel::Info, "dispatching unit", "dispatch", Some(index))
                .with_field("trigger", trigger),
        );
    }

    fn no_eligible_unit(&mut self, trigger: &str) {
        self.current = None;
        self.audit_log.push(ScheduleEvent::NoEligibleUnit);
        self.sink.record(
            self.entry(LogLevel::Warn, "no eligible unit to run", "no_eligible_unit", None)
                .with_field("trigger", trigger),
        );
    }

    fn ignore(&mut self, event: &str, index: Option<usize>, reason: IgnoreReason) -> HandlerOutcome {
        self.audit_log.push(ScheduleEvent::Stale {
            event: event.to_string(),
            reason,
        });
        // An empty I/O queue is the common case on every IRQ1 tick.
        let level = match reason {
            IgnoreReason::QueueEmpty | IgnoreReason::NothingToDispatch => LogLevel::Debug,
            _ => LogLevel::Warn,
        };
        self.sink.record(
            self.entry(level, "ignoring stale event", "ignored", index)
                .with_field("trigger", event)
                .with_field("reason", format!("{:?}", reason)),
        );
        HandlerOutcome::Ignored(reason)
    }

    fn ignore_unknown(&mut self, event: &str, unit: UnitId) -> HandlerOutcome {
        self.audit_log.push(ScheduleEvent::Stale {
            event: event.to_string(),
            reason: IgnoreReason::UnknownUnit,
        });
        self.sink.record(
            self.entry(LogLevel::Warn, "ignoring event for unknown unit", "ignored", None)
                .with_source(unit)
                .with_field("trigger", event),
        );
        HandlerOutcome::Ignored(IgnoreReason::UnknownUnit)
    }

    fn command(&mut self, index: usize, command: UnitCommand) {
        if let Err(err) = self.controls[index].send(command) {
            let entry = self
                .entry(LogLevel::Warn, "command not delivered", "command_failed", Some(index))
                .with_field("command", command)
                .with_field("error", err);
            self.sink.record(entry);
        }
    }

    fn trace(&self, level: LogLevel, message: &str, event: &str, index: Option<usize>) {
        self.sink.record(self.entry(level, message, event, index));
    }

    /// Log line carrying the event kind, the unit and the resulting state
    fn entry(&self, level: LogLevel, message: &str, event: &str, index: Option<usize>) -> LogEntry {
        let mut entry = LogEntry::new(level, COMPONENT, message).with_field("event", event);
        if let Some(index) = index {
            entry = entry
                .with_source(self.units[index].id)
                .with_field("unit", index);
        }
        let current = self
            .current
            .map(|index| index.to_string())
            .unwrap_or_else(|| "none".to_string());
        let queue = self
            .io_queue
            .to_vec()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        entry
            .with_field("current", current)
            .with_field("queue", format!("[{}]", queue))
    }
}
