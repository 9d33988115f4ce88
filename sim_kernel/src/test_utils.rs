//! Test utilities for scheduler testing
//!
//! Recording command sinks and a ready-made scheduler so tests can drive
//! handlers synchronously and assert on exactly what each unit was told.

use crate::scheduler::Scheduler;
use core_types::UnitId;
use kernel_api::{KernelError, UnitCommand, UnitControl};
use services_logger::{LogSink, MemoryLogSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Command sink that records every command it is given
///
/// Clones share the same record, so a test keeps one clone and hands the
/// other to the scheduler.
#[derive(Debug, Clone, Default)]
pub struct RecordingControl {
    commands: Arc<Mutex<Vec<UnitCommand>>>,
    closed: Arc<AtomicBool>,
}

impl RecordingControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every command received so far, oldest first
    pub fn commands(&self) -> Vec<UnitCommand> {
        self.commands
            .lock()
            .map(|commands| commands.clone())
            .unwrap_or_default()
    }

    pub fn last(&self) -> Option<UnitCommand> {
        self.commands().last().copied()
    }

    pub fn clear(&self) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.clear();
        }
    }

    /// Makes every later send fail, as if the unit had exited
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl UnitControl for RecordingControl {
    fn send(&self, command: UnitCommand) -> Result<(), KernelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KernelError::CommandFailed(format!(
                "{} not delivered: unit gone",
                command
            )));
        }
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command);
        }
        Ok(())
    }
}

/// Unit identities that are stable across runs: 1, 2, 3, ...
pub fn deterministic_unit_ids(count: usize) -> Vec<UnitId> {
    (1..=count as u128)
        .map(|n| UnitId::from_uuid(Uuid::from_u128(n)))
        .collect()
}

/// A scheduler wired to recording controls and an in-memory log
pub struct SchedulerBench {
    pub scheduler: Scheduler,
    pub units: Vec<UnitId>,
    pub controls: Vec<RecordingControl>,
    pub log: Arc<MemoryLogSink>,
}

impl SchedulerBench {
    /// Forgets all commands recorded so far
    pub fn clear_commands(&self) {
        for control in &self.controls {
            control.clear();
        }
    }
}

/// Builds an unstarted scheduler over `count` units
///
/// # Panics
///
/// Panics if `count` is zero.
pub fn scheduler_bench(count: usize) -> SchedulerBench {
    let units = deterministic_unit_ids(count);
    let controls: Vec<RecordingControl> = (0..count).map(|_| RecordingControl::new()).collect();
    let log = Arc::new(MemoryLogSink::new());
    let sink: Arc<dyn LogSink> = log.clone();

    let slots = units
        .iter()
        .zip(&controls)
        .map(|(id, control)| (*id, Box::new(control.clone()) as Box<dyn UnitControl>))
        .collect();
    let scheduler = Scheduler::new(slots, sink).expect("bench needs at least one unit");

    SchedulerBench {
        scheduler,
        units,
        controls,
        log,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_control_shares_record() {
        let control = RecordingControl::new();
        let clone = control.clone();
        clone.send(UnitCommand::Pause).unwrap();
        clone.send(UnitCommand::Resume).unwrap();
        assert_eq!(
            control.commands(),
            vec![UnitCommand::Pause, UnitCommand::Resume]
        );
        assert_eq!(control.last(), Some(UnitCommand::Resume));
    }

    #[test]
    fn test_closed_control_fails() {
        let control = RecordingControl::new();
        control.close();
        assert!(matches!(
            control.send(UnitCommand::Pause),
            Err(KernelError::CommandFailed(_))
        ));
        assert!(control.commands().is_empty());
    }

    #[test]
    fn test_deterministic_ids() {
        let ids = deterministic_unit_ids(3);
        assert_eq!(ids, deterministic_unit_ids(3));
        assert_eq!(ids.len(), 3);
        assert_ne!(ids[0], ids[1]);
    }
}
