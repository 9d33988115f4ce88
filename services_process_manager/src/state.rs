//! Managed unit lifecycle

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Lifecycle states for a managed unit
///
/// Unlike the scheduler's view (active/terminated, blocked or not), this is
/// what the unit itself is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitState {
    /// Thread not yet admitted
    Unstarted,
    /// Iterating
    Running,
    /// Program counter written; suspended until resumed
    PausedPersisted,
    /// Finished or torn down; ignores all further commands
    Terminated,
}

impl UnitState {
    /// Checks if the unit is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Terminated)
    }

    /// Checks whether `self -> next` is a legal transition
    ///
    /// Teardown may terminate a unit from any live state.
    pub fn can_transition_to(&self, next: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, next),
            (Unstarted, Running)
                | (Running, PausedPersisted)
                | (PausedPersisted, Running)
                | (Unstarted | Running | PausedPersisted, Terminated)
        )
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitState::Unstarted => "unstarted",
            UnitState::Running => "running",
            UnitState::PausedPersisted => "paused",
            UnitState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// A unit's state, observable from outside its thread
#[derive(Debug, Clone)]
pub struct SharedUnitState {
    inner: Arc<Mutex<UnitState>>,
}

impl SharedUnitState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(UnitState::Unstarted)),
        }
    }

    pub fn get(&self) -> UnitState {
        match self.inner.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Moves to `next`, returning the previous state
    ///
    /// Returns `Err((from, next))` and leaves the state untouched when the
    /// transition is not legal.
    pub fn transition(&self, next: UnitState) -> Result<UnitState, (UnitState, UnitState)> {
        let mut state = match self.inner.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let from = *state;
        if !from.can_transition_to(next) {
            return Err((from, next));
        }
        *state = next;
        Ok(from)
    }
}

impl Default for SharedUnitState {
    fn default() -> Self {
        Self::new()
    }
}
