//! # Lifecycle
//!
//! Stop signals and deadlines shared by the kernel loop and the managed
//! units.
//!
//! ## Philosophy
//!
//! - **Explicit over implicit**: Stopping is a value handed to each thread,
//!   not a global flag or a signal handler
//! - **One signal is enough**: A single `cancel` reaches every token cloned
//!   from the same source, on any thread
//! - **Mechanism not policy**: Each component decides what "stop" means for
//!   it (a unit tears down, a wait gives up)
//!
//! ## Core Concepts
//!
//! - `CancellationSource`: Owned by whoever may request the stop
//! - `CancellationToken`: Cloneable, `Send + Sync` view of that request
//! - `CancellationReason`: Why the stop was requested
//! - `Deadline`: Point in time after which a wait gives up

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Reason for cancellation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancellationReason {
    /// The orchestrator is shutting the simulation down
    Shutdown,
    /// The orchestrator was dropped without an explicit shutdown
    OwnerDropped,
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancellationReason::Shutdown => write!(f, "shutdown"),
            CancellationReason::OwnerDropped => write!(f, "owner dropped"),
        }
    }
}

/// `None` until the first cancel; the first reason is kept
type SharedReason = Arc<Mutex<Option<CancellationReason>>>;

fn read_reason(shared: &SharedReason) -> Option<CancellationReason> {
    // A poisoned lock still holds a valid reason.
    match shared.lock() {
        Ok(reason) => reason.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Read side of a stop request
///
/// ```
/// use lifecycle::{CancellationReason, CancellationSource};
///
/// let source = CancellationSource::new();
/// let token = source.token();
/// assert!(!token.is_cancelled());
///
/// source.cancel(CancellationReason::Shutdown);
/// assert_eq!(token.reason(), Some(CancellationReason::Shutdown));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    shared: SharedReason,
}

impl CancellationToken {
    /// A token no source can ever cancel
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Returns the reason for cancellation, if cancelled
    pub fn reason(&self) -> Option<CancellationReason> {
        read_reason(&self.shared)
    }
}

/// Write side of a stop request
#[derive(Debug, Default)]
pub struct CancellationSource {
    shared: SharedReason,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token observing this source
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            shared: self.shared.clone(),
        }
    }

    /// Cancels every token of this source; later calls keep the first reason
    pub fn cancel(&self, reason: CancellationReason) {
        let mut slot = match self.shared.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_none() {
            *slot = Some(reason);
        }
    }
}

/// A point in time when a wait should give up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    instant: Instant,
}

impl Deadline {
    pub fn at(instant: Instant) -> Self {
        Self { instant }
    }

    /// Creates a deadline `duration` from now
    pub fn after(duration: Duration) -> Self {
        Self::at(Instant::now() + duration)
    }

    pub fn has_passed(&self, now: Instant) -> bool {
        now >= self.instant
    }

    /// Checks the deadline against the wall clock
    pub fn is_expired(&self) -> bool {
        self.has_passed(Instant::now())
    }

    /// Time left before the deadline; `None` once it has passed
    pub fn time_remaining(&self, now: Instant) -> Option<Duration> {
        if now < self.instant {
            Some(self.instant.duration_since(now))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_token_none_is_never_cancelled() {
        let token = CancellationToken::none();
        assert!(!token.is_cancelled());
        assert_eq!(token.reason(), None);
    }

    #[test]
    fn test_cancel_reaches_every_token() {
        let source = CancellationSource::new();
        let first = source.token();
        let second = first.clone();

        source.cancel(CancellationReason::Shutdown);

        assert!(first.is_cancelled());
        assert_eq!(second.reason(), Some(CancellationReason::Shutdown));
    }

    #[test]
    fn test_first_reason_wins() {
        let source = CancellationSource::new();
        let token = source.token();

        source.cancel(CancellationReason::Shutdown);
        source.cancel(CancellationReason::OwnerDropped);

        assert_eq!(token.reason(), Some(CancellationReason::Shutdown));
    }

    #[test]
    fn test_cancellation_crosses_threads() {
        let source = CancellationSource::new();
        let token = source.token();

        let waiter = thread::spawn(move || {
            while !token.is_cancelled() {
                thread::yield_now();
            }
            token.reason()
        });

        source.cancel(CancellationReason::OwnerDropped);
        assert_eq!(
            waiter.join().unwrap(),
            Some(CancellationReason::OwnerDropped)
        );
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(CancellationReason::Shutdown.to_string(), "shutdown");
        assert_eq!(CancellationReason::OwnerDropped.to_string(), "owner dropped");
    }

    #[test]
    fn test_deadline_time_remaining() {
        let now = Instant::now();
        let deadline = Deadline::at(now + Duration::from_millis(10));

        assert!(!deadline.has_passed(now));
        assert_eq!(
            deadline.time_remaining(now),
            Some(Duration::from_millis(10))
        );

        let later = now + Duration::from_millis(10);
        assert!(deadline.has_passed(later));
        assert_eq!(deadline.time_remaining(later), None);
    }

    #[test]
    fn test_zero_deadline_is_expired() {
        assert!(Deadline::after(Duration::ZERO).is_expired());
    }
}
