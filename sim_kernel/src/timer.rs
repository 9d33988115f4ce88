//! # Timer Source
//!
//! Periodic interrupt generator for the scheduler core.
//!
//! ## Philosophy
//!
//! **The timer knows nothing about scheduling.**
//!
//! Two independent periods drive the core:
//! - every `slice_interval` a [`KernelEvent::TimeSliceExpired`] (IRQ0)
//! - every `io_interval` a [`KernelEvent::IoCompleted`] (IRQ1)
//!
//! Each period runs on its own thread and only ever enqueues events. The
//! waits are `recv_timeout` on a stop channel, so [`TimerSource::stop`]
//! takes effect immediately instead of after the next tick.

use crossbeam_channel::{self as chan, RecvTimeoutError};
use kernel_api::{KernelApi, KernelError, KernelEvent};
use serde::{Deserialize, Serialize};
use services_logger::{LogEntry, LogLevel, LogSink};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const COMPONENT: &str = "timer";

/// Timer periods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Time-slice period (A)
    pub slice_interval_ms: u64,
    /// I/O completion period (B)
    pub io_interval_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            slice_interval_ms: 1_000,
            io_interval_ms: 3_000,
        }
    }
}

impl TimerConfig {
    /// Both periods must be non-zero and I/O must complete slower than
    /// slices expire.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.slice_interval_ms == 0 || self.io_interval_ms == 0 {
            return Err(KernelError::InvalidConfig(
                "timer intervals must be non-zero".to_string(),
            ));
        }
        if self.io_interval_ms <= self.slice_interval_ms {
            return Err(KernelError::InvalidConfig(format!(
                "io_interval_ms ({}) must exceed slice_interval_ms ({})",
                self.io_interval_ms, self.slice_interval_ms
            )));
        }
        Ok(())
    }

    pub fn slice_interval(&self) -> Duration {
        Duration::from_millis(self.slice_interval_ms)
    }

    pub fn io_interval(&self) -> Duration {
        Duration::from_millis(self.io_interval_ms)
    }
}

/// Events delivered by a timer before it stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerStats {
    pub slice_ticks: u64,
    pub io_ticks: u64,
}

/// Running timer source
pub struct TimerSource {
    stop: Option<chan::Sender<()>>,
    slice: Option<JoinHandle<u64>>,
    io: Option<JoinHandle<u64>>,
}

impl TimerSource {
    /// Starts both periods against `kernel`
    pub fn start<K>(
        config: TimerConfig,
        kernel: K,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, KernelError>
    where
        K: KernelApi + Clone + Send + 'static,
    {
        config.validate()?;
        let (stop_tx, stop_rx) = chan::bounded::<()>(0);

        let slice = spawn_period(
            "timer-slice",
            config.slice_interval(),
            KernelEvent::TimeSliceExpired,
            kernel.clone(),
            stop_rx.clone(),
            sink.clone(),
        )?;
        let io = spawn_period(
            "timer-io",
            config.io_interval(),
            KernelEvent::IoCompleted,
            kernel,
            stop_rx,
            sink.clone(),
        )?;

        sink.record(
            LogEntry::new(LogLevel::Info, COMPONENT, "timer started")
                .with_field("slice_ms", config.slice_interval_ms)
                .with_field("io_ms", config.io_interval_ms),
        );

        Ok(Self {
            stop: Some(stop_tx),
            slice: Some(slice),
            io: Some(io),
        })
    }

    /// Halts both periods; no further events are delivered
    ///
    /// Does not wait for the threads. Idempotent.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects both waits.
        self.stop.take();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_none()
    }

    /// Stops the timer and waits for both threads
    pub fn join(mut self) -> TimerStats {
        self.stop();
        TimerStats {
            slice_ticks: self.slice.take().map(join_period).unwrap_or(0),
            io_ticks: self.io.take().map(join_period).unwrap_or(0),
        }
    }
}

impl Drop for TimerSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_period(handle: JoinHandle<u64>) -> u64 {
    handle.join().unwrap_or(0)
}

fn spawn_period<K>(
    name: &str,
    interval: Duration,
    event: KernelEvent,
    kernel: K,
    stop: chan::Receiver<()>,
    sink: Arc<dyn LogSink>,
) -> Result<JoinHandle<u64>, KernelError>
where
    K: KernelApi + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || run_period(interval, event, &kernel, &stop, sink.as_ref()))
        .map_err(|err| KernelError::InvalidConfig(format!("cannot spawn timer thread: {}", err)))
}

fn run_period<K: KernelApi>(
    interval: Duration,
    event: KernelEvent,
    kernel: &K,
    stop: &chan::Receiver<()>,
    sink: &dyn LogSink,
) -> u64 {
    let mut delivered = 0;
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                if let Err(err) = kernel.submit(event) {
                    sink.record(
                        LogEntry::new(LogLevel::Warn, COMPONENT, "kernel unreachable, stopping")
                            .with_field("event", event.kind())
                            .with_field("error", err),
                    );
                    break;
                }
                delivered += 1;
                sink.record(
                    LogEntry::new(LogLevel::Debug, COMPONENT, "interrupt delivered")
                        .with_field("event", event.kind())
                        .with_field("count", delivered),
                );
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::KernelId;
    use kernel_api::KernelHandle;
    use services_logger::MemoryLogSink;
    use std::time::Instant;

    fn fast_config() -> TimerConfig {
        TimerConfig {
            slice_interval_ms: 5,
            io_interval_ms: 15,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(TimerConfig::default().validate().is_ok());
        assert!(TimerConfig {
            slice_interval_ms: 10,
            io_interval_ms: 10,
        }
        .validate()
        .is_err());
        assert!(TimerConfig {
            slice_interval_ms: 0,
            io_interval_ms: 10,
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: TimerConfig = serde_json::from_str(r#"{"io_interval_ms": 4000}"#).unwrap();
        assert_eq!(config.slice_interval_ms, 1_000);
        assert_eq!(config.io_interval_ms, 4_000);
    }

    #[test]
    fn test_timer_delivers_both_events() {
        let (tx, rx) = chan::unbounded();
        let kernel = KernelHandle::new(KernelId::new(), tx);
        let timer = TimerSource::start(fast_config(), kernel, Arc::new(MemoryLogSink::new())).unwrap();

        thread::sleep(Duration::from_millis(80));
        let stats = timer.join();

        let events: Vec<KernelEvent> = rx.try_iter().collect();
        let slices = events
            .iter()
            .filter(|e| **e == KernelEvent::TimeSliceExpired)
            .count() as u64;
        let ios = events
            .iter()
            .filter(|e| **e == KernelEvent::IoCompleted)
            .count() as u64;

        assert_eq!(slices, stats.slice_ticks);
        assert_eq!(ios, stats.io_ticks);
        assert!(slices >= 2);
        assert!(ios >= 1);
        assert!(slices > ios);
    }

    #[test]
    fn test_stop_halts_delivery() {
        let (tx, rx) = chan::unbounded();
        let kernel = KernelHandle::new(KernelId::new(), tx);
        let mut timer = TimerSource::start(fast_config(), kernel, Arc::new(MemoryLogSink::new())).unwrap();

        thread::sleep(Duration::from_millis(20));
        timer.stop();
        assert!(timer.is_stopped());
        timer.join();

        let before = rx.try_iter().count();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(rx.try_iter().count(), 0);
        assert!(before >= 1);
    }

    #[test]
    fn test_stop_is_prompt_with_long_intervals() {
        let (tx, _rx) = chan::unbounded();
        let kernel = KernelHandle::new(KernelId::new(), tx);
        let timer = TimerSource::start(TimerConfig::default(), kernel, Arc::new(MemoryLogSink::new())).unwrap();

        let started = Instant::now();
        let stats = timer.join();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(stats, TimerStats::default());
    }

    #[test]
    fn test_timer_stops_when_kernel_gone() {
        let (tx, rx) = chan::unbounded();
        let kernel = KernelHandle::new(KernelId::new(), tx);
        drop(rx);
        let sink = Arc::new(MemoryLogSink::new());
        let timer = TimerSource::start(fast_config(), kernel, sink.clone()).unwrap();

        thread::sleep(Duration::from_millis(40));
        let stats = timer.join();
        assert_eq!(stats.slice_ticks, 0);
        assert!(sink
            .lines()
            .iter()
            .any(|line| line.contains("kernel unreachable")));
    }
}
