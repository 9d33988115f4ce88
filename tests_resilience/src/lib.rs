//! Resilience Test Utilities
//!
//! This crate provides shared utilities for resilience and integration tests.
//!
//! ## Test Philosophy
//!
//! - **Invariants under any order**: Scheduler bookkeeping must hold after
//!   every event, whatever order events arrive in
//! - **Deterministic sequences**: Random event streams are seeded and
//!   reproducible
//! - **No lost progress**: A unit's counter survives every pause exactly
//! - **Clean teardown**: Handle and state files are gone after shutdown

use core_types::UnitId;
use kernel_api::KernelEvent;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use services_process_manager::{SimulationConfig, UnitConfig};
use sim_kernel::test_utils::{scheduler_bench, SchedulerBench};
use sim_kernel::{SchedulerConfig, TimerConfig};
use std::path::Path;

/// Bootstrap helper for tests
///
/// Creates a scheduler over `units` recording units and performs the
/// initial dispatch, so unit 0 is current.
pub fn started_bench(units: usize) -> SchedulerBench {
    let mut bench = scheduler_bench(units);
    bench
        .scheduler
        .start()
        .expect("initial dispatch keeps invariants");
    bench
}

/// Generates a reproducible stream of scheduler events
///
/// Blocking requests and terminations name a random known unit, or now and
/// then an identity the scheduler has never seen.
pub fn random_events(seed: u64, units: &[UnitId], len: usize) -> Vec<KernelEvent> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len)
        .map(|_| {
            let unit = if rng.gen_ratio(1, 20) {
                UnitId::new()
            } else {
                units[rng.gen_range(0..units.len())]
            };
            match rng.gen_range(0..10) {
                0..=3 => KernelEvent::TimeSliceExpired,
                4..=5 => KernelEvent::IoCompleted,
                6..=8 => KernelEvent::BlockingRequest(unit),
                _ => KernelEvent::UnitTerminated(unit),
            }
        })
        .collect()
}

/// A whole simulation that finishes in well under a second
pub fn fast_simulation(dir: &Path, units: usize, seed: u64) -> SimulationConfig {
    let mut config = SimulationConfig::in_dir(dir);
    config.scheduler = SchedulerConfig {
        unit_count: units,
        shutdown_grace_ms: 200,
    };
    config.timer = TimerConfig {
        slice_interval_ms: 4,
        io_interval_ms: 12,
    };
    config.unit = UnitConfig {
        max_iterations: 5,
        work_ms: 2,
        block_probability: 0.25,
        seed: Some(seed),
        resume_timeout_ms: Some(10_000),
    };
    config.discovery.poll_interval_ms = 5;
    config
}
