//! End-to-End Simulation Tests
//!
//! Real threads, millisecond intervals. These tests validate:
//! - units locate the kernel through the discovery handle
//! - every unit counts to its limit without losing or repeating a value
//! - shutdown removes the handle and every state file

use core_types::KernelId;
use crossbeam_channel::unbounded;
use kernel_api::{KernelApi, KernelHandle};
use services_logger::MemoryLogSink;
use services_process_manager::{ProcessManager, UnitExit};
use services_registry::{locate_kernel, DiscoveryConfig, DiscoveryHandle, ServiceRegistry};
use sim_kernel::Lifecycle;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tests_resilience::fast_simulation;

#[test]
fn test_full_simulation_completes() {
    let dir = tempfile::tempdir().unwrap();
    // Shows the trace when run with RUST_LOG and a logger installed.
    let log = Arc::new(MemoryLogSink::forwarding());
    let config = fast_simulation(dir.path(), 3, 2024);
    let max = config.unit.max_iterations;

    let manager = ProcessManager::start(config, log.clone()).unwrap();
    assert!(dir.path().join("kernel_pid").exists());
    assert!(manager.wait_until_finished(Some(Duration::from_secs(30))));
    let report = manager.shutdown();

    assert!(report.is_success(), "failures: {:?}", report.failures);
    for unit in &report.units {
        assert_eq!(unit.exit, Ok(UnitExit::Completed { iterations: max }));
    }
    let snapshot = report.snapshot.unwrap();
    assert!(snapshot
        .units
        .iter()
        .all(|record| record.lifecycle == Lifecycle::Terminated && !record.blocked));

    // Per unit, the counter runs 1..=max exactly once each.
    let mut seen: HashMap<_, Vec<u32>> = HashMap::new();
    for entry in log.events("running") {
        let pc = entry.field("pc").unwrap().parse().unwrap();
        seen.entry(entry.source.unwrap()).or_default().push(pc);
    }
    assert_eq!(seen.len(), 3);
    for pcs in seen.values() {
        assert_eq!(pcs, &(1..=max).collect::<Vec<_>>());
    }

    assert_eq!(log.events("finished").len(), 3);
    assert!(log.events("dispatch").len() >= 3);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_shutdown_mid_run_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_simulation(dir.path(), 4, 7);
    config.unit.max_iterations = 10_000;
    config.unit.work_ms = 20;

    let manager = ProcessManager::start(config, Arc::new(MemoryLogSink::new())).unwrap();
    assert!(!manager.wait_until_finished(Some(Duration::from_millis(150))));
    let report = manager.shutdown();

    assert!(report.is_success(), "failures: {:?}", report.failures);
    assert_eq!(report.completed_units(), 0);
    assert!(report.timer.slice_ticks > 0);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_locate_waits_for_late_publish() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = DiscoveryConfig::in_dir(dir.path());
    config.poll_interval_ms = 5;
    let discovery = DiscoveryHandle::new(config);
    let registry = ServiceRegistry::shared();

    let waiter = {
        let discovery = discovery.clone();
        let registry = registry.clone();
        thread::spawn(move || locate_kernel(&discovery, &registry))
    };

    thread::sleep(Duration::from_millis(30));
    let id = KernelId::new();
    let (tx, _rx) = unbounded();
    registry
        .lock()
        .unwrap()
        .register(id, KernelHandle::new(id, tx))
        .unwrap();
    discovery.publish(id).unwrap();

    let handle = waiter.join().unwrap().unwrap();
    assert_eq!(handle.kernel_id(), id);
}

#[test]
fn test_partial_handle_is_not_trusted() {
    let dir = tempfile::tempdir().unwrap();
    let discovery = DiscoveryHandle::new(DiscoveryConfig::in_dir(dir.path()));
    fs::write(discovery.path(), "3f2a").unwrap();
    assert_eq!(discovery.try_read().unwrap(), None);
}
