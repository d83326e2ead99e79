//! Integration tests for the scheduling core's end-to-end scenarios
//! (spec.md §8, S1-S3): allocation, lease issuance, and heartbeat loss,
//! driven entirely through the crate's public API.

use loadcore::ids::RunId;
use loadcore::scheduler::{
    Allocator, Capacity, HeartbeatMonitor, HeartbeatMonitorConfig, HostInfo, LeaseManager,
    LeaseState, Registry,
};
use std::time::Duration;

fn host(name: &str) -> HostInfo {
    HostInfo {
        hostname: name.into(),
        ip: "10.0.0.1".into(),
        platform: "linux".into(),
    }
}

fn cap(max_vus: u64) -> Capacity {
    Capacity {
        max_vus,
        max_concurrent_ops: max_vus * 4,
        max_rps: max_vus * 10,
    }
}

/// S1: two workers, capacities 60 and 40, target 100 VUs bin-packs into a
/// [0,60) / [60,100) split with no gaps or overlaps.
#[test]
fn s1_bin_packs_across_two_workers_by_descending_capacity() {
    let registry = Registry::new();
    let big = registry.register(host("big"), cap(60)).unwrap();
    let small = registry.register(host("small"), cap(40)).unwrap();

    let run_id = RunId::new();
    let assignments =
        Allocator::allocate(&registry, run_id, "ramp".into(), 100, &[big.clone(), small.clone()])
            .unwrap();

    assert_eq!(assignments.len(), 2);
    let big_assignment = assignments.iter().find(|a| a.worker_id == big).unwrap();
    let small_assignment = assignments.iter().find(|a| a.worker_id == small).unwrap();
    assert_eq!(big_assignment.vuid_range, 0..60);
    assert_eq!(small_assignment.vuid_range, 60..100);
}

/// S2: a second worker requesting an overlapping VUID range in the same
/// (run, stage) is rejected; the same range on a new stage succeeds.
#[test]
fn s2_overlap_rejected_same_stage_accepted_on_new_stage() {
    let registry = Registry::new();
    let leases = LeaseManager::new(Duration::from_secs(300));
    let w1 = registry.register(host("w1"), cap(200)).unwrap();
    let w2 = registry.register(host("w2"), cap(200)).unwrap();
    let run_id = RunId::new();

    leases
        .issue_lease(
            w1.clone(),
            loadcore::scheduler::Assignment {
                run_id: run_id.clone(),
                stage_id: "steady".into(),
                worker_id: w1.clone(),
                vuid_range: 0..100,
            },
        )
        .unwrap();

    let rejected = leases.issue_lease(
        w2.clone(),
        loadcore::scheduler::Assignment {
            run_id: run_id.clone(),
            stage_id: "steady".into(),
            worker_id: w2.clone(),
            vuid_range: 50..150,
        },
    );
    assert!(rejected.is_err());

    let accepted = leases.issue_lease(
        w2,
        loadcore::scheduler::Assignment {
            run_id,
            stage_id: "ramp-down".into(),
            worker_id: w1,
            vuid_range: 50..150,
        },
    );
    assert!(accepted.is_ok());
}

/// S3: a worker that stops heartbeating past the configured timeout is
/// evicted from the registry and its leases are revoked on the next tick.
#[test]
fn s3_worker_past_timeout_is_evicted_and_leases_revoked() {
    let registry = Registry::new();
    let leases = LeaseManager::new(Duration::from_secs(300));
    let worker_id = registry.register(host("w"), cap(10)).unwrap();

    let run_id = RunId::new();
    let lease_id = leases
        .issue_lease(
            worker_id.clone(),
            loadcore::scheduler::Assignment {
                run_id,
                stage_id: "s".into(),
                worker_id: worker_id.clone(),
                vuid_range: 0..10,
            },
        )
        .unwrap();

    let monitor = HeartbeatMonitor::new(
        registry.clone(),
        leases.clone(),
        HeartbeatMonitorConfig {
            timeout: Duration::from_millis(10),
            interval: Duration::from_millis(5),
        },
    );
    std::thread::sleep(Duration::from_millis(25));
    monitor.tick();

    assert!(registry.get_worker(&worker_id).is_err());
    assert_eq!(leases.get_lease(&lease_id).unwrap().state, LeaseState::Revoked);
}
