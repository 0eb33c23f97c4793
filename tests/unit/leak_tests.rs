use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use worker_supervisor::leak::{LeakCluster, LeakOptions, MemoryProbe};

#[derive(Default)]
struct FakeProbe {
    sizes: Mutex<HashMap<u32, u64>>,
}

impl FakeProbe {
    fn set(&self, pid: u32, size: u64) {
        self.sizes.lock().unwrap().insert(pid, size);
    }
}

impl MemoryProbe for FakeProbe {
    fn resident_size(&self, process_id: u32) -> Option<u64> {
        self.sizes.lock().unwrap().get(&process_id).copied()
    }
}

fn leaking_ids(cluster: &mut LeakCluster) -> Vec<u32> {
    let mut ids: Vec<u32> = cluster.check().iter().map(|m| m.process_id).collect();
    ids.sort_unstable();
    ids
}

#[test]
fn flags_process_after_repeated_growth() {
    let probe = Arc::new(FakeProbe::default());
    let mut cluster = LeakCluster::with_probe(None, probe.clone());
    cluster.add(
        10,
        LeakOptions {
            increase_limit: 3,
            maximum_size_limit: None,
        },
    );

    for (round, size) in [100, 110, 120].into_iter().enumerate() {
        probe.set(10, size);
        assert!(leaking_ids(&mut cluster).is_empty(), "round {round} is below the limit");
    }

    probe.set(10, 130);
    assert_eq!(leaking_ids(&mut cluster), [10]);

    cluster.acknowledge(10);
    assert_eq!(cluster.get(10).map(|m| m.increase_count), Some(0));
    assert!(leaking_ids(&mut cluster).is_empty());
}

#[test]
fn flags_process_over_maximum_size() {
    let probe = Arc::new(FakeProbe::default());
    let mut cluster = LeakCluster::with_probe(None, probe.clone());
    cluster.add(
        20,
        LeakOptions {
            increase_limit: 100,
            maximum_size_limit: Some(1_000),
        },
    );

    probe.set(20, 500);
    assert!(leaking_ids(&mut cluster).is_empty());
    probe.set(20, 1_500);
    assert_eq!(leaking_ids(&mut cluster), [20]);
}

#[test]
fn flags_largest_processes_over_total_limit() {
    let probe = Arc::new(FakeProbe::default());
    let mut cluster = LeakCluster::with_probe(Some(1_000), probe.clone());
    for (pid, size) in [(1, 300), (2, 600), (3, 400)] {
        cluster.add(pid, LeakOptions::default());
        probe.set(pid, size);
    }

    // 1300 total: dropping the 600 brings it to 700.
    assert_eq!(leaking_ids(&mut cluster), [2]);
}

#[test]
fn adding_twice_keeps_history() {
    let probe = Arc::new(FakeProbe::default());
    let mut cluster = LeakCluster::with_probe(None, probe.clone());
    cluster.add(5, LeakOptions::default());
    probe.set(5, 10);
    cluster.check();
    probe.set(5, 20);
    cluster.check();

    cluster.add(5, LeakOptions::default());
    assert_eq!(cluster.get(5).map(|m| m.increase_count), Some(1));
    assert_eq!(cluster.process_ids(), [5]);

    assert!(cluster.remove(5).is_some());
    assert!(!cluster.contains(5));
}

#[test]
fn vanished_process_is_not_sampled() {
    let probe = Arc::new(FakeProbe::default());
    let mut cluster = LeakCluster::with_probe(Some(1), probe);
    cluster.add(9, LeakOptions::default());

    assert!(leaking_ids(&mut cluster).is_empty());
    assert_eq!(cluster.get(9).and_then(|m| m.current_size), None);
}

#[test]
fn serializes_processes_by_pid() {
    let probe = Arc::new(FakeProbe::default());
    let mut cluster = LeakCluster::with_probe(Some(4_096), probe.clone());
    cluster.add(42, LeakOptions::default());
    probe.set(42, 2_048);
    cluster.check();

    let json = cluster.as_json();
    assert_eq!(json["total_size_limit"], 4_096);
    assert_eq!(json["processes"]["42"]["current_size"], 2_048);
    assert_eq!(json["processes"]["42"]["increase_limit"], 20);
}
