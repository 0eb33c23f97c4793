use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use worker_supervisor::bus::Connection;
use worker_supervisor::client::WorkerProxy;
use worker_supervisor::controllers::SupervisorController;
use worker_supervisor::leak::{LeakOptions, MemoryProbe};
use worker_supervisor::monitor::{MemoryMonitor, Monitor};
use worker_supervisor::server::Server;

#[derive(Default)]
struct FakeProbe {
    sizes: Mutex<HashMap<u32, u64>>,
}

impl MemoryProbe for FakeProbe {
    fn resident_size(&self, process_id: u32) -> Option<u64> {
        self.sizes.lock().unwrap().get(&process_id).copied()
    }
}

fn monitor(probe: Arc<FakeProbe>) -> Arc<MemoryMonitor> {
    Arc::new(MemoryMonitor::with_probe(Duration::from_secs(10), None, probe))
}

/// A registered controller whose connection never carries traffic.
fn registered(server: &Arc<Server>, process_id: Option<u32>) -> Arc<SupervisorController> {
    let (stream, _peer) = tokio::io::duplex(1024);
    let (connection, _driver) = Connection::new(stream);
    let controller = SupervisorController::new(Arc::clone(server), connection.clone());
    controller
        .register(WorkerProxy::new(connection.proxy("worker")), process_id)
        .expect("registers");
    controller
}

#[tokio::test]
async fn shared_process_is_tracked_once() {
    let memory = monitor(Arc::new(FakeProbe::default()));
    let server = Server::new(vec![memory.clone() as Arc<dyn Monitor>]);

    let first = registered(&server, Some(4242));
    let second = registered(&server, Some(4242));

    assert_eq!(memory.process_ids(), [4242]);
    assert_eq!(memory.controller_count(4242), 2);

    server.remove(&first);
    assert_eq!(memory.process_ids(), [4242]);
    assert_eq!(memory.controller_count(4242), 1);

    server.remove(&second);
    assert!(memory.process_ids().is_empty());
    assert_eq!(memory.controller_count(4242), 0);
}

#[tokio::test]
async fn controller_without_process_id_is_ignored() {
    let memory = monitor(Arc::new(FakeProbe::default()));
    let server = Server::new(vec![memory.clone() as Arc<dyn Monitor>]);

    let controller = registered(&server, None);
    assert!(memory.process_ids().is_empty());

    server.remove(&controller);
    assert!(memory.process_ids().is_empty());
}

#[tokio::test]
async fn removing_unknown_controller_is_harmless() {
    let memory = monitor(Arc::new(FakeProbe::default()));
    let other = Server::new(Vec::new());
    let controller = registered(&other, Some(7));

    memory.remove(&controller).expect("no-op");
    assert!(memory.process_ids().is_empty());
}

#[tokio::test]
async fn status_reports_cluster_state() {
    let probe = Arc::new(FakeProbe::default());
    probe.sizes.lock().unwrap().insert(31, 2_048);
    let memory = Arc::new(
        MemoryMonitor::with_probe(Duration::from_secs(10), Some(1 << 30), probe).with_leak_options(
            LeakOptions {
                increase_limit: 5,
                maximum_size_limit: None,
            },
        ),
    );
    let server = Server::new(vec![memory.clone() as Arc<dyn Monitor>]);
    let _controller = registered(&server, Some(31));

    memory.check().await.expect("check succeeds");

    let status = memory.status().expect("status");
    let cluster = &status["memory_monitor"];
    assert_eq!(cluster["total_size_limit"], 1 << 30);
    assert_eq!(cluster["processes"]["31"]["current_size"], 2_048);
    assert_eq!(cluster["processes"]["31"]["increase_limit"], 5);
    assert_ne!(status, Value::Null);
}

#[tokio::test]
async fn leak_handler_tolerates_exited_process() {
    let probe = Arc::new(FakeProbe::default());
    // Linux caps pids well below i32::MAX, so this process cannot exist.
    let pid = i32::MAX.unsigned_abs();
    probe.sizes.lock().unwrap().insert(pid, 10);
    let memory = Arc::new(
        MemoryMonitor::with_probe(Duration::from_secs(10), None, probe.clone()).with_leak_options(
            LeakOptions {
                increase_limit: 1,
                maximum_size_limit: None,
            },
        ),
    );
    let server = Server::new(vec![memory.clone() as Arc<dyn Monitor>]);
    let _controller = registered(&server, Some(pid));

    memory.check().await.expect("first sample");
    probe.sizes.lock().unwrap().insert(pid, 20);
    memory.check().await.expect("leak handled");

    // Still tracked; history reset after handling.
    assert_eq!(memory.process_ids(), [pid]);
    let status = memory.status().expect("status");
    assert_eq!(
        status["memory_monitor"]["processes"][pid.to_string()]["increase_count"],
        0
    );
}
