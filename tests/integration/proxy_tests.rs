use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use worker_supervisor::client::Client;
use worker_supervisor::diagnostics::{Diagnostics, DumpRequest};
use worker_supervisor::leak::MemoryProbe;
use worker_supervisor::worker::Worker;
use worker_supervisor::AppError;

use super::test_helpers::{TestSupervisor, TIMEOUT};

struct ConstantProbe;

impl MemoryProbe for ConstantProbe {
    fn resident_size(&self, _process_id: u32) -> Option<u64> {
        Some(8_192)
    }
}

fn worker(supervisor: &TestSupervisor) -> Worker {
    let diagnostics = Arc::new(Diagnostics::with_probe(
        std::process::id(),
        Arc::new(ConstantProbe),
    ));
    Worker::with_diagnostics(supervisor.endpoint.clone(), diagnostics)
}

#[tokio::test]
async fn at_unknown_id_is_not_found() {
    let supervisor = TestSupervisor::start(Vec::new());
    let connection = Client::new(supervisor.endpoint.clone())
        .connect()
        .await
        .expect("client connects");

    let err = connection
        .supervisor()
        .at(99_999)
        .await
        .expect_err("empty registry");
    assert!(matches!(err, AppError::NotFound(ref msg) if msg.contains("99999")));
}

#[tokio::test]
async fn forwarded_call_matches_direct_call() {
    let supervisor = TestSupervisor::start(Vec::new());
    let worker = worker(&supervisor);
    let session = worker.connect().await.expect("registers");

    let connection = Client::new(supervisor.endpoint.clone())
        .connect()
        .await
        .expect("client connects");
    let remote = connection.supervisor().at(session.id()).await.expect("worker found");
    assert_eq!(remote.proxy().name(), format!("worker-{}", session.id()));

    for _ in 0..50 {
        let again = connection.supervisor().at(session.id()).await.expect("worker found");
        assert_eq!(again.proxy().name(), remote.proxy().name());
    }

    let forwarded = remote
        .proxy()
        .invoke("process_id", Value::Null)
        .await
        .expect("forwarded call");
    assert_eq!(forwarded, json!(worker.diagnostics().process_id()));

    let started = remote.garbage_profile_start().await.expect("profile start");
    assert_eq!(started["started"], true);
    assert!(worker.diagnostics().is_profiling());
    remote
        .garbage_profile_stop(&DumpRequest::default())
        .await
        .expect("profile stop");
    assert!(!worker.diagnostics().is_profiling());
}

#[tokio::test]
async fn forwarded_dump_writes_on_worker_side() {
    let supervisor = TestSupervisor::start(Vec::new());
    let worker = worker(&supervisor);
    let session = worker.connect().await.expect("registers");
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("threads.txt");

    let connection = Client::new(supervisor.endpoint.clone())
        .connect()
        .await
        .expect("client connects");
    let remote = connection.supervisor().at(session.id()).await.expect("worker found");

    let output = remote
        .thread_dump(&DumpRequest::to_path(&path))
        .await
        .expect("thread dump");
    assert_eq!(output.path.as_deref(), Some(path.as_path()));
    assert!(std::fs::read_to_string(&path)
        .expect("dump written")
        .contains("threads in process"));

    let err = remote
        .proxy()
        .invoke("no_such_method", Value::Null)
        .await
        .expect_err("unknown method");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn memory_sample_through_supervisor() {
    let supervisor = TestSupervisor::start(Vec::new());
    let worker = worker(&supervisor);
    let session = worker.connect().await.expect("registers");

    let connection = Client::new(supervisor.endpoint.clone())
        .connect()
        .await
        .expect("client connects");
    let remote = connection.supervisor().at(session.id()).await.expect("worker found");

    let request = DumpRequest::default();
    let started = Instant::now();
    let sample = remote.memory_sample(1.0, &request);
    let output = tokio::time::timeout(TIMEOUT, sample)
        .await
        .expect("sample in time")
        .expect("sample");
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(5));
    assert!(output.data.expect("report").contains("memory report"));

    let err = remote
        .memory_sample(0.0, &DumpRequest::default())
        .await
        .expect_err("zero duration");
    assert!(matches!(err, AppError::InvalidArgument(_)));

    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("sample.txt");
    let output = remote
        .memory_sample(0.1, &DumpRequest::to_path(&path))
        .await
        .expect("sample to file");
    assert_eq!(output.path.as_deref(), Some(path.as_path()));
    assert!(std::fs::read_to_string(&path)
        .expect("report written")
        .contains("memory report"));
}

#[tokio::test]
async fn memory_dump_without_path_is_rejected_remotely() {
    let supervisor = TestSupervisor::start(Vec::new());
    let worker = worker(&supervisor);
    let session = worker.connect().await.expect("registers");

    let connection = Client::new(supervisor.endpoint.clone())
        .connect()
        .await
        .expect("client connects");
    let remote = connection.supervisor().at(session.id()).await.expect("worker found");

    let err = remote
        .proxy()
        .invoke("memory_dump", Value::Null)
        .await
        .expect_err("path required");
    assert!(matches!(err, AppError::InvalidArgument(_)));
}
