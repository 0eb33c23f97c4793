use std::sync::Arc;

use tokio::task::JoinSet;
use worker_supervisor::client::Client;
use worker_supervisor::bus::Reference;
use worker_supervisor::monitor::Monitor;
use worker_supervisor::worker::{supervised_worker, Worker, WorkerSession};
use worker_supervisor::AppError;

use super::test_helpers::{eventually, next_event, Event, RegistrationMonitor, TestSupervisor, TIMEOUT};

async fn connect(worker: &Worker) -> WorkerSession {
    tokio::time::timeout(TIMEOUT, worker.connect())
        .await
        .expect("connect in time")
        .expect("registers")
}

#[tokio::test]
async fn worker_registers_and_is_removed_on_disconnect() {
    let (monitor, mut events) = RegistrationMonitor::new();
    let supervisor = TestSupervisor::start(vec![monitor as Arc<dyn Monitor>]);
    let process_id = Some(std::process::id());

    let worker = Worker::new(supervisor.endpoint.clone());
    let session = connect(&worker).await;
    let id = session.id();

    assert_eq!(next_event(&mut events).await, Event::Registered { id, process_id });
    assert_eq!(worker.id(), Some(id));
    assert_eq!(supervisor.server.keys(), [id]);

    session.close().await;

    assert_eq!(next_event(&mut events).await, Event::Removed { id, process_id });
    eventually(|| supervisor.server.is_empty()).await;
}

#[tokio::test]
async fn supervised_helper_uses_socket_in_root() {
    let supervisor = TestSupervisor::start(Vec::new());

    let worker = supervised_worker(supervisor.root());
    assert_eq!(worker.process_id(), std::process::id());

    let session = connect(&worker).await;
    assert_eq!(supervisor.server.keys(), [session.id()]);
}

#[tokio::test]
async fn second_registration_on_one_connection_fails() {
    let supervisor = TestSupervisor::start(Vec::new());
    let connection = Client::new(supervisor.endpoint.clone())
        .connect()
        .await
        .expect("client connects");
    let supervisor_proxy = connection.supervisor();
    let reference = Reference::new("worker");

    let id = supervisor_proxy
        .register(&reference, None)
        .await
        .expect("first registration");
    let err = supervisor_proxy
        .register(&reference, None)
        .await
        .expect_err("second registration");

    assert_eq!(err, AppError::Protocol("Already registered".into()));
    assert_eq!(supervisor.server.keys(), [id]);
}

#[tokio::test]
async fn concurrent_registrations_get_distinct_ids() {
    let supervisor = TestSupervisor::start(Vec::new());

    let mut tasks = JoinSet::new();
    for _ in 0..16 {
        let endpoint = supervisor.endpoint.clone();
        tasks.spawn(async move { Worker::new(endpoint).connect().await });
    }

    let mut sessions = Vec::new();
    while let Some(result) = tasks.join_next().await {
        sessions.push(result.expect("task").expect("registers"));
    }

    let mut ids: Vec<u64> = sessions.iter().map(WorkerSession::id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 16, "ids are distinct");
    assert!(ids.iter().all(|id| *id > 0));
    assert_eq!(supervisor.server.keys(), ids);
}

#[tokio::test]
async fn removed_ids_are_never_reassigned() {
    let (monitor, mut events) = RegistrationMonitor::new();
    let supervisor = TestSupervisor::start(vec![monitor as Arc<dyn Monitor>]);

    let first = connect(&Worker::new(supervisor.endpoint.clone())).await;
    let first_id = first.id();
    next_event(&mut events).await;
    first.close().await;
    assert!(matches!(next_event(&mut events).await, Event::Removed { id, .. } if id == first_id));

    let second = connect(&Worker::new(supervisor.endpoint.clone())).await;
    assert!(second.id() > first_id);
    assert_eq!(supervisor.server.keys(), [second.id()]);
}

#[tokio::test]
async fn plain_client_is_never_registered() {
    let (monitor, mut events) = RegistrationMonitor::new();
    let supervisor = TestSupervisor::start(vec![monitor as Arc<dyn Monitor>]);

    let connection = Client::new(supervisor.endpoint.clone())
        .connect()
        .await
        .expect("client connects");
    let keys = connection.supervisor().keys().await.expect("keys");
    assert!(keys.is_empty());
    connection.close().await;

    let worker = connect(&Worker::new(supervisor.endpoint.clone())).await;
    // The first event seen belongs to the worker, not the client.
    assert!(matches!(next_event(&mut events).await, Event::Registered { id, .. } if id == worker.id()));
}
