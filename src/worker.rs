//! Worker side of supervision.
//!
//! A [`Worker`] connects to the supervisor, binds its [`WorkerController`]
//! and registers, receiving an ID. [`Worker::run`] keeps it registered:
//! when the supervisor goes away the worker waits and reconnects, and is
//! assigned a fresh ID each time.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::bus::{Connection, Endpoint};
use crate::client::SupervisorProxy;
use crate::controllers::{WorkerController, SUPERVISOR_NAME, WORKER_NAME};
use crate::diagnostics::Diagnostics;
use crate::Result;

/// Default pause between reconnection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A process that registers itself with a supervisor.
pub struct Worker {
    endpoint: Endpoint,
    diagnostics: Arc<Diagnostics>,
    reconnect_delay: Duration,
    id: watch::Sender<Option<u64>>,
}

impl Worker {
    /// Worker for the current process connecting to `endpoint`.
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_diagnostics(endpoint, Arc::new(Diagnostics::new(std::process::id())))
    }

    /// Worker serving the given diagnostics.
    #[must_use]
    pub fn with_diagnostics(endpoint: Endpoint, diagnostics: Arc<Diagnostics>) -> Self {
        let (id, _) = watch::channel(None);
        Self {
            endpoint,
            diagnostics,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            id,
        }
    }

    /// Change the pause between reconnection attempts.
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Reported process ID.
    #[must_use]
    pub fn process_id(&self) -> u32 {
        self.diagnostics.process_id()
    }

    /// Current ID, while registered.
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        *self.id.borrow()
    }

    /// Watch the ID as the worker registers and reconnects.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<u64>> {
        self.id.subscribe()
    }

    /// Diagnostics exposed to the supervisor.
    #[must_use]
    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    /// Connect and register once.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Ipc`] if the supervisor is unreachable, or
    /// the supervisor's error if registration is refused.
    pub async fn connect(&self) -> Result<WorkerSession> {
        let (connection, driver) = self.endpoint.connect().await?;
        let driver = self.diagnostics.tasks().spawn(driver.run());

        let controller = Arc::new(WorkerController::new(Arc::clone(&self.diagnostics)));
        let reference = connection.bind(WORKER_NAME, controller);
        let supervisor = SupervisorProxy::new(connection.proxy(SUPERVISOR_NAME));

        let mut session = WorkerSession {
            id: 0,
            connection,
            driver: Some(driver),
        };

        let id = supervisor
            .register(&reference, Some(self.process_id()))
            .await?;
        self.id.send_replace(Some(id));
        info!(id, process_id = self.process_id(), "registered with supervisor");

        session.id = id;
        Ok(session)
    }

    /// Stay registered until `cancel` fires, reconnecting whenever the
    /// connection is lost.
    pub async fn run(&self, cancel: CancellationToken) {
        let span = info_span!("worker", process_id = self.process_id());
        async {
            while !cancel.is_cancelled() {
                match self.connect().await {
                    Ok(session) => {
                        tokio::select! {
                            () = cancel.cancelled() => {}
                            () = session.connection.closed() => {
                                info!(id = session.id, "supervisor connection lost");
                            }
                        }
                        self.id.send_replace(None);
                        session.close().await;
                    }
                    Err(err) => debug!(%err, "cannot register with supervisor"),
                }

                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(self.reconnect_delay) => {}
                }
            }
            self.id.send_replace(None);
        }
        .instrument(span)
        .await;
    }

    /// Run [`Worker::run`] on its own task.
    #[must_use]
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

/// Worker for the current process, reaching the supervisor in `root`.
#[must_use]
pub fn supervised_worker(root: &Path) -> Worker {
    Worker::new(Endpoint::in_root(root))
}

/// One registered connection to the supervisor. Dropping it disconnects.
pub struct WorkerSession {
    id: u64,
    connection: Connection,
    driver: Option<JoinHandle<Result<()>>>,
}

impl std::fmt::Debug for WorkerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSession")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

impl WorkerSession {
    /// ID assigned by the supervisor.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The bus connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Disconnect and wait for the connection to shut down.
    pub async fn close(mut self) {
        self.connection.close();
        if let Some(driver) = self.driver.take() {
            match driver.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(%err, "worker connection ended with error"),
                Err(err) => warn!(%err, "worker connection task failed"),
            }
        }
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        self.connection.close();
    }
}
