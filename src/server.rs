//! Supervisor server: accepts connections and keeps the worker registry.
//!
//! Every accepted connection gets its own [`SupervisorController`], bound as
//! `supervisor`. Controllers enter the registry when they register and leave
//! it when their connection ends; the server fans both events out to every
//! [`Monitor`], shielding each monitor from the others' failures.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::bus::{BoundEndpoint, Connection, ConnectionDriver};
use crate::controllers::{SupervisorController, SUPERVISOR_NAME};
use crate::monitor::Monitor;
use crate::util::lock;
use crate::{AppError, Result};

/// Registry of connected workers plus the monitors observing them.
pub struct Server {
    monitors: Vec<Arc<dyn Monitor>>,
    controllers: Mutex<BTreeMap<u64, Arc<SupervisorController>>>,
    next_id: AtomicU64,
}

impl Server {
    /// Server notifying `monitors`.
    #[must_use]
    pub fn new(monitors: Vec<Arc<dyn Monitor>>) -> Arc<Self> {
        Arc::new(Self {
            monitors,
            controllers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Configured monitors.
    #[must_use]
    pub fn monitors(&self) -> &[Arc<dyn Monitor>] {
        &self.monitors
    }

    /// Allocate the next worker ID. IDs start at 1 and are never reused.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert a registered controller and notify every monitor.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if the controller has no ID or its ID is
    /// already taken.
    pub fn add(&self, controller: &Arc<SupervisorController>) -> Result<()> {
        let id = controller
            .id()
            .ok_or_else(|| AppError::Protocol("Controller ID not set".into()))?;

        {
            let mut controllers = lock(&self.controllers);
            if controllers.contains_key(&id) {
                return Err(AppError::Protocol(format!("Controller already registered: {id}")));
            }
            controllers.insert(id, Arc::clone(controller));
        }

        for monitor in &self.monitors {
            if let Err(err) = monitor.register(controller) {
                error!(monitor = monitor.name(), id, %err, "Error while registering process");
            }
        }

        Ok(())
    }

    /// Drop a controller from the registry and notify every monitor.
    ///
    /// Does nothing for a controller that never registered or was already
    /// removed.
    pub fn remove(&self, controller: &Arc<SupervisorController>) {
        let Some(id) = controller.id() else {
            return;
        };

        let removed = {
            let mut controllers = lock(&self.controllers);
            match controllers.get(&id) {
                Some(existing) if Arc::ptr_eq(existing, controller) => controllers.remove(&id),
                _ => None,
            }
        };
        if removed.is_none() {
            return;
        }

        for monitor in &self.monitors {
            if let Err(err) = monitor.remove(controller) {
                error!(monitor = monitor.name(), id, %err, "Error while removing process");
            }
        }
        info!(id, "worker removed");
    }

    /// Registered controller with `id`.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<Arc<SupervisorController>> {
        lock(&self.controllers).get(&id).cloned()
    }

    /// IDs of all registered controllers in ascending order.
    #[must_use]
    pub fn keys(&self) -> Vec<u64> {
        lock(&self.controllers).keys().copied().collect()
    }

    /// Number of registered workers.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.controllers).len()
    }

    /// Whether no worker is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Process title reflecting the worker count.
    #[must_use]
    pub fn title(&self) -> String {
        format!("supervisor ({} workers)", self.len())
    }

    /// Start every monitor, then accept connections on `endpoint` until
    /// `cancel` fires. Stopping (or dropping) this future stops everything it
    /// started.
    ///
    /// # Errors
    ///
    /// Currently infallible; failures of individual connections and monitors
    /// are logged.
    pub async fn run(self: Arc<Self>, endpoint: &BoundEndpoint, cancel: CancellationToken) -> Result<()> {
        let scope = cancel.child_token();
        let _stop_on_exit = scope.clone().drop_guard();

        let mut monitor_tasks = Vec::new();
        for monitor in &self.monitors {
            match Arc::clone(monitor).run(scope.child_token()) {
                Ok(Some(task)) => monitor_tasks.push(task),
                Ok(None) => {}
                Err(err) => error!(monitor = monitor.name(), %err, "monitor failed to start"),
            }
        }

        info!(path = %endpoint.path().display(), "supervisor listening");

        let tracker = TaskTracker::new();
        let span = info_span!("supervisor_server", path = %endpoint.path().display());
        async {
            loop {
                tokio::select! {
                    () = scope.cancelled() => {
                        info!("supervisor server shutting down");
                        break;
                    }
                    accepted = endpoint.accept() => match accepted {
                        Ok((connection, driver)) => {
                            tracker.spawn(handle_connection(
                                Arc::clone(&self),
                                connection,
                                driver,
                                scope.clone(),
                            ));
                        }
                        Err(err) => warn!(%err, "accept failed"),
                    }
                }
            }
        }
        .instrument(span)
        .await;

        tracker.close();
        tracker.wait().await;

        for task in monitor_tasks {
            if let Err(err) = task.await {
                warn!(%err, "monitor task failed");
            }
        }

        Ok(())
    }
}

/// Removes a controller from the registry when its connection task ends,
/// however it ends.
struct Removal {
    server: Arc<Server>,
    controller: Arc<SupervisorController>,
}

impl Drop for Removal {
    fn drop(&mut self) {
        self.controller.detach();
        self.server.remove(&self.controller);
    }
}

async fn handle_connection(
    server: Arc<Server>,
    connection: Connection,
    driver: ConnectionDriver,
    cancel: CancellationToken,
) {
    let controller = SupervisorController::new(Arc::clone(&server), connection.clone());
    connection.bind(SUPERVISOR_NAME, Arc::clone(&controller) as _);
    let _removal = Removal { server, controller };

    let span = info_span!("supervisor_connection", connection = connection.id());
    async move {
        debug!("connection accepted");
        let run = driver.run();
        tokio::pin!(run);

        let result = tokio::select! {
            () = cancel.cancelled() => None,
            result = &mut run => Some(result),
        };
        let result = match result {
            Some(result) => result,
            None => {
                connection.close();
                run.await
            }
        };

        if let Err(err) = result {
            warn!(%err, "connection failed");
        }
        debug!("connection closed");
    }
    .instrument(span)
    .await;
}
