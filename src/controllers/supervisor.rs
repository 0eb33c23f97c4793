//! The supervisor-side object bound on every inbound connection.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use serde_json::{json, Value};
use tracing::{info, info_span, warn, Instrument};

use crate::bus::{Call, Connection, ConnectionId, Controller, Invocation, Reply};
use crate::client::WorkerProxy;
use crate::server::Server;
use crate::signals;
use crate::util::lock;
use crate::{AppError, Result};

/// Signal sent by `restart` when none is named.
pub const DEFAULT_RESTART_SIGNAL: &str = "INT";

struct Registration {
    id: u64,
    process_id: Option<u32>,
    worker: WorkerProxy,
}

/// Per-connection supervisor object.
///
/// A connection becomes a worker by calling `register` exactly once; until
/// then it can still use `at`, `keys`, `restart` and `status` as a plain
/// client.
pub struct SupervisorController {
    this: Weak<Self>,
    server: Arc<Server>,
    connection: Connection,
    registration: OnceLock<Registration>,
    detached: Mutex<bool>,
}

impl SupervisorController {
    /// Controller for `connection`, served by `server`.
    #[must_use]
    pub fn new(server: Arc<Server>, connection: Connection) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            server,
            connection,
            registration: OnceLock::new(),
            detached: Mutex::new(false),
        })
    }

    /// Assigned ID, once registered.
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        self.registration.get().map(|registration| registration.id)
    }

    /// Process ID reported at registration.
    #[must_use]
    pub fn process_id(&self) -> Option<u32> {
        self.registration
            .get()
            .and_then(|registration| registration.process_id)
    }

    /// Proxy to the worker object registered on this connection.
    #[must_use]
    pub fn worker(&self) -> Option<WorkerProxy> {
        self.registration
            .get()
            .map(|registration| registration.worker.clone())
    }

    /// The connection this controller serves.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Identity of the connection this controller serves.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Register this connection as a worker and return its new ID.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if the connection has already
    /// registered or has closed.
    pub fn register(&self, worker: WorkerProxy, process_id: Option<u32>) -> Result<u64> {
        let detached = lock(&self.detached);
        if *detached {
            return Err(AppError::Protocol("connection is closed".into()));
        }
        if self.registration.get().is_some() {
            return Err(AppError::Protocol("Already registered".into()));
        }

        let this = self
            .this
            .upgrade()
            .ok_or_else(|| AppError::Protocol("controller is shutting down".into()))?;

        let id = self.server.next_id();
        self.registration
            .set(Registration {
                id,
                process_id,
                worker,
            })
            .map_err(|_| AppError::Protocol("Already registered".into()))?;

        self.server.add(&this)?;
        drop(detached);

        info!(id, process_id, connection = self.connection_id(), "worker registered");
        Ok(id)
    }

    /// Worker registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] if no connection has that ID or it has
    /// no worker.
    pub fn at(&self, id: u64) -> Result<WorkerProxy> {
        let controller = self
            .server
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("Connection not found: {id}")))?;

        controller.worker().ok_or_else(|| {
            AppError::NotFound(format!("Worker controller not found for connection: {id}"))
        })
    }

    /// IDs of all registered workers.
    #[must_use]
    pub fn keys(&self) -> Vec<u64> {
        self.server.keys()
    }

    /// Send `signal` (default `INT`) to the supervisor's parent process.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidArgument`] for an unknown signal name or
    /// [`AppError::Signal`] if delivery fails.
    pub fn restart(&self, signal: Option<&str>) -> Result<Value> {
        let signal = signals::parse(signal.unwrap_or(DEFAULT_RESTART_SIGNAL))?;
        let process_id = signals::parent_process_id();

        info!(process_id, %signal, "restart requested");
        signals::send(process_id, signal)?;

        Ok(json!({ "process_id": process_id, "signal": signal.as_str() }))
    }

    /// One entry per monitor that has something to report. A failing monitor
    /// yields `{"monitor": name, "error": message}` instead.
    #[must_use]
    pub fn status(&self) -> Vec<Value> {
        self.server
            .monitors()
            .iter()
            .filter_map(|monitor| match monitor.status() {
                Ok(Value::Null) => None,
                Ok(status) => Some(status),
                Err(err) => {
                    warn!(monitor = monitor.name(), %err, "monitor status failed");
                    Some(json!({ "monitor": monitor.name(), "error": err.to_string() }))
                }
            })
            .collect()
    }

    /// Refuse further registration. Waits for a registration in progress.
    pub(crate) fn detach(&self) {
        *lock(&self.detached) = true;
    }
}

impl Controller for SupervisorController {
    fn handle(&self, call: Call) -> Invocation<'_> {
        let span = info_span!(
            "supervisor_call",
            method = %call.method,
            connection = self.connection_id()
        );

        Box::pin(
            async move {
                match call.method.as_str() {
                    "register" => {
                        let worker = WorkerProxy::new(call.reference("worker")?);
                        let process_id: Option<u32> = call.optional_arg("process_id")?;
                        Reply::json(&self.register(worker, process_id)?)
                    }
                    "at" => {
                        let id: u64 = call.arg("id")?;
                        let worker = self.at(id)?;
                        Ok(Reply::Named(
                            format!("worker-{id}"),
                            Arc::new(worker.proxy().clone()),
                        ))
                    }
                    "keys" => Reply::json(&self.keys()),
                    "restart" => {
                        let signal: Option<String> = call.optional_arg("signal")?;
                        Ok(Reply::Value(self.restart(signal.as_deref())?))
                    }
                    "status" => Reply::json(&self.status()),
                    _ => Err(call.unknown_method("supervisor")),
                }
            }
            .instrument(span),
        )
    }
}
