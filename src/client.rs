//! Client-side access to a running supervisor.
//!
//! [`Client::connect`] opens a bus connection and returns a
//! [`ClientConnection`], from which the supervisor object is reached as a
//! typed [`SupervisorProxy`]. Workers obtained through
//! [`SupervisorProxy::at`] are [`WorkerProxy`] handles whose calls travel
//! through the supervisor to the worker's own connection.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bus::{Connection, Endpoint, Proxy, Reference};
use crate::controllers::SUPERVISOR_NAME;
use crate::diagnostics::{DumpOutput, DumpRequest};
use crate::Result;

/// Connects to the supervisor listening on an endpoint.
#[derive(Debug, Clone)]
pub struct Client {
    endpoint: Endpoint,
}

impl Client {
    /// Client for `endpoint`.
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Client for the default socket inside `root`.
    #[must_use]
    pub fn in_root(root: &Path) -> Self {
        Self::new(Endpoint::in_root(root))
    }

    /// Endpoint this client connects to.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Open a connection.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Ipc`] if the supervisor is not reachable.
    pub async fn connect(&self) -> Result<ClientConnection> {
        let (connection, driver) = self.endpoint.connect().await?;
        let driver = tokio::spawn(driver.run());
        Ok(ClientConnection {
            connection,
            driver: Some(driver),
        })
    }
}

/// An open client connection. Dropping it closes the connection.
pub struct ClientConnection {
    connection: Connection,
    driver: Option<JoinHandle<Result<()>>>,
}

impl ClientConnection {
    /// The supervisor object.
    #[must_use]
    pub fn supervisor(&self) -> SupervisorProxy {
        SupervisorProxy::new(self.connection.proxy(SUPERVISOR_NAME))
    }

    /// Underlying bus connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Close the connection and wait for its driver to stop.
    pub async fn close(mut self) {
        self.connection.close();
        if let Some(driver) = self.driver.take() {
            match driver.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(%err, "client connection ended with error"),
                Err(err) => debug!(%err, "client driver task failed"),
            }
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.connection.close();
    }
}

/// Typed handle to the supervisor object.
#[derive(Debug, Clone)]
pub struct SupervisorProxy {
    proxy: Proxy,
}

impl SupervisorProxy {
    /// Wrap a raw proxy.
    #[must_use]
    pub fn new(proxy: Proxy) -> Self {
        Self { proxy }
    }

    /// Raw proxy.
    #[must_use]
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Register `worker` (bound on this connection) and return the assigned ID.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Protocol`] if this connection already registered.
    pub async fn register(&self, worker: &Reference, process_id: Option<u32>) -> Result<u64> {
        self.proxy
            .call(
                "register",
                json!({ "worker": worker.to_value(), "process_id": process_id }),
            )
            .await
    }

    /// Worker registered under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::NotFound`] if no such worker is connected.
    pub async fn at(&self, id: u64) -> Result<WorkerProxy> {
        let proxy = self.proxy.call_object("at", json!({ "id": id })).await?;
        Ok(WorkerProxy::new(proxy))
    }

    /// IDs of all registered workers.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the call fails.
    pub async fn keys(&self) -> Result<Vec<u64>> {
        self.proxy.call("keys", Value::Null).await
    }

    /// Signal the supervisor's parent; `None` sends `INT`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Signal`] if delivery fails.
    pub async fn restart(&self, signal: Option<&str>) -> Result<Value> {
        self.proxy.invoke("restart", json!({ "signal": signal })).await
    }

    /// One status entry per monitor that reported something.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the call fails.
    pub async fn status(&self) -> Result<Vec<Value>> {
        self.proxy.call("status", Value::Null).await
    }
}

/// Typed handle to a worker's diagnostics.
#[derive(Debug, Clone)]
pub struct WorkerProxy {
    proxy: Proxy,
}

impl WorkerProxy {
    /// Wrap a raw proxy.
    #[must_use]
    pub fn new(proxy: Proxy) -> Self {
        Self { proxy }
    }

    /// Raw proxy.
    #[must_use]
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Sample memory usage for `duration_seconds` and dump the report to
    /// `request`'s destination.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::InvalidArgument`] for a non-positive duration.
    pub async fn memory_sample(
        &self,
        duration_seconds: f64,
        request: &DumpRequest,
    ) -> Result<DumpOutput> {
        let mut args = request.to_args()?;
        if let Value::Object(fields) = &mut args {
            fields.insert("duration".into(), json!(duration_seconds));
        }
        self.proxy.call("memory_sample", args).await
    }

    /// Write a memory map dump to `path` on the worker's host.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Io`] if the file cannot be written.
    pub async fn memory_dump(&self, path: impl Into<PathBuf>) -> Result<DumpOutput> {
        self.proxy
            .call("memory_dump", json!({ "path": path.into() }))
            .await
    }

    /// Dump the worker's threads.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Io`] if a requested file cannot be written.
    pub async fn thread_dump(&self, request: &DumpRequest) -> Result<DumpOutput> {
        self.proxy.call("thread_dump", request.to_args()?).await
    }

    /// Dump the worker's async runtime state.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Io`] if a requested file cannot be written.
    pub async fn scheduler_dump(&self, request: &DumpRequest) -> Result<DumpOutput> {
        self.proxy.call("scheduler_dump", request.to_args()?).await
    }

    /// Start memory profiling. Starting twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the call fails.
    pub async fn garbage_profile_start(&self) -> Result<Value> {
        self.proxy.invoke("garbage_profile_start", Value::Null).await
    }

    /// Stop memory profiling and return the report.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AppError::Io`] if a requested file cannot be written.
    pub async fn garbage_profile_stop(&self, request: &DumpRequest) -> Result<DumpOutput> {
        self.proxy.call("garbage_profile_stop", request.to_args()?).await
    }
}
