//! Supervisor lifecycle: bind, serve, release.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bus::{BoundEndpoint, Endpoint};
use crate::config::SupervisorConfig;
use crate::server::Server;
use crate::{AppError, Result};

/// A supervisor bound to its control socket.
pub struct Service {
    config: SupervisorConfig,
    server: Arc<Server>,
    bound: Option<BoundEndpoint>,
}

impl Service {
    /// Bind the control socket and build the configured monitors.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Ipc`] if the socket cannot be bound.
    pub fn start(config: SupervisorConfig) -> Result<Self> {
        let bound = config.endpoint().bind()?;
        let server = Server::new(config.monitors());

        info!(
            path = %bound.path().display(),
            monitors = server.monitors().len(),
            "supervisor started"
        );

        Ok(Self {
            config,
            server,
            bound: Some(bound),
        })
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// The worker registry.
    #[must_use]
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Endpoint workers and clients connect to.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.config.endpoint()
    }

    /// Process title reflecting the worker count.
    #[must_use]
    pub fn title(&self) -> String {
        self.server.title()
    }

    /// Serve until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Ipc`] if the service has been stopped.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let bound = self
            .bound
            .as_ref()
            .ok_or_else(|| AppError::Ipc("supervisor socket already released".into()))?;
        Arc::clone(&self.server).run(bound, cancel).await
    }

    /// Release the control socket.
    pub fn stop(&mut self) {
        if let Some(bound) = self.bound.take() {
            info!(path = %bound.path().display(), "supervisor stopped");
            bound.close();
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
    }
}
