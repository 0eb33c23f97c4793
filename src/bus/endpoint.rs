//! Unix-domain-socket endpoints.
//!
//! Uses the `interprocess` crate with filesystem socket names so the socket
//! lives next to the service it belongs to (default `<root>/supervisor.ipc`).

use std::path::{Path, PathBuf};

use interprocess::local_socket::{tokio::prelude::*, GenericFilePath, ListenerOptions, ToFsName};
use tracing::{debug, info};

use super::{Connection, ConnectionDriver};
use crate::{AppError, Result};

/// File name of the supervisor socket inside the service root.
pub const DEFAULT_IPC_NAME: &str = "supervisor.ipc";

/// Address of a supervisor socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    path: PathBuf,
}

impl Endpoint {
    /// Endpoint at an explicit socket path.
    #[must_use]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Endpoint at [`DEFAULT_IPC_NAME`] inside `root`.
    #[must_use]
    pub fn in_root(root: &Path) -> Self {
        Self::unix(root.join(DEFAULT_IPC_NAME))
    }

    /// Socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start listening, replacing a stale socket file left by a previous run.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Ipc`] if the listener cannot be created.
    pub fn bind(&self) -> Result<BoundEndpoint> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed stale socket"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(AppError::Ipc(format!(
                    "cannot replace socket '{}': {err}",
                    self.path.display()
                )))
            }
        }

        let name = self
            .path
            .as_path()
            .to_fs_name::<GenericFilePath>()
            .map_err(|err| AppError::Ipc(format!("invalid socket path '{}': {err}", self.path.display())))?;

        let listener = ListenerOptions::new()
            .name(name)
            .create_tokio()
            .map_err(|err| AppError::Ipc(format!("failed to create listener: {err}")))?;

        info!(path = %self.path.display(), "endpoint bound");

        Ok(BoundEndpoint {
            path: self.path.clone(),
            listener,
        })
    }

    /// Connect to the listening side.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Ipc`] if the socket does not exist or refuses the
    /// connection.
    pub async fn connect(&self) -> Result<(Connection, ConnectionDriver)> {
        let name = self
            .path
            .as_path()
            .to_fs_name::<GenericFilePath>()
            .map_err(|err| AppError::Ipc(format!("invalid socket path '{}': {err}", self.path.display())))?;

        let stream = interprocess::local_socket::tokio::Stream::connect(name)
            .await
            .map_err(|err| {
                AppError::Ipc(format!("cannot connect to '{}': {err}", self.path.display()))
            })?;

        Ok(Connection::new(stream))
    }
}

/// A listening endpoint. Dropping it closes the listener and removes the
/// socket file.
pub struct BoundEndpoint {
    path: PathBuf,
    listener: interprocess::local_socket::tokio::Listener,
}

impl BoundEndpoint {
    /// Socket path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Endpoint clients use to reach this listener.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::unix(self.path.clone())
    }

    /// Wait for the next inbound connection.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Ipc`] if accepting fails.
    pub async fn accept(&self) -> Result<(Connection, ConnectionDriver)> {
        let stream = self
            .listener
            .accept()
            .await
            .map_err(|err| AppError::Ipc(format!("accept failed: {err}")))?;
        Ok(Connection::new(stream))
    }

    /// Release the socket.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for BoundEndpoint {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "socket released"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => debug!(path = %self.path.display(), %err, "socket cleanup failed"),
        }
    }
}
