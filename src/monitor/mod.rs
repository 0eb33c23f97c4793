//! Pluggable observers notified as workers come and go.
//!
//! The server calls [`Monitor::register`] after a controller has been
//! assigned an ID and [`Monitor::remove`] once its connection ends. Monitors
//! may also run their own periodic task via [`Monitor::run`]. Every monitor
//! is isolated: an error from one never reaches the others or the server.

pub mod memory;
pub mod process;

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::controllers::SupervisorController;
use crate::Result;

pub use memory::{MemoryMonitor, MemorySampleOptions};
pub use process::ProcessMonitor;

/// Observer of the supervised worker population.
pub trait Monitor: Send + Sync {
    /// Short name used in logs and status entries.
    fn name(&self) -> &str;

    /// A worker has registered.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the server logs and ignores the error.
    fn register(&self, controller: &Arc<SupervisorController>) -> Result<()>;

    /// A worker's connection has ended.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the server logs and ignores the error.
    fn remove(&self, controller: &Arc<SupervisorController>) -> Result<()>;

    /// Status snapshot, or `Value::Null` for nothing to report.
    ///
    /// # Errors
    ///
    /// A failure is reported in place of this monitor's status entry.
    fn status(&self) -> Result<Value>;

    /// Start the monitor's background work, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the monitor cannot start.
    fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<Option<JoinHandle<()>>>;
}
