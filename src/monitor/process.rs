//! Periodic metrics for the supervised process tree.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::Monitor;
use crate::controllers::SupervisorController;
use crate::interval_loop;
use crate::metrics::{ProcessMetrics, ProcessTree};
use crate::signals;
use crate::Result;

/// Default time between metric captures.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Monitor that logs CPU and memory figures for every process under `ppid`.
pub struct ProcessMonitor {
    interval: Duration,
    ppid: u32,
    tree: ProcessTree,
}

impl ProcessMonitor {
    /// Monitor the tree rooted at `ppid`, defaulting to this process's parent.
    #[must_use]
    pub fn new(interval: Duration, ppid: Option<u32>) -> Self {
        Self {
            interval,
            ppid: ppid.unwrap_or_else(signals::parent_process_id),
            tree: ProcessTree::new(),
        }
    }

    /// Root of the monitored tree.
    #[must_use]
    pub fn ppid(&self) -> u32 {
        self.ppid
    }

    /// Capture the current metrics of the tree.
    #[must_use]
    pub fn metrics(&self) -> BTreeMap<u32, ProcessMetrics> {
        self.tree.capture(self.ppid)
    }

    fn log_metrics(&self) {
        for metrics in self.metrics().values() {
            info!(
                process_id = metrics.process_id,
                parent_process_id = metrics.parent_process_id,
                name = %metrics.name,
                processor_utilization = metrics.processor_utilization,
                resident_size = metrics.resident_size,
                virtual_size = metrics.virtual_size,
                elapsed_time = metrics.elapsed_time,
                "process metrics"
            );
        }
    }
}

impl Monitor for ProcessMonitor {
    fn name(&self) -> &str {
        "process_monitor"
    }

    fn register(&self, controller: &Arc<SupervisorController>) -> Result<()> {
        debug!(id = controller.id(), process_id = controller.process_id(), "worker registered");
        Ok(())
    }

    fn remove(&self, controller: &Arc<SupervisorController>) -> Result<()> {
        debug!(id = controller.id(), process_id = controller.process_id(), "worker removed");
        Ok(())
    }

    fn status(&self) -> Result<Value> {
        Ok(json!({
            "process_monitor": {
                "ppid": self.ppid,
                "metrics": self.metrics(),
            }
        }))
    }

    fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<Option<JoinHandle<()>>> {
        let interval = self.interval;
        let handle = interval_loop::spawn("process_monitor", interval, cancel, move || {
            let monitor = Arc::clone(&self);
            async move {
                monitor.log_metrics();
                Ok(())
            }
        });
        Ok(Some(handle))
    }
}
