//! Leak detection for supervised worker processes.
//!
//! Several connections may come from the same process (a worker that
//! reconnects, or a process hosting more than one worker), so the monitor
//! tracks each process once and keeps the set of controllers reaching it.
//! The process enters the leak cluster with its first controller and leaves
//! with its last.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Monitor;
use crate::bus::ConnectionId;
use crate::controllers::SupervisorController;
use crate::diagnostics::DumpRequest;
use crate::interval_loop;
use crate::leak::{LeakCluster, LeakOptions, MemoryProbe};
use crate::signals;
use crate::util::lock;
use crate::Result;

/// Default time between leak checks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Capture a memory sample from a leaking worker before it is interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct MemorySampleOptions {
    /// Sampling window in seconds.
    pub duration_seconds: f64,
}

#[derive(Default)]
struct Tracking {
    processes: HashMap<u32, HashMap<ConnectionId, Arc<SupervisorController>>>,
}

/// Monitor that interrupts workers whose memory keeps growing.
pub struct MemoryMonitor {
    interval: Duration,
    options: LeakOptions,
    memory_sample: Option<MemorySampleOptions>,
    cluster: Mutex<LeakCluster>,
    tracking: Mutex<Tracking>,
}

impl MemoryMonitor {
    /// Monitor checking every `interval` against an optional cluster-wide
    /// `total_size_limit` in bytes.
    #[must_use]
    pub fn new(interval: Duration, total_size_limit: Option<u64>) -> Self {
        Self::with_cluster(interval, LeakCluster::new(total_size_limit))
    }

    /// Monitor that samples process sizes through `probe`.
    #[must_use]
    pub fn with_probe(
        interval: Duration,
        total_size_limit: Option<u64>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self::with_cluster(interval, LeakCluster::with_probe(total_size_limit, probe))
    }

    fn with_cluster(interval: Duration, cluster: LeakCluster) -> Self {
        Self {
            interval,
            options: LeakOptions::default(),
            memory_sample: None,
            cluster: Mutex::new(cluster),
            tracking: Mutex::new(Tracking::default()),
        }
    }

    /// Thresholds applied to every newly tracked process.
    #[must_use]
    pub fn with_leak_options(mut self, options: LeakOptions) -> Self {
        self.options = options;
        self
    }

    /// Ask leaking workers for a memory sample before interrupting them.
    #[must_use]
    pub fn with_memory_sample(mut self, memory_sample: MemorySampleOptions) -> Self {
        self.memory_sample = Some(memory_sample);
        self
    }

    /// Time between checks.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Process IDs currently in the leak cluster.
    #[must_use]
    pub fn process_ids(&self) -> Vec<u32> {
        lock(&self.cluster).process_ids()
    }

    /// Number of controllers associated with `process_id`.
    #[must_use]
    pub fn controller_count(&self, process_id: u32) -> usize {
        lock(&self.tracking)
            .processes
            .get(&process_id)
            .map_or(0, HashMap::len)
    }

    /// Sample all tracked processes once and handle any leaks found.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature matches the periodic loop.
    pub async fn check(&self) -> Result<()> {
        let leaking = lock(&self.cluster).check();

        for leak in leaking {
            error!(
                process_id = leak.process_id,
                current_size = leak.current_size,
                maximum_observed_size = leak.maximum_observed_size,
                increase_count = leak.increase_count,
                "memory leak detected"
            );
            self.memory_leak_detected(leak.process_id).await;
            lock(&self.cluster).acknowledge(leak.process_id);
        }

        Ok(())
    }

    /// Handle a leaking process: optionally sample it, then interrupt it.
    pub async fn memory_leak_detected(&self, process_id: u32) {
        if let Some(sample) = self.memory_sample {
            let controllers: Vec<Arc<SupervisorController>> = lock(&self.tracking)
                .processes
                .get(&process_id)
                .map(|controllers| controllers.values().cloned().collect())
                .unwrap_or_default();

            for controller in controllers {
                let Some(worker) = controller.worker() else {
                    continue;
                };
                match worker
                    .memory_sample(sample.duration_seconds, &DumpRequest::default())
                    .await
                {
                    Ok(output) => info!(
                        process_id,
                        id = controller.id(),
                        data = output.data.as_deref().unwrap_or_default(),
                        "memory sample captured"
                    ),
                    Err(err) => warn!(process_id, id = controller.id(), %err, "memory sample failed"),
                }
            }
        }

        info!(process_id, "interrupting leaking process");
        if let Err(err) = signals::send_tolerant(process_id, Signal::SIGINT) {
            warn!(process_id, %err, "failed to interrupt leaking process");
        }
    }
}

impl Monitor for MemoryMonitor {
    fn name(&self) -> &str {
        "memory_monitor"
    }

    fn register(&self, controller: &Arc<SupervisorController>) -> Result<()> {
        let Some(process_id) = controller.process_id() else {
            return Ok(());
        };
        debug!(process_id, id = controller.id(), "tracking worker memory");

        let mut tracking = lock(&self.tracking);
        let controllers = tracking.processes.entry(process_id).or_default();
        if controllers.is_empty() {
            lock(&self.cluster).add(process_id, self.options);
        }
        controllers.insert(controller.connection_id(), Arc::clone(controller));
        Ok(())
    }

    fn remove(&self, controller: &Arc<SupervisorController>) -> Result<()> {
        let Some(process_id) = controller.process_id() else {
            return Ok(());
        };

        let mut tracking = lock(&self.tracking);
        let Some(controllers) = tracking.processes.get_mut(&process_id) else {
            return Ok(());
        };
        controllers.remove(&controller.connection_id());

        if controllers.is_empty() {
            tracking.processes.remove(&process_id);
            lock(&self.cluster).remove(process_id);
            debug!(process_id, "stopped tracking worker memory");
        }
        Ok(())
    }

    fn status(&self) -> Result<Value> {
        Ok(json!({ "memory_monitor": lock(&self.cluster).as_json() }))
    }

    fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<Option<JoinHandle<()>>> {
        let interval = self.interval;
        let handle = interval_loop::spawn("memory_monitor", interval, cancel, move || {
            let monitor = Arc::clone(&self);
            async move { monitor.check().await }
        });
        Ok(Some(handle))
    }
}
