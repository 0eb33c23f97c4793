//! Process-tree metrics capture.
//!
//! Walks every process descending from a root pid and reports CPU and
//! memory figures for each. Processor utilization is computed by `sysinfo`
//! between two refreshes, so a [`ProcessTree`] should be kept and reused
//! across captures.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::util::lock;

/// Metrics for one process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessMetrics {
    /// Process ID.
    pub process_id: u32,
    /// Parent process ID, when known.
    pub parent_process_id: Option<u32>,
    /// Executable name.
    pub name: String,
    /// CPU usage since the previous capture, in percent of one core.
    pub processor_utilization: f32,
    /// Resident set size in bytes.
    pub resident_size: u64,
    /// Virtual memory size in bytes.
    pub virtual_size: u64,
    /// Seconds since the process started.
    pub elapsed_time: u64,
}

/// Reusable process-table snapshotter.
pub struct ProcessTree {
    system: Mutex<System>,
}

impl Default for ProcessTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTree {
    /// Create an empty snapshotter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Metrics for `root` and all of its descendants, keyed by pid.
    ///
    /// Returns an empty map if `root` does not exist.
    pub fn capture(&self, root: u32) -> BTreeMap<u32, ProcessMetrics> {
        let mut system = lock(&self.system);
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_memory().with_cpu(),
        );

        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent.as_u32()).or_default().push(pid.as_u32());
            }
        }

        let mut metrics = BTreeMap::new();
        let mut queue = vec![root];

        while let Some(current) = queue.pop() {
            if metrics.contains_key(&current) {
                continue;
            }
            let Some(process) = system.process(Pid::from_u32(current)) else {
                continue;
            };

            metrics.insert(
                current,
                ProcessMetrics {
                    process_id: current,
                    parent_process_id: process.parent().map(Pid::as_u32),
                    name: process.name().to_string_lossy().into_owned(),
                    processor_utilization: process.cpu_usage(),
                    resident_size: process.memory(),
                    virtual_size: process.virtual_memory(),
                    elapsed_time: process.run_time(),
                },
            );

            if let Some(descendants) = children.get(&current) {
                queue.extend(descendants);
            }
        }

        metrics
    }
}
