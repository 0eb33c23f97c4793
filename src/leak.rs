//! Memory-leak detection across a set of processes.
//!
//! Each tracked process gets a [`LeakMonitor`] that follows its resident
//! size. A process counts as leaking once its observed maximum has grown
//! `increase_limit` times, or once it exceeds `maximum_size_limit`. The
//! [`LeakCluster`] additionally flags the largest processes while the sum of
//! all sizes is above `total_size_limit`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::util::lock;

/// Default number of maximum-size increases tolerated before a process is
/// considered leaking.
pub const DEFAULT_INCREASE_LIMIT: u32 = 20;

/// Source of per-process resident sizes.
pub trait MemoryProbe: Send + Sync {
    /// Resident size of `process_id` in bytes, or `None` if it is gone.
    fn resident_size(&self, process_id: u32) -> Option<u64>;

    /// Drop any cached process state.
    fn release(&self) {}
}

/// [`MemoryProbe`] backed by the OS process table.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl MemoryProbe for SystemProbe {
    fn resident_size(&self, process_id: u32) -> Option<u64> {
        let pid = Pid::from_u32(process_id);
        let mut system = lock(&self.system);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        system.process(pid).map(sysinfo::Process::memory)
    }

    fn release(&self) {
        *lock(&self.system) = System::new();
    }
}

/// Per-process thresholds applied when a process is added to a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakOptions {
    /// Number of maximum-size increases before the process is leaking.
    #[serde(default = "default_increase_limit")]
    pub increase_limit: u32,
    /// Hard resident-size limit in bytes.
    #[serde(default)]
    pub maximum_size_limit: Option<u64>,
}

fn default_increase_limit() -> u32 {
    DEFAULT_INCREASE_LIMIT
}

impl Default for LeakOptions {
    fn default() -> Self {
        Self {
            increase_limit: DEFAULT_INCREASE_LIMIT,
            maximum_size_limit: None,
        }
    }
}

/// Size history for one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakMonitor {
    /// Tracked process.
    pub process_id: u32,
    /// Most recent resident size.
    pub current_size: Option<u64>,
    /// Largest resident size seen since the last reset.
    pub maximum_observed_size: Option<u64>,
    /// How many times `maximum_observed_size` has grown.
    pub increase_count: u32,
    /// Thresholds in effect.
    #[serde(flatten)]
    pub options: LeakOptions,
}

impl LeakMonitor {
    fn new(process_id: u32, options: LeakOptions) -> Self {
        Self {
            process_id,
            current_size: None,
            maximum_observed_size: None,
            increase_count: 0,
            options,
        }
    }

    /// Record a new resident size.
    pub fn record(&mut self, size: u64) {
        self.current_size = Some(size);
        match self.maximum_observed_size {
            None => self.maximum_observed_size = Some(size),
            Some(maximum) if size > maximum => {
                self.maximum_observed_size = Some(size);
                self.increase_count += 1;
            }
            Some(_) => {}
        }
    }

    /// Whether this process has crossed one of its own thresholds.
    #[must_use]
    pub fn is_leaking(&self) -> bool {
        if self.increase_count >= self.options.increase_limit {
            return true;
        }
        matches!(
            (self.current_size, self.options.maximum_size_limit),
            (Some(size), Some(limit)) if size > limit
        )
    }

    fn reset(&mut self) {
        self.increase_count = 0;
        self.maximum_observed_size = self.current_size;
    }
}

/// A set of processes checked together.
pub struct LeakCluster {
    total_size_limit: Option<u64>,
    processes: BTreeMap<u32, LeakMonitor>,
    probe: Arc<dyn MemoryProbe>,
}

impl LeakCluster {
    /// Cluster sampling through the OS process table.
    #[must_use]
    pub fn new(total_size_limit: Option<u64>) -> Self {
        Self::with_probe(total_size_limit, Arc::new(SystemProbe::default()))
    }

    /// Cluster sampling through `probe`.
    #[must_use]
    pub fn with_probe(total_size_limit: Option<u64>, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            total_size_limit,
            processes: BTreeMap::new(),
            probe,
        }
    }

    /// Start tracking `process_id`. Re-adding keeps the existing history.
    pub fn add(&mut self, process_id: u32, options: LeakOptions) -> &LeakMonitor {
        self.processes
            .entry(process_id)
            .or_insert_with(|| LeakMonitor::new(process_id, options))
    }

    /// Stop tracking `process_id`.
    pub fn remove(&mut self, process_id: u32) -> Option<LeakMonitor> {
        self.processes.remove(&process_id)
    }

    /// Whether `process_id` is tracked.
    #[must_use]
    pub fn contains(&self, process_id: u32) -> bool {
        self.processes.contains_key(&process_id)
    }

    /// Tracked process IDs in ascending order.
    #[must_use]
    pub fn process_ids(&self) -> Vec<u32> {
        self.processes.keys().copied().collect()
    }

    /// Monitor for `process_id`.
    #[must_use]
    pub fn get(&self, process_id: u32) -> Option<&LeakMonitor> {
        self.processes.get(&process_id)
    }

    /// Sample every process and return snapshots of those that are leaking.
    pub fn check(&mut self) -> Vec<LeakMonitor> {
        for monitor in self.processes.values_mut() {
            if let Some(size) = self.probe.resident_size(monitor.process_id) {
                monitor.record(size);
            }
        }

        let mut leaking: Vec<LeakMonitor> = self
            .processes
            .values()
            .filter(|monitor| monitor.is_leaking())
            .cloned()
            .collect();

        if let Some(limit) = self.total_size_limit {
            let mut total: u64 = self
                .processes
                .values()
                .filter_map(|monitor| monitor.current_size)
                .sum();

            let mut by_size: Vec<&LeakMonitor> = self.processes.values().collect();
            by_size.sort_by(|a, b| b.current_size.cmp(&a.current_size));

            for monitor in by_size {
                if total <= limit {
                    break;
                }
                total = total.saturating_sub(monitor.current_size.unwrap_or(0));
                if !leaking.iter().any(|m| m.process_id == monitor.process_id) {
                    leaking.push(monitor.clone());
                }
            }
        }

        leaking
    }

    /// Reset the history of `process_id` after its leak has been handled.
    pub fn acknowledge(&mut self, process_id: u32) {
        if let Some(monitor) = self.processes.get_mut(&process_id) {
            monitor.reset();
        }
    }

    /// Serializable summary of the cluster.
    #[must_use]
    pub fn as_json(&self) -> Value {
        let processes: BTreeMap<String, &LeakMonitor> = self
            .processes
            .iter()
            .map(|(pid, monitor)| (pid.to_string(), monitor))
            .collect();

        serde_json::json!({
            "total_size_limit": self.total_size_limit,
            "processes": processes,
        })
    }
}
