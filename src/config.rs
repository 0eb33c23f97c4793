//! Supervisor configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::bus::Endpoint;
use crate::leak::{LeakOptions, DEFAULT_INCREASE_LIMIT};
use crate::monitor::{memory, process, MemoryMonitor, MemorySampleOptions, Monitor, ProcessMonitor};
use crate::{AppError, Result};

/// `[memory_monitor]` table.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct MemoryMonitorConfig {
    /// Whether the monitor is installed.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between leak checks.
    #[serde(default = "default_memory_interval")]
    pub interval_seconds: u64,
    /// Combined resident-size limit in bytes for all workers.
    #[serde(default)]
    pub total_size_limit: Option<u64>,
    /// Per-process resident-size limit in bytes.
    #[serde(default)]
    pub maximum_size_limit: Option<u64>,
    /// Maximum-size increases tolerated before a process is leaking.
    #[serde(default = "default_increase_limit")]
    pub increase_limit: u32,
    /// Capture a memory sample from leaking workers before interrupting them.
    #[serde(default)]
    pub memory_sample: Option<MemorySampleOptions>,
}

impl Default for MemoryMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_memory_interval(),
            total_size_limit: None,
            maximum_size_limit: None,
            increase_limit: DEFAULT_INCREASE_LIMIT,
            memory_sample: None,
        }
    }
}

/// `[process_monitor]` table.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ProcessMonitorConfig {
    /// Whether the monitor is installed.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between metric captures.
    #[serde(default = "default_process_interval")]
    pub interval_seconds: u64,
    /// Root of the monitored process tree; defaults to the supervisor's parent.
    #[serde(default)]
    pub ppid: Option<u32>,
}

impl Default for ProcessMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_process_interval(),
            ppid: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_memory_interval() -> u64 {
    memory::DEFAULT_INTERVAL.as_secs()
}

fn default_process_interval() -> u64 {
    process::DEFAULT_INTERVAL.as_secs()
}

fn default_increase_limit() -> u32 {
    DEFAULT_INCREASE_LIMIT
}

/// Supervisor configuration parsed from `supervisor.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Directory holding the control socket.
    pub root: PathBuf,
    /// Explicit socket path, overriding `<root>/supervisor.ipc`.
    #[serde(default)]
    pub ipc_path: Option<PathBuf>,
    /// Memory leak monitor; absent means not installed.
    #[serde(default)]
    pub memory_monitor: Option<MemoryMonitorConfig>,
    /// Process metrics monitor; absent means not installed.
    #[serde(default)]
    pub process_monitor: Option<ProcessMonitorConfig>,
}

impl SupervisorConfig {
    /// Configuration rooted at `root` with no monitors.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ipc_path: None,
            memory_monitor: None,
            process_monitor: None,
        }
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Replace the root directory, resolving it the same way a configured
    /// root is. An explicit `ipc_path` still takes precedence for the socket.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `root` does not exist.
    pub fn set_root(&mut self, root: impl AsRef<Path>) -> Result<()> {
        self.root = canonical_root(root.as_ref())?;
        Ok(())
    }

    /// Path of the control socket.
    #[must_use]
    pub fn ipc_path(&self) -> PathBuf {
        self.ipc_path
            .clone()
            .unwrap_or_else(|| Endpoint::in_root(&self.root).path().to_path_buf())
    }

    /// Endpoint of the control socket.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::unix(self.ipc_path())
    }

    /// Build the enabled monitors, memory monitor first.
    #[must_use]
    pub fn monitors(&self) -> Vec<Arc<dyn Monitor>> {
        let mut monitors: Vec<Arc<dyn Monitor>> = Vec::new();

        if let Some(config) = self.memory_monitor.as_ref().filter(|c| c.enabled) {
            let mut monitor = MemoryMonitor::new(
                Duration::from_secs(config.interval_seconds),
                config.total_size_limit,
            )
            .with_leak_options(LeakOptions {
                increase_limit: config.increase_limit,
                maximum_size_limit: config.maximum_size_limit,
            });
            if let Some(sample) = config.memory_sample {
                monitor = monitor.with_memory_sample(sample);
            }
            monitors.push(Arc::new(monitor));
        }

        if let Some(config) = self.process_monitor.as_ref().filter(|c| c.enabled) {
            monitors.push(Arc::new(ProcessMonitor::new(
                Duration::from_secs(config.interval_seconds),
                config.ppid,
            )));
        }

        monitors
    }

    fn validate(&mut self) -> Result<()> {
        self.root = canonical_root(&self.root)?;

        if let Some(memory) = &self.memory_monitor {
            if memory.interval_seconds == 0 {
                return Err(AppError::Config(
                    "memory_monitor.interval_seconds must be greater than zero".into(),
                ));
            }
            if memory.increase_limit == 0 {
                return Err(AppError::Config(
                    "memory_monitor.increase_limit must be greater than zero".into(),
                ));
            }
            if let Some(sample) = memory.memory_sample {
                if sample.duration_seconds.is_nan() || sample.duration_seconds <= 0.0 {
                    return Err(AppError::Config(
                        "memory_monitor.memory_sample.duration_seconds must be positive".into(),
                    ));
                }
            }
        }

        if let Some(process) = &self.process_monitor {
            if process.interval_seconds == 0 {
                return Err(AppError::Config(
                    "process_monitor.interval_seconds must be greater than zero".into(),
                ));
            }
        }

        Ok(())
    }
}

fn canonical_root(root: &Path) -> Result<PathBuf> {
    root.canonicalize()
        .map_err(|err| AppError::Config(format!("root invalid: {err}")))
}
