//! In-process diagnostics a worker exposes to the supervisor.

pub mod dump;
pub mod sampler;

use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::leak::{MemoryProbe, SystemProbe};
use crate::util::lock;
use crate::{AppError, Result};

pub use dump::{write_dump, Buffering, DumpOutput, DumpRequest};
pub use sampler::{MemoryReport, MemorySampler, DEFAULT_SAMPLE_PERIOD};

/// Diagnostics for the current worker process.
pub struct Diagnostics {
    process_id: u32,
    probe: Arc<dyn MemoryProbe>,
    sample_period: Duration,
    profile: Mutex<Option<MemorySampler>>,
    tasks: TaskTracker,
    collections: AtomicU64,
}

impl Diagnostics {
    /// Diagnostics for `process_id` measured through the OS process table.
    #[must_use]
    pub fn new(process_id: u32) -> Self {
        Self::with_probe(process_id, Arc::new(SystemProbe::default()))
    }

    /// Diagnostics measured through `probe`.
    #[must_use]
    pub fn with_probe(process_id: u32, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            process_id,
            probe,
            sample_period: DEFAULT_SAMPLE_PERIOD,
            profile: Mutex::new(None),
            tasks: TaskTracker::new(),
            collections: AtomicU64::new(0),
        }
    }

    /// Process being diagnosed.
    #[must_use]
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Tracker for tasks that should appear in scheduler dumps.
    #[must_use]
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Number of collection passes run so far.
    #[must_use]
    pub fn collections(&self) -> u64 {
        self.collections.load(Ordering::Relaxed)
    }

    /// Whether memory profiling is active.
    #[must_use]
    pub fn is_profiling(&self) -> bool {
        lock(&self.profile).is_some()
    }

    /// Release cached measurement state.
    pub fn collect(&self) {
        self.probe.release();
        let passes = self.collections.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(passes, "diagnostics collection pass");
    }

    /// Sample memory for `duration_seconds` and dump the report to
    /// `request`'s destination.
    ///
    /// A collection pass follows the sample even if it is interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidArgument`] unless the duration is a
    /// positive finite number of seconds, or [`AppError::Io`] if the file
    /// cannot be written.
    pub async fn memory_sample(
        &self,
        duration_seconds: f64,
        request: &DumpRequest,
    ) -> Result<DumpOutput> {
        if duration_seconds.is_nan() || duration_seconds <= 0.0 {
            return Err(AppError::InvalidArgument(format!(
                "duration must be positive, got {duration_seconds}"
            )));
        }
        let duration = Duration::try_from_secs_f64(duration_seconds)
            .map_err(|err| AppError::InvalidArgument(format!("invalid duration: {err}")))?;

        let _collect = CollectionPass(self);
        let sampler = MemorySampler::start(Arc::clone(&self.probe), self.process_id, self.sample_period);
        tokio::time::sleep(duration).await;
        let report = sampler.stop().await;

        write_dump(request, Buffering::Allowed, |out| write!(out, "{report}"))
    }

    /// Write the process memory map to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidArgument`] without a path, or
    /// [`AppError::Io`] if the file cannot be written.
    pub async fn memory_dump(&self, path: Option<PathBuf>) -> Result<DumpOutput> {
        let request = DumpRequest { path, log: None };
        let process_id = self.process_id;

        tokio::task::spawn_blocking(move || {
            write_dump(&request, Buffering::Unsupported, |out| {
                write_memory_map(process_id, out)
            })
        })
        .await
        .map_err(|err| AppError::Io(format!("memory dump task failed: {err}")))?
    }

    /// Dump every thread of the process.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the threads cannot be listed or the file
    /// cannot be written.
    pub fn thread_dump(&self, request: &DumpRequest) -> Result<DumpOutput> {
        write_dump(request, Buffering::Allowed, |out| {
            write_threads(self.process_id, out)
        })
    }

    /// Dump the async runtime and the tasks this worker tracks.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the file cannot be written.
    pub fn scheduler_dump(&self, request: &DumpRequest) -> Result<DumpOutput> {
        let text = self.scheduler_summary();
        write_dump(request, Buffering::Allowed, |out| out.write_all(text.as_bytes()))
    }

    /// Start memory profiling. Returns whether profiling was already active.
    pub fn garbage_profile_start(&self) -> Value {
        let mut profile = lock(&self.profile);
        let already_running = profile.is_some();
        if !already_running {
            *profile = Some(MemorySampler::start(
                Arc::clone(&self.probe),
                self.process_id,
                self.sample_period,
            ));
        }
        json!({ "started": true, "already_running": already_running })
    }

    /// Stop memory profiling and dump the report.
    ///
    /// Profiling is off afterwards even if the dump fails.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the file cannot be written.
    pub async fn garbage_profile_stop(&self, request: &DumpRequest) -> Result<DumpOutput> {
        let sampler = lock(&self.profile).take();

        let text = match sampler {
            Some(sampler) => sampler.stop().await.to_string(),
            None => "memory profiling was not running\n".to_owned(),
        };

        write_dump(request, Buffering::Allowed, |out| out.write_all(text.as_bytes()))
    }

    fn scheduler_summary(&self) -> String {
        let mut text = String::new();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let metrics = handle.metrics();
                let _ = writeln!(
                    text,
                    "runtime flavor={:?} workers={} alive_tasks={}",
                    handle.runtime_flavor(),
                    metrics.num_workers(),
                    metrics.num_alive_tasks()
                );
            }
            Err(_) => text.push_str("runtime unavailable\n"),
        }

        let _ = writeln!(
            text,
            "  worker process_id={} tracked_tasks={} closed={}",
            self.process_id,
            self.tasks.len(),
            self.tasks.is_closed()
        );
        let _ = writeln!(
            text,
            "    memory_profile={}",
            if self.is_profiling() { "running" } else { "stopped" }
        );

        text
    }
}

struct CollectionPass<'a>(&'a Diagnostics);

impl Drop for CollectionPass<'_> {
    fn drop(&mut self) {
        self.0.collect();
    }
}

fn write_memory_map(process_id: u32, out: &mut dyn Write) -> io::Result<()> {
    let smaps = Path::new("/proc").join(process_id.to_string()).join("smaps");
    let mut file = fs::File::open(&smaps)?;
    io::copy(&mut file, out)?;
    Ok(())
}

fn write_threads(process_id: u32, out: &mut dyn Write) -> io::Result<()> {
    let task_dir = Path::new("/proc").join(process_id.to_string()).join("task");

    let mut threads: Vec<(u64, PathBuf)> = fs::read_dir(&task_dir)?
        .filter_map(std::result::Result::ok)
        .filter_map(|entry| {
            let tid = entry.file_name().to_str()?.parse().ok()?;
            Some((tid, entry.path()))
        })
        .collect();
    threads.sort_unstable_by_key(|(tid, _)| *tid);

    writeln!(out, "{} threads in process {process_id}", threads.len())?;
    for (tid, path) in threads {
        let name = fs::read_to_string(path.join("comm")).unwrap_or_default();
        let state = fs::read_to_string(path.join("stat"))
            .ok()
            .and_then(|stat| thread_state(&stat))
            .unwrap_or('?');
        writeln!(out, "thread {tid} name={} state={state}", name.trim())?;
    }
    Ok(())
}

/// State letter from a `/proc/<pid>/task/<tid>/stat` line.
fn thread_state(stat: &str) -> Option<char> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}
