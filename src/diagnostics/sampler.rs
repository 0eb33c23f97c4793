//! Background memory sampling.

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::leak::MemoryProbe;

/// Default time between samples.
pub const DEFAULT_SAMPLE_PERIOD: Duration = Duration::from_millis(100);

/// Summary of a sampling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryReport {
    /// Sampled process.
    pub process_id: u32,
    /// When sampling began.
    pub started_at: DateTime<Utc>,
    /// Length of the window.
    pub duration_seconds: f64,
    /// Number of samples taken.
    pub samples: usize,
    /// Resident size at the first sample.
    pub initial_size: u64,
    /// Resident size at the last sample.
    pub final_size: u64,
    /// Largest resident size seen.
    pub peak_size: u64,
    /// Sum of all increases between consecutive samples.
    pub allocated: u64,
    /// Net change over the window; negative if memory was returned.
    pub retained: i64,
}

impl MemoryReport {
    fn from_samples(
        process_id: u32,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        samples: &[u64],
    ) -> Self {
        let initial_size = samples.first().copied().unwrap_or(0);
        let final_size = samples.last().copied().unwrap_or(0);
        let allocated = samples
            .windows(2)
            .map(|pair| pair[1].saturating_sub(pair[0]))
            .sum();
        let retained = i64::try_from(final_size).unwrap_or(i64::MAX)
            - i64::try_from(initial_size).unwrap_or(i64::MAX);

        Self {
            process_id,
            started_at,
            duration_seconds: elapsed.as_secs_f64(),
            samples: samples.len(),
            initial_size,
            final_size,
            peak_size: samples.iter().copied().max().unwrap_or(0),
            allocated,
            retained,
        }
    }
}

impl Display for MemoryReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "memory report for process {} ({} samples over {:.3}s from {})",
            self.process_id,
            self.samples,
            self.duration_seconds,
            self.started_at.to_rfc3339()
        )?;
        writeln!(f, "  initial size:   {} bytes", self.initial_size)?;
        writeln!(f, "  final size:     {} bytes", self.final_size)?;
        writeln!(f, "  peak size:      {} bytes", self.peak_size)?;
        writeln!(f, "  allocated:      {} bytes", self.allocated)?;
        writeln!(f, "  retained:       {} bytes", self.retained)
    }
}

/// Samples a process's resident size until stopped.
///
/// Dropping the sampler stops the background task.
pub struct MemorySampler {
    process_id: u32,
    started_at: DateTime<Utc>,
    started: Instant,
    cancel: CancellationToken,
    task: Option<JoinHandle<Vec<u64>>>,
}

impl MemorySampler {
    /// Begin sampling `process_id` every `period`.
    #[must_use]
    pub fn start(probe: Arc<dyn MemoryProbe>, process_id: u32, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = period.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut samples = Vec::new();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(size) = probe.resident_size(process_id) {
                            samples.push(size);
                        }
                    }
                }
            }

            if let Some(size) = probe.resident_size(process_id) {
                samples.push(size);
            }
            samples
        });

        Self {
            process_id,
            started_at: Utc::now(),
            started: Instant::now(),
            cancel,
            task: Some(task),
        }
    }

    /// Whether the background task is still sampling.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop sampling and summarize.
    pub async fn stop(mut self) -> MemoryReport {
        self.cancel.cancel();
        let elapsed = self.started.elapsed();

        let samples = match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|err| {
                warn!(process_id = self.process_id, %err, "memory sampler task failed");
                Vec::new()
            }),
            None => Vec::new(),
        };

        MemoryReport::from_samples(self.process_id, self.started_at, elapsed, &samples)
    }
}

impl Drop for MemorySampler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
