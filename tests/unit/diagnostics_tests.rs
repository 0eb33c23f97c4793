use std::sync::Arc;
use std::time::{Duration, Instant};

use worker_supervisor::diagnostics::{Diagnostics, DumpRequest};
use worker_supervisor::leak::MemoryProbe;
use worker_supervisor::AppError;

struct ConstantProbe(u64);

impl MemoryProbe for ConstantProbe {
    fn resident_size(&self, _process_id: u32) -> Option<u64> {
        Some(self.0)
    }
}

fn diagnostics() -> Diagnostics {
    Diagnostics::with_probe(std::process::id(), Arc::new(ConstantProbe(4_096)))
}

#[tokio::test]
async fn memory_sample_rejects_non_positive_duration() {
    let diagnostics = diagnostics();

    for duration in [0.0, -1.0, f64::NAN] {
        let err = diagnostics
            .memory_sample(duration, &DumpRequest::default())
            .await
            .expect_err("invalid duration");
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }
    assert_eq!(diagnostics.collections(), 0, "no sampling happened");
}

#[tokio::test]
async fn memory_sample_reports_and_collects() {
    let diagnostics = diagnostics();

    let started = Instant::now();
    let output = diagnostics
        .memory_sample(0.3, &DumpRequest::default())
        .await
        .expect("sample");
    assert!(started.elapsed() >= Duration::from_millis(300));

    let data = output.data.expect("report returned");
    assert!(data.contains("memory report"));
    assert!(data.contains("retained:       0 bytes"));
    assert_eq!(diagnostics.collections(), 1);
}

#[tokio::test]
async fn memory_sample_writes_report_to_path() {
    let diagnostics = diagnostics();
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("sample.txt");

    let output = diagnostics
        .memory_sample(0.1, &DumpRequest::to_path(&path))
        .await
        .expect("sample");

    assert_eq!(output.path.as_deref(), Some(path.as_path()));
    assert!(output.data.is_none());
    let report = std::fs::read_to_string(&path).expect("report written");
    assert!(report.contains(&format!("memory report for process {}", std::process::id())));
}

#[tokio::test]
async fn memory_dump_needs_a_path() {
    let err = diagnostics().memory_dump(None).await.expect_err("unbuffered");
    assert!(matches!(err, AppError::InvalidArgument(_)));
}

#[tokio::test]
async fn memory_dump_writes_memory_map() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("smaps.txt");

    let output = diagnostics()
        .memory_dump(Some(path.clone()))
        .await
        .expect("dump");
    assert_eq!(output.path.as_deref(), Some(path.as_path()));
    assert!(std::fs::metadata(&path).expect("written").len() > 0);
}

#[tokio::test]
async fn thread_dump_lists_threads() {
    let output = diagnostics().thread_dump(&DumpRequest::default()).expect("dump");
    let data = output.data.expect("buffered");
    assert!(data.contains("threads in process"));
    assert!(data.contains("thread "));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_dump_describes_runtime() {
    let output = diagnostics().scheduler_dump(&DumpRequest::default()).expect("dump");
    let data = output.data.expect("buffered");
    assert!(data.contains("runtime flavor=MultiThread workers=2"));
    assert!(data.contains("memory_profile=stopped"));
}

#[tokio::test]
async fn garbage_profile_toggles_idempotently() {
    let diagnostics = diagnostics();

    let first = diagnostics.garbage_profile_start();
    let second = diagnostics.garbage_profile_start();
    assert_eq!(first["started"], true);
    assert_eq!(first["already_running"], false);
    assert_eq!(second["already_running"], true);
    assert!(diagnostics.is_profiling());

    let output = diagnostics
        .garbage_profile_stop(&DumpRequest::default())
        .await
        .expect("stop");
    assert!(output.data.expect("report").contains("memory report"));
    assert!(!diagnostics.is_profiling());

    let output = diagnostics
        .garbage_profile_stop(&DumpRequest::default())
        .await
        .expect("stop again");
    assert!(output.data.expect("report").contains("not running"));
}
