//! Wall-clock aligned periodic execution.
//!
//! [`run`] invokes an action on every multiple of `interval` since the Unix
//! epoch (an interval of 10 s fires at :00, :10, :20, …) regardless of how long
//! earlier iterations took. A failing or panicking iteration is logged and the
//! loop carries on at the next boundary; only cancellation stops it.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info_span, warn, Instrument};

use crate::Result;

/// Time remaining from `now` until the next multiple of `interval`.
///
/// Always in `(0, interval]` for a non-zero interval; zero otherwise.
#[must_use]
pub fn until_next_boundary(interval: Duration, now: SystemTime) -> Duration {
    let interval_nanos = interval.as_nanos();
    if interval_nanos == 0 {
        return Duration::ZERO;
    }

    let elapsed = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let wait = interval_nanos - elapsed % interval_nanos;

    Duration::from_nanos(u64::try_from(wait).unwrap_or(u64::MAX))
}

/// Run `action` at aligned `interval`s until `cancel` fires.
pub async fn run<F, Fut>(interval: Duration, cancel: CancellationToken, mut action: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    if interval.is_zero() {
        warn!("refusing to run loop with a zero interval");
        return;
    }

    loop {
        let wait = until_next_boundary(interval, SystemTime::now());
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(wait) => {}
        }

        match AssertUnwindSafe(action()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(%err, "loop error"),
            Err(panic) => error!(panic = %panic_message(panic.as_ref()), "loop iteration panicked"),
        }
    }
}

/// Spawn [`run`] on its own task inside a span called `name`.
#[must_use]
pub fn spawn<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    action: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let span = info_span!("interval_loop", name, interval_secs = interval.as_secs_f64());
    tokio::spawn(run(interval, cancel, action).instrument(span))
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
