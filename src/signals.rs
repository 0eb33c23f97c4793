//! OS signal delivery.

use std::str::FromStr;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::{AppError, Result};

/// Outcome of a signal sent to a process that may already have exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The signal was delivered.
    Delivered,
    /// The process no longer exists.
    AlreadyExited,
}

/// Parse a signal name such as `INT`, `HUP` or `SIGTERM`.
///
/// # Errors
///
/// Returns [`AppError::InvalidArgument`] for an unknown name.
pub fn parse(name: &str) -> Result<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&full).map_err(|_| AppError::InvalidArgument(format!("unknown signal '{name}'")))
}

/// Send `signal` to `process_id`.
///
/// # Errors
///
/// Returns [`AppError::Signal`] if delivery fails.
pub fn send(process_id: u32, signal: Signal) -> Result<()> {
    let pid = i32::try_from(process_id)
        .map_err(|_| AppError::InvalidArgument(format!("process id {process_id} out of range")))?;
    kill(Pid::from_raw(pid), signal)?;
    Ok(())
}

/// Send `signal` to `process_id`, treating a vanished process as success.
///
/// # Errors
///
/// Returns [`AppError::Signal`] for any failure other than `ESRCH`.
pub fn send_tolerant(process_id: u32, signal: Signal) -> Result<Delivery> {
    let pid = i32::try_from(process_id)
        .map_err(|_| AppError::InvalidArgument(format!("process id {process_id} out of range")))?;
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) => Ok(Delivery::Delivered),
        Err(Errno::ESRCH) => {
            info!(process_id, %signal, "process already exited");
            Ok(Delivery::AlreadyExited)
        }
        Err(errno) => {
            warn!(process_id, %signal, %errno, "failed to signal process");
            Err(errno.into())
        }
    }
}

/// Parent of the current process.
#[must_use]
pub fn parent_process_id() -> u32 {
    std::os::unix::process::parent_id()
}
