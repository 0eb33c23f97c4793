//! Bus objects bound by the supervisor and by workers.

pub mod supervisor;
pub mod worker;

pub use supervisor::{SupervisorController, DEFAULT_RESTART_SIGNAL};
pub use worker::WorkerController;

/// Name the supervisor binds its controller under on every connection.
pub const SUPERVISOR_NAME: &str = "supervisor";

/// Name a worker binds its controller under.
pub const WORKER_NAME: &str = "worker";
