#![forbid(unsafe_code)]

//! Supervision of local worker processes over a Unix domain socket.
//!
//! A [`service::Service`] owns the control socket and a [`server::Server`]
//! registry. Workers connect, register through their per-connection
//! [`controllers::SupervisorController`] and receive an ID; clients reach any
//! registered worker through the supervisor. [`monitor`]s observe workers as
//! they come and go.

#[cfg(not(unix))]
compile_error!("worker-supervisor requires Unix domain sockets and POSIX signals");

pub mod bus;
pub mod client;
pub mod config;
pub mod controllers;
pub mod diagnostics;
pub mod errors;
pub mod interval_loop;
pub mod leak;
pub mod metrics;
pub mod monitor;
pub mod server;
pub mod service;
pub mod signals;
pub mod worker;

mod util;

pub use config::SupervisorConfig;
pub use errors::{AppError, Result};
