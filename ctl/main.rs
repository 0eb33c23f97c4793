#![forbid(unsafe_code)]

//! `worker-supervisor-ctl`: local CLI companion for `worker-supervisor`.
//!
//! Connects to the control socket as a plain client and prints the JSON
//! result of one supervisor or worker call.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;

use worker_supervisor::bus::Endpoint;
use worker_supervisor::client::{Client, SupervisorProxy};
use worker_supervisor::diagnostics::DumpRequest;
use worker_supervisor::{AppError, Result};

#[derive(Debug, Parser)]
#[command(
    name = "worker-supervisor-ctl",
    about = "Local CLI for worker-supervisor",
    version,
    long_about = None
)]
struct Cli {
    /// Directory holding the supervisor's control socket.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Explicit socket path, overriding `--root`.
    #[arg(long)]
    ipc_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn endpoint(&self) -> Endpoint {
        match &self.ipc_path {
            Some(path) => Endpoint::unix(path.clone()),
            None => Endpoint::in_root(&self.root),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show monitor status.
    Status,

    /// List registered worker IDs.
    Workers,

    /// Signal the supervisor's parent process.
    Restart {
        /// Signal name, e.g. INT, TERM or HUP.
        #[arg(long, default_value = "INT")]
        signal: String,
    },

    /// Ask the supervisor's parent to reload (sends HUP).
    Reload,

    /// Sample a worker's memory usage.
    MemorySample {
        /// Worker ID.
        #[arg(long = "connection-id")]
        id: u64,
        /// Sampling window in seconds.
        #[arg(long, default_value_t = 1.0)]
        duration: f64,
        /// Write the report to this file instead of printing.
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Write a worker's memory map to a file.
    MemoryDump {
        /// Worker ID.
        #[arg(long = "connection-id")]
        id: u64,
        /// Destination file on the worker's host.
        path: PathBuf,
    },

    /// Dump a worker's threads.
    ThreadDump {
        /// Worker ID.
        #[arg(long = "connection-id")]
        id: u64,
        /// Write to this file instead of printing.
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Dump a worker's async runtime.
    SchedulerDump {
        /// Worker ID.
        #[arg(long = "connection-id")]
        id: u64,
        /// Write to this file instead of printing.
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Start memory profiling in a worker.
    ProfileStart {
        /// Worker ID.
        #[arg(long = "connection-id")]
        id: u64,
    },

    /// Stop memory profiling in a worker and print the report.
    ProfileStop {
        /// Worker ID.
        #[arg(long = "connection-id")]
        id: u64,
        /// Write to this file instead of printing.
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn main() {
    let args = Cli::parse();
    let endpoint = args.endpoint();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(execute(endpoint.clone(), args.command)) {
        Ok(value) => print_value(&value),
        Err(AppError::Ipc(msg)) => {
            eprintln!("Failed to reach supervisor: {msg}");
            eprintln!(
                "Is worker-supervisor running with its socket at '{}'?",
                endpoint.path().display()
            );
            std::process::exit(1);
        }
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}

async fn execute(endpoint: Endpoint, command: Command) -> Result<Value> {
    let connection = Client::new(endpoint).connect().await?;
    let supervisor = connection.supervisor();
    let result = dispatch(&supervisor, command).await;
    connection.close().await;
    result
}

async fn dispatch(supervisor: &SupervisorProxy, command: Command) -> Result<Value> {
    let value = match command {
        Command::Status => serde_json::to_value(supervisor.status().await?)?,
        Command::Workers => serde_json::to_value(supervisor.keys().await?)?,
        Command::Restart { signal } => supervisor.restart(Some(&signal)).await?,
        Command::Reload => supervisor.restart(Some("HUP")).await?,
        Command::MemorySample { id, duration, path } => {
            let request = DumpRequest { path, log: None };
            let output = supervisor.at(id).await?.memory_sample(duration, &request).await?;
            serde_json::to_value(output)?
        }
        Command::MemoryDump { id, path } => {
            serde_json::to_value(supervisor.at(id).await?.memory_dump(path).await?)?
        }
        Command::ThreadDump { id, path } => {
            let request = DumpRequest { path, log: None };
            serde_json::to_value(supervisor.at(id).await?.thread_dump(&request).await?)?
        }
        Command::SchedulerDump { id, path } => {
            let request = DumpRequest { path, log: None };
            serde_json::to_value(supervisor.at(id).await?.scheduler_dump(&request).await?)?
        }
        Command::ProfileStart { id } => supervisor.at(id).await?.garbage_profile_start().await?,
        Command::ProfileStop { id, path } => {
            let request = DumpRequest { path, log: None };
            serde_json::to_value(supervisor.at(id).await?.garbage_profile_stop(&request).await?)?
        }
    };
    Ok(value)
}

/// Print dump text verbatim; everything else as pretty JSON.
fn print_value(value: &Value) {
    if let Some(data) = value.get("data").and_then(Value::as_str) {
        print!("{data}");
        return;
    }
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}
