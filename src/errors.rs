//! Error types shared across the supervisor, workers and the bus.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Bus transport failure (socket, framing, closed connection).
    Ipc(String),
    /// Protocol violation such as a second registration or an ID collision.
    Protocol(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Caller supplied an invalid argument.
    InvalidArgument(String),
    /// Failure reported by the peer that has no more specific kind.
    Remote(String),
    /// Delivering an OS signal failed.
    Signal(String),
    /// A monitor failed while handling a notification.
    Monitor(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Stable identifier used when the error crosses the bus.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Ipc(_) => "ipc",
            Self::Protocol(_) => "protocol",
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Remote(_) => "remote",
            Self::Signal(_) => "signal",
            Self::Monitor(_) => "monitor",
            Self::Io(_) => "io",
        }
    }

    /// The message without the kind prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Config(msg)
            | Self::Ipc(msg)
            | Self::Protocol(msg)
            | Self::NotFound(msg)
            | Self::InvalidArgument(msg)
            | Self::Remote(msg)
            | Self::Signal(msg)
            | Self::Monitor(msg)
            | Self::Io(msg) => msg,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Remote(msg) => write!(f, "remote: {msg}"),
            Self::Signal(msg) => write!(f, "signal: {msg}"),
            Self::Monitor(msg) => write!(f, "monitor: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Ipc(format!("invalid json: {err}"))
    }
}

impl From<nix::errno::Errno> for AppError {
    fn from(err: nix::errno::Errno) -> Self {
        Self::Signal(err.desc().to_owned())
    }
}

/// Wire form of an [`AppError`] carried in `error` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Value of [`AppError::kind`].
    pub kind: String,
    /// Value of [`AppError::message`].
    pub message: String,
}

impl From<&AppError> for WireError {
    fn from(err: &AppError) -> Self {
        Self {
            kind: err.kind().to_owned(),
            message: err.message().to_owned(),
        }
    }
}

impl From<WireError> for AppError {
    fn from(err: WireError) -> Self {
        match err.kind.as_str() {
            "config" => Self::Config(err.message),
            "ipc" => Self::Ipc(err.message),
            "protocol" => Self::Protocol(err.message),
            "not_found" => Self::NotFound(err.message),
            "invalid_argument" => Self::InvalidArgument(err.message),
            "signal" => Self::Signal(err.message),
            "monitor" => Self::Monitor(err.message),
            "io" => Self::Io(err.message),
            _ => Self::Remote(err.message),
        }
    }
}
