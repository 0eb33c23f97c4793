//! Where diagnostic output goes.
//!
//! Every dump operation accepts an optional file path and an optional log
//! tag. With a path the output is written to that file. Without one, output
//! that can be buffered in memory is either logged under the tag or handed
//! back to the caller; output that cannot be buffered needs a path.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::bus::Call;
use crate::{AppError, Result};

/// Destination requested by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpRequest {
    /// Write the output to this file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Log the output under this tag instead of returning it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl DumpRequest {
    /// Write to `path`.
    #[must_use]
    pub fn to_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            log: None,
        }
    }

    /// Log under `tag`.
    #[must_use]
    pub fn to_log(tag: impl Into<String>) -> Self {
        Self {
            path: None,
            log: Some(tag.into()),
        }
    }

    pub(crate) fn from_call(call: &Call) -> Result<Self> {
        Ok(Self {
            path: call.optional_arg("path")?,
            log: call.optional_arg("log")?,
        })
    }

    pub(crate) fn to_args(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// What a dump produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpOutput {
    /// File the output was written to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// The output itself, when neither a path nor a log tag was given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Whether a dump may be collected in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buffering {
    /// Output may be buffered and returned or logged.
    Allowed,
    /// Output must go to a file.
    Unsupported,
}

/// Route the output produced by `write` according to `request`.
///
/// # Errors
///
/// Returns [`AppError::Io`] if the file cannot be written, or
/// [`AppError::InvalidArgument`] if `buffering` is unsupported and no path
/// was given.
pub fn write_dump<F>(request: &DumpRequest, buffering: Buffering, write: F) -> Result<DumpOutput>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    if let Some(path) = &request.path {
        let io_error =
            |err: io::Error| AppError::Io(format!("cannot write dump to '{}': {err}", path.display()));

        let mut file = BufWriter::new(File::create(path).map_err(io_error)?);
        write(&mut file).map_err(io_error)?;
        file.flush().map_err(io_error)?;

        return Ok(DumpOutput {
            path: Some(path.clone()),
            data: None,
        });
    }

    if buffering == Buffering::Unsupported {
        return Err(AppError::InvalidArgument(
            "this dump cannot be buffered; a path is required".into(),
        ));
    }

    let mut buffer = Vec::new();
    write(&mut buffer).map_err(|err| AppError::Io(format!("dump failed: {err}")))?;
    let data = String::from_utf8_lossy(&buffer).into_owned();

    match &request.log {
        Some(tag) => {
            info!(tag = %tag, dump = %data, "diagnostic dump");
            Ok(DumpOutput::default())
        }
        None => Ok(DumpOutput {
            path: None,
            data: Some(data),
        }),
    }
}
