//! The object a worker binds for the supervisor to call.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tracing::{info_span, Instrument};

use crate::bus::{Call, Controller, Invocation, Reply};
use crate::diagnostics::{Diagnostics, DumpRequest};

/// Exposes a worker's [`Diagnostics`] on the bus.
pub struct WorkerController {
    diagnostics: Arc<Diagnostics>,
}

impl WorkerController {
    /// Controller over `diagnostics`.
    #[must_use]
    pub fn new(diagnostics: Arc<Diagnostics>) -> Self {
        Self { diagnostics }
    }

    /// The diagnostics this controller serves.
    #[must_use]
    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }
}

impl Controller for WorkerController {
    fn handle(&self, call: Call) -> Invocation<'_> {
        let span = info_span!(
            "worker_call",
            method = %call.method,
            process_id = self.diagnostics.process_id()
        );

        Box::pin(
            async move {
                let diagnostics = &self.diagnostics;
                match call.method.as_str() {
                    "memory_sample" => {
                        let duration: f64 = call.arg("duration")?;
                        let request = DumpRequest::from_call(&call)?;
                        Reply::json(&diagnostics.memory_sample(duration, &request).await?)
                    }
                    "memory_dump" => {
                        let path: Option<PathBuf> = call.optional_arg("path")?;
                        Reply::json(&diagnostics.memory_dump(path).await?)
                    }
                    "thread_dump" => {
                        let request = DumpRequest::from_call(&call)?;
                        Reply::json(&diagnostics.thread_dump(&request)?)
                    }
                    "scheduler_dump" => {
                        let request = DumpRequest::from_call(&call)?;
                        Reply::json(&diagnostics.scheduler_dump(&request)?)
                    }
                    "garbage_profile_start" => Ok(Reply::Value(diagnostics.garbage_profile_start())),
                    "garbage_profile_stop" => {
                        let request = DumpRequest::from_call(&call)?;
                        Reply::json(&diagnostics.garbage_profile_stop(&request).await?)
                    }
                    "process_id" => Ok(Reply::Value(json!(diagnostics.process_id()))),
                    _ => Err(call.unknown_method("worker")),
                }
            }
            .instrument(span),
        )
    }
}
