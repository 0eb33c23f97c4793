//! Wire frames exchanged on a bus connection.
//!
//! Every frame is one JSON object on its own line:
//!
//! ```json
//! {"type": "invoke", "id": 1, "target": "supervisor", "method": "keys", "args": {}}
//! {"type": "return", "id": 1, "value": [1, 2]}
//! {"type": "error", "id": 1, "error": {"kind": "not_found", "message": "…"}}
//! ```
//!
//! Call IDs are allocated independently by each side, so the pair
//! `(direction, id)` is unique, not `id` alone.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::WireError;

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Call `method` on the object the receiver has bound as `target`.
    Invoke {
        /// Correlation ID chosen by the caller.
        id: u64,
        /// Bound object name on the receiving side.
        target: String,
        /// Method name.
        method: String,
        /// Named arguments.
        #[serde(default)]
        args: Value,
    },
    /// Successful completion of the caller's `id`.
    Return {
        /// Correlation ID of the matching `invoke`.
        id: u64,
        /// Result value; may be a [`Reference`].
        #[serde(default)]
        value: Value,
    },
    /// Failed completion of the caller's `id`.
    Error {
        /// Correlation ID of the matching `invoke`.
        id: u64,
        /// Error kind and message.
        error: WireError,
    },
}

/// A reference to an object bound on the sending side of a connection.
///
/// Encoded as `{"$ref": "<name>"}`. The receiver resolves it into a
/// [`Proxy`](super::Proxy) on the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reference {
    #[serde(rename = "$ref")]
    name: String,
}

impl Reference {
    /// Reference the object bound under `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Bound name of the referenced object.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interpret `value` as a reference, if it has that exact shape.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        Self::deserialize(value).ok()
    }

    /// JSON encoding of this reference.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "$ref": self.name })
    }
}
