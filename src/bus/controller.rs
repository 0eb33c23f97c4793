//! Objects that answer remote invocations.
//!
//! A [`Controller`] is bound on a [`Connection`] under a symbolic name; the
//! peer invokes its methods by name with a JSON object of named arguments.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{Connection, Proxy, Reference};
use crate::{AppError, Result};

/// Boxed future returned by [`Controller::handle`].
pub type Invocation<'a> = Pin<Box<dyn Future<Output = Result<Reply>> + Send + 'a>>;

/// An object whose methods can be invoked by the peer of a connection.
pub trait Controller: Send + Sync {
    /// Dispatch one remote call.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown method; any other error
    /// is delivered to the caller unchanged.
    fn handle(&self, call: Call) -> Invocation<'_>;

    /// Whether calls can still reach this object. Bindings of objects that
    /// are no longer alive are dropped the next time anything is bound.
    fn is_alive(&self) -> bool {
        true
    }
}

/// Result of a remote call.
pub enum Reply {
    /// A plain JSON value.
    Value(Value),
    /// An object; the connection binds it and returns a reference.
    Object(Arc<dyn Controller>),
    /// An object bound under a fixed name, replacing any earlier binding of
    /// that name.
    Named(String, Arc<dyn Controller>),
}

impl Reply {
    /// Serialize `value` into a [`Reply::Value`].
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Ipc`] if `value` cannot be represented as JSON.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Value(serde_json::to_value(value)?))
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Object(_) => f.write_str("Object(..)"),
            Self::Named(name, _) => f.debug_tuple("Named").field(name).finish(),
        }
    }
}

/// One inbound invocation.
pub struct Call {
    /// Method name.
    pub method: String,
    /// Named arguments (a JSON object, or `null` when none were sent).
    pub args: Value,
    /// Connection the call arrived on; references in `args` resolve here.
    pub connection: Connection,
}

impl Call {
    /// Deserialize the required argument `name`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidArgument`] if the argument is missing, `null`,
    /// or of the wrong type.
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        self.optional_arg(name)?
            .ok_or_else(|| AppError::InvalidArgument(format!("missing '{name}' parameter")))
    }

    /// Deserialize the optional argument `name`; `null` counts as absent.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidArgument`] if the argument has the wrong type.
    pub fn optional_arg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.args.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| AppError::InvalidArgument(format!("invalid '{name}': {err}"))),
        }
    }

    /// Resolve the reference argument `name` into a proxy on this connection.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::InvalidArgument`] if the argument is not a reference.
    pub fn reference(&self, name: &str) -> Result<Proxy> {
        self.args
            .get(name)
            .and_then(Reference::from_value)
            .map(|reference| self.connection.proxy(reference.name()))
            .ok_or_else(|| AppError::InvalidArgument(format!("'{name}' is not an object reference")))
    }

    /// Error for a method this controller does not implement.
    #[must_use]
    pub fn unknown_method(&self, controller: &str) -> AppError {
        AppError::NotFound(format!("{controller} has no method '{}'", self.method))
    }
}
