//! Remote references.
//!
//! A [`Proxy`] names an object bound by the peer of a specific connection.
//! Because a proxy is itself a [`Controller`], it can be returned from a
//! call or bound on a *different* connection; invocations then hop across
//! to the connection the proxy belongs to. This is how a client reaches a
//! worker through the supervisor.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::controller::{Call, Controller, Invocation, Reply};
use super::{Connection, Reference};
use crate::{AppError, Result};

/// Reference to an object bound on the far side of `connection`.
#[derive(Clone, Debug)]
pub struct Proxy {
    connection: Connection,
    name: String,
}

impl Proxy {
    /// Proxy for the peer object bound under `name`.
    #[must_use]
    pub fn new(connection: Connection, name: impl Into<String>) -> Self {
        Self {
            connection,
            name: name.into(),
        }
    }

    /// Bound name on the peer.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection that carries this proxy's calls.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Invoke `method` and return the raw JSON result.
    ///
    /// # Errors
    ///
    /// Propagates the peer's error or a transport failure.
    pub async fn invoke(&self, method: &str, args: Value) -> Result<Value> {
        self.connection.invoke(&self.name, method, args).await
    }

    /// Invoke `method` and deserialize the result.
    ///
    /// # Errors
    ///
    /// Propagates the peer's error or a transport failure; returns
    /// [`AppError::Ipc`] if the result has an unexpected shape.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, args: Value) -> Result<T> {
        let value = self.invoke(method, args).await?;
        serde_json::from_value(value)
            .map_err(|err| AppError::Ipc(format!("unexpected result from '{method}': {err}")))
    }

    /// Invoke `method`, expecting an object reference, and return a proxy to it.
    ///
    /// # Errors
    ///
    /// Propagates the peer's error or a transport failure; returns
    /// [`AppError::Ipc`] if the result is not a reference.
    pub async fn call_object(&self, method: &str, args: Value) -> Result<Proxy> {
        let value = self.invoke(method, args).await?;
        Reference::from_value(&value)
            .map(|reference| self.connection.proxy(reference.name()))
            .ok_or_else(|| AppError::Ipc(format!("'{method}' did not return an object reference")))
    }
}

impl Controller for Proxy {
    fn handle(&self, call: Call) -> Invocation<'_> {
        Box::pin(async move {
            let Call {
                method,
                args,
                connection: origin,
            } = call;

            let args = rebind_references(args, &origin, &self.connection);
            let value = self.connection.invoke(&self.name, &method, args).await?;

            Ok(match Reference::from_value(&value) {
                Some(reference) => Reply::Named(
                    forwarding_name(&self.connection, reference.name()),
                    Arc::new(self.connection.proxy(reference.name())),
                ),
                None => Reply::Value(value),
            })
        })
    }

    fn is_alive(&self) -> bool {
        !self.connection.is_closed()
    }
}

/// Name under which an object bound as `name` on the peer of `connection`
/// is re-exposed elsewhere. Forwarding the same object twice reuses it.
fn forwarding_name(connection: &Connection, name: &str) -> String {
    format!("fwd-{}-{name}", connection.id())
}

/// Rewrite references that arrived on `from` so they resolve on `to`.
///
/// Each reference becomes a forwarding proxy bound on `to`.
fn rebind_references(value: Value, from: &Connection, to: &Connection) -> Value {
    if let Some(reference) = Reference::from_value(&value) {
        return to
            .bind(
                forwarding_name(from, reference.name()),
                Arc::new(from.proxy(reference.name())),
            )
            .to_value();
    }

    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| rebind_references(item, from, to))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, item)| (key, rebind_references(item, from, to)))
                .collect(),
        ),
        other => other,
    }
}
