//! Bidirectional object-proxy connection.
//!
//! Either side of a [`Connection`] can bind local [`Controller`]s under a name
//! and invoke methods on the objects the peer has bound. The
//! [`ConnectionDriver`] owns the socket: it reads frames, dispatches inbound
//! invocations on their own tasks so nested calls never deadlock, and routes
//! replies to the waiting callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::BusCodec;
use super::controller::{Call, Controller, Reply};
use super::protocol::{Frame, Reference};
use super::Proxy;
use crate::errors::WireError;
use crate::util::lock;
use crate::{AppError, Result};

/// Outbound frame queue depth per connection.
const OUTBOUND_CAPACITY: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a connection.
pub type ConnectionId = u64;

type PendingCalls = HashMap<u64, oneshot::Sender<Result<Value>>>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Inner {
    id: ConnectionId,
    outbound: mpsc::Sender<Frame>,
    bindings: Mutex<HashMap<String, Arc<dyn Controller>>>,
    pending: Mutex<PendingCalls>,
    next_call: AtomicU64,
    next_reference: AtomicU64,
    closed: CancellationToken,
}

/// Cheaply cloneable handle to one bus connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap a byte stream. The returned driver must be run for any traffic
    /// to flow.
    pub fn new<S>(stream: S) -> (Self, ConnectionDriver)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let connection = Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                outbound: outbound_tx,
                bindings: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_call: AtomicU64::new(0),
                next_reference: AtomicU64::new(0),
                closed: CancellationToken::new(),
            }),
        };

        let driver = ConnectionDriver {
            connection: connection.clone(),
            reader: FramedRead::new(Box::new(reader), BusCodec::new()),
            writer: Box::new(writer),
            outbound: outbound_rx,
        };

        (connection, driver)
    }

    /// Identity of this connection.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Expose `controller` to the peer under `name`, replacing any previous
    /// binding. The returned reference can be passed to the peer as an argument.
    ///
    /// Bindings whose controller is no longer alive are released first.
    pub fn bind(&self, name: impl Into<String>, controller: Arc<dyn Controller>) -> Reference {
        let name = name.into();
        let mut bindings = lock(&self.inner.bindings);
        let before = bindings.len();
        bindings.retain(|_, bound| bound.is_alive());
        let released = before - bindings.len();
        if released > 0 {
            debug!(connection = self.inner.id, released, "released dead bindings");
        }
        bindings.insert(name.clone(), controller);
        Reference::new(name)
    }

    /// Bind `controller` under a freshly generated name.
    pub fn bind_anonymous(&self, controller: Arc<dyn Controller>) -> Reference {
        let n = self.inner.next_reference.fetch_add(1, Ordering::Relaxed) + 1;
        self.bind(format!("ref-{n}"), controller)
    }

    /// Remove the binding `name`. Returns whether it existed.
    pub fn unbind(&self, name: &str) -> bool {
        lock(&self.inner.bindings).remove(name).is_some()
    }

    /// Number of objects currently bound on this side.
    #[must_use]
    pub fn binding_count(&self) -> usize {
        lock(&self.inner.bindings).len()
    }

    /// Proxy for the object the peer has bound under `name`.
    #[must_use]
    pub fn proxy(&self, name: &str) -> Proxy {
        Proxy::new(self.clone(), name)
    }

    /// Invoke `method` on the peer object `target` and wait for its reply.
    ///
    /// # Errors
    ///
    /// Returns the error raised by the peer, or [`AppError::Ipc`] if the
    /// connection closes before a reply arrives.
    pub async fn invoke(&self, target: &str, method: &str, args: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(closed_error());
        }

        let id = self.inner.next_call.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id, tx);

        // `shutdown` may have drained the map just before the insert.
        if self.is_closed() {
            lock(&self.inner.pending).remove(&id);
            return Err(closed_error());
        }

        let frame = Frame::Invoke {
            id,
            target: target.to_owned(),
            method: method.to_owned(),
            args,
        };

        if self.inner.outbound.send(frame).await.is_err() {
            lock(&self.inner.pending).remove(&id);
            return Err(closed_error());
        }

        rx.await.unwrap_or_else(|_| Err(closed_error()))
    }

    /// Ask the driver to stop. Pending calls fail with [`AppError::Ipc`].
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Whether the connection has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the connection has stopped.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        self.inner
            .outbound
            .send(frame)
            .await
            .map_err(|_| closed_error())
    }

    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Invoke {
                id,
                target,
                method,
                args,
            } => {
                let connection = self.clone();
                tokio::spawn(async move {
                    let closed = connection.inner.closed.clone();
                    tokio::select! {
                        () = closed.cancelled() => {
                            debug!(connection = connection.id(), id, "call abandoned, connection closed");
                        }
                        frame = connection.serve(id, &target, method, args) => {
                            if let Err(err) = connection.send(frame).await {
                                debug!(connection = connection.id(), id, %err, "reply dropped");
                            }
                        }
                    }
                });
            }
            Frame::Return { id, value } => self.complete(id, Ok(value)),
            Frame::Error { id, error } => self.complete(id, Err(error.into())),
        }
    }

    async fn serve(&self, id: u64, target: &str, method: String, args: Value) -> Frame {
        let controller = lock(&self.inner.bindings).get(target).cloned();

        let Some(controller) = controller else {
            let err = AppError::NotFound(format!("no object bound as '{target}'"));
            return Frame::Error {
                id,
                error: WireError::from(&err),
            };
        };

        let call = Call {
            method,
            args,
            connection: self.clone(),
        };

        match controller.handle(call).await {
            Ok(Reply::Value(value)) => Frame::Return { id, value },
            Ok(Reply::Object(object)) => Frame::Return {
                id,
                value: self.bind_anonymous(object).to_value(),
            },
            Ok(Reply::Named(name, object)) => Frame::Return {
                id,
                value: self.bind(name, object).to_value(),
            },
            Err(err) => Frame::Error {
                id,
                error: WireError::from(&err),
            },
        }
    }

    fn complete(&self, id: u64, result: Result<Value>) {
        let sender = lock(&self.inner.pending).remove(&id);
        match sender {
            Some(tx) => {
                // The caller may have been cancelled; nothing to deliver to.
                let _ = tx.send(result);
            }
            None => warn!(connection = self.id(), id, "reply for unknown call"),
        }
    }

    fn shutdown(&self) {
        self.inner.closed.cancel();

        let pending: Vec<_> = lock(&self.inner.pending).drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(closed_error()));
        }

        // Bound controllers commonly hold this connection; dropping them
        // breaks the cycle.
        lock(&self.inner.bindings).clear();
    }
}

/// Owns the socket halves of a [`Connection`] and pumps frames.
pub struct ConnectionDriver {
    connection: Connection,
    reader: FramedRead<BoxedReader, BusCodec>,
    writer: BoxedWriter,
    outbound: mpsc::Receiver<Frame>,
}

impl ConnectionDriver {
    /// The connection this driver serves.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Pump frames until the peer disconnects, a transport error occurs, or
    /// [`Connection::close`] is called. On return all pending calls have
    /// failed and all bindings are released.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Ipc`] or [`AppError::Io`] on transport failure.
    pub async fn run(self) -> Result<()> {
        let Self {
            connection,
            mut reader,
            mut writer,
            mut outbound,
        } = self;
        let closed = connection.inner.closed.clone();

        let result = tokio::select! {
            result = read_frames(&connection, &mut reader) => result,
            result = write_frames(&mut writer, &mut outbound) => result,
            () = closed.cancelled() => Ok(()),
        };

        connection.shutdown();
        if let Err(err) = writer.shutdown().await {
            debug!(connection = connection.id(), %err, "socket shutdown failed");
        }

        result
    }
}

async fn read_frames(
    connection: &Connection,
    reader: &mut FramedRead<BoxedReader, BusCodec>,
) -> Result<()> {
    while let Some(line) = reader.next().await {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<Frame>(trimmed) {
            Ok(frame) => connection.dispatch(frame),
            Err(err) => warn!(connection = connection.id(), %err, "discarding malformed frame"),
        }
    }

    debug!(connection = connection.id(), "peer closed connection");
    Ok(())
}

async fn write_frames(writer: &mut BoxedWriter, outbound: &mut mpsc::Receiver<Frame>) -> Result<()> {
    let mut codec = BusCodec::new();
    let mut buffer = BytesMut::new();

    while let Some(frame) = outbound.recv().await {
        codec.encode(serde_json::to_string(&frame)?, &mut buffer)?;
        writer
            .write_all(&buffer)
            .await
            .map_err(|err| AppError::Ipc(format!("write failed: {err}")))?;
        buffer.clear();
    }
    Ok(())
}

fn closed_error() -> AppError {
    AppError::Ipc("connection closed".into())
}
