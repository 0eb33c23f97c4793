//! Object-proxy bus over Unix domain sockets.
//!
//! Both sides of a connection may bind named [`Controller`]s and call the
//! objects the peer has bound through [`Proxy`] handles. Frames are
//! newline-delimited JSON (see [`protocol`]). A call result that is itself an
//! object is bound on the replying side and delivered as a [`Reference`],
//! which the caller sees as a new proxy; proxies are controllers too, so a
//! reference can point through one connection into another.

pub mod codec;
pub mod connection;
pub mod controller;
pub mod endpoint;
pub mod protocol;
pub mod proxy;

pub use connection::{Connection, ConnectionDriver, ConnectionId};
pub use controller::{Call, Controller, Invocation, Reply};
pub use endpoint::{BoundEndpoint, Endpoint, DEFAULT_IPC_NAME};
pub use protocol::{Frame, Reference};
pub use proxy::Proxy;
