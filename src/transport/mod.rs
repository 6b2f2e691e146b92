//! Session transport
//!
//! Turns a byte stream into a correlated query/reply channel:
//!
//! - `negotiate`: TCP, TLS and auth hooks, then the WebSocket upgrade
//! - `connection`: the per-connection driver task and its handle
//! - `pending`: outstanding queries awaiting their reply

pub mod connection;
pub mod negotiate;
pub mod pending;

use tokio::io::{AsyncRead, AsyncWrite};

pub use connection::{spawn, Connection, Incoming, QueueLimits};
pub use negotiate::{Negotiated, Opened};
pub use pending::{PendingReply, PendingTable};

/// Any stream a connection can run over, plaintext or TLS
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;
