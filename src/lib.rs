//! collab-sync: multi-user database sync protocol and server
//!
//! Clients share named repositories of database snapshots. Each repository
//! has branches; each branch holds its latest snapshot under a monotonically
//! increasing tick. Clients subscribed to the same branch see each other's
//! cursor, name and color changes live.
//!
//! # Layout
//!
//! - `protocol`: the command set and the wire frame
//! - `transport`: TLS/auth negotiation and the per-connection driver
//! - `server`: catalog, sessions and the accept loop
//! - `client`: typed client endpoint
//!
//! # Example
//!
//! ```no_run
//! use collab_sync::client::{Client, ClientOptions, ServerDescriptor};
//! use collab_sync::config::ServerConfig;
//! use collab_sync::model::{Branch, Repository};
//!
//! # async fn demo() -> collab_sync::Result<()> {
//! let server = collab_sync::server::spawn(ServerConfig::default()).await?;
//! let addr = server.local_addr();
//!
//! let client = Client::connect(
//!     &ServerDescriptor::new(addr.ip().to_string(), addr.port()),
//!     ClientOptions::default(),
//! )
//! .await?;
//! client.new_repository(Repository::new("proj1", "d41d8cd9", "proj1.i64", "ELF64")).await?;
//! client.new_branch(Branch::new("proj1", "main")).await?;
//! client.upload_database("proj1", "main", 1, b"snapshot".to_vec()).await?;
//!
//! client.disconnect().await?;
//! server.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod protocol;
pub mod server;
pub mod tls;
pub mod transport;

// Re-export commonly used types
pub use client::{Client, ClientOptions, ServerDescriptor};
pub use config::{KeepAlive, ServerConfig};
pub use error::{Result, SyncError};
pub use model::{Branch, Peer, Repository};
pub use protocol::{Command, CommandKind, CorrelationId, ReplyError};
pub use server::{Server, ServerHandle, ServerStats};
pub use tls::{ClientSslMode, ListenerTls, ServerSslMode, TlsSettings};
pub use transport::{Connection, Incoming, PendingReply, QueueLimits};
