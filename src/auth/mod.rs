//! Pluggable connection authentication
//!
//! An `AuthProvider` is consulted around the life of every connection, on
//! both the client and the server. Providers are selected by string key so
//! new schemes can be added without touching the transport.
//!
//! Hook order for one connection:
//!
//! ```text
//! load ─► on_connection_establishing ─► [TLS handshake] ─► on_handshake_attempt
//!                                     ... traffic ...
//!        on_connection_closing ─► [socket shutdown] ─► on_socket_closed
//! ```

pub mod client_cert;

use std::net::SocketAddr;

use tokio_rustls::rustls::pki_types::CertificateDer;

use crate::error::{Result, SyncError};

pub use client_cert::{ClientCertClient, ClientCertServer};

/// Key of the only provider shipped with the crate
pub const CLIENT_CERT: &str = "client_cert";

/// Addresses of the raw TCP socket under a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketInfo {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

/// What the transport learned while negotiating the connection
#[derive(Debug, Clone, Default)]
pub struct HandshakeData {
    /// Whether the stream is TLS-wrapped
    pub tls: bool,
    /// Negotiated protocol version, e.g. "TLSv1_3"
    pub protocol_version: Option<String>,
    /// Verified certificate chain presented by the peer, leaf first
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

/// Inputs a provider may need before its first use
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    /// The local side presents a certificate (client) or requires one (server)
    pub client_cert_required: bool,
}

/// Which end of the connection a provider runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Lifecycle hooks; any failure aborts the connection with `AuthRejected`
pub trait AuthProvider: Send + Sync {
    /// Registry key of this provider
    fn mode(&self) -> &'static str;

    fn load(&mut self, config: &AuthConfig) -> Result<()>;

    fn on_connection_establishing(&self, socket: &SocketInfo) -> Result<()>;

    fn on_handshake_attempt(&self, handshake: &HandshakeData) -> Result<()>;

    fn on_connection_closing(&self, socket: &SocketInfo) -> Result<()>;

    fn on_socket_closed(&self, socket: &SocketInfo) -> Result<()>;
}

/// Instantiate the client-side provider registered under `key`
pub fn client_provider(key: &str) -> Result<Box<dyn AuthProvider>> {
    provider(key, Side::Client)
}

/// Instantiate the server-side provider registered under `key`
pub fn server_provider(key: &str) -> Result<Box<dyn AuthProvider>> {
    provider(key, Side::Server)
}

fn provider(key: &str, side: Side) -> Result<Box<dyn AuthProvider>> {
    match (key, side) {
        (CLIENT_CERT, Side::Client) => Ok(Box::new(ClientCertClient::default())),
        (CLIENT_CERT, Side::Server) => Ok(Box::new(ClientCertServer::default())),
        _ => Err(SyncError::config(format!(
            "unknown auth provider '{}'",
            key
        ))),
    }
}

/// Build the `AuthRejected` error for a failed hook
pub fn rejected(provider: &dyn AuthProvider, stage: &str) -> SyncError {
    SyncError::AuthRejected {
        provider: provider.mode().to_string(),
        stage: stage.to_string(),
    }
}
