//! `client_cert` provider: authentication by TLS client certificate
//!
//! rustls performs the chain verification itself. The provider only checks
//! that the negotiated connection matches the configured policy, so a
//! certificate requirement can never be silently skipped.

use crate::auth::{rejected, AuthConfig, AuthProvider, HandshakeData, SocketInfo, CLIENT_CERT};
use crate::error::Result;

/// Client side of `client_cert`
#[derive(Debug, Default)]
pub struct ClientCertClient {
    config: AuthConfig,
}

impl AuthProvider for ClientCertClient {
    fn mode(&self) -> &'static str {
        CLIENT_CERT
    }

    fn load(&mut self, config: &AuthConfig) -> Result<()> {
        self.config = config.clone();
        Ok(())
    }

    fn on_connection_establishing(&self, socket: &SocketInfo) -> Result<()> {
        tracing::debug!("Connecting {} -> {}", socket.local_addr, socket.peer_addr);
        Ok(())
    }

    fn on_handshake_attempt(&self, handshake: &HandshakeData) -> Result<()> {
        // A certificate we were told to present is worthless over plaintext.
        if self.config.client_cert_required && !handshake.tls {
            return Err(rejected(self, "handshake"));
        }
        Ok(())
    }

    fn on_connection_closing(&self, _socket: &SocketInfo) -> Result<()> {
        Ok(())
    }

    fn on_socket_closed(&self, socket: &SocketInfo) -> Result<()> {
        tracing::debug!("Socket to {} closed", socket.peer_addr);
        Ok(())
    }
}

/// Server side of `client_cert`
#[derive(Debug, Default)]
pub struct ClientCertServer {
    config: AuthConfig,
}

impl AuthProvider for ClientCertServer {
    fn mode(&self) -> &'static str {
        CLIENT_CERT
    }

    fn load(&mut self, config: &AuthConfig) -> Result<()> {
        self.config = config.clone();
        Ok(())
    }

    fn on_connection_establishing(&self, socket: &SocketInfo) -> Result<()> {
        tracing::debug!("Accepting {} on {}", socket.peer_addr, socket.local_addr);
        Ok(())
    }

    fn on_handshake_attempt(&self, handshake: &HandshakeData) -> Result<()> {
        if self.config.client_cert_required
            && (!handshake.tls || handshake.peer_certificates.is_empty())
        {
            return Err(rejected(self, "handshake"));
        }
        Ok(())
    }

    fn on_connection_closing(&self, _socket: &SocketInfo) -> Result<()> {
        Ok(())
    }

    fn on_socket_closed(&self, socket: &SocketInfo) -> Result<()> {
        tracing::debug!("Socket from {} closed", socket.peer_addr);
        Ok(())
    }
}
