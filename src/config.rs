//! Connection and server configuration
//!
//! Settings are explicit structs handed over at connection-open time. The
//! server config can be loaded from a TOML file and then overridden from the
//! command line.

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::auth::CLIENT_CERT;
use crate::error::{Result, SyncError};
use crate::protocol::FrameLimits;
use crate::transport::QueueLimits;
use crate::tls::ListenerTls;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 31013;

/// TCP keep-alive probing. Governs socket liveness only; there is no
/// application-level request timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAlive {
    /// Unanswered probes before the connection is dropped
    pub count: u32,
    /// Seconds between probes
    pub interval_secs: u64,
    /// Idle seconds before the first probe; 0 disables keep-alive
    pub idle_secs: u64,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            count: 4,
            interval_secs: 15,
            idle_secs: 240,
        }
    }
}

impl KeepAlive {
    pub fn disabled() -> Self {
        Self {
            count: 0,
            interval_secs: 0,
            idle_secs: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.idle_secs > 0
    }

    /// Apply these parameters to a connected socket
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        let socket = SockRef::from(stream);
        if !self.is_enabled() {
            return socket.set_keepalive(false);
        }

        let params = TcpKeepalive::new().with_time(Duration::from_secs(self.idle_secs));
        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "windows"
        ))]
        let params = if self.interval_secs > 0 {
            params.with_interval(Duration::from_secs(self.interval_secs))
        } else {
            params
        };
        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd"
        ))]
        let params = if self.count > 0 {
            params.with_retries(self.count)
        } else {
            params
        };
        socket.set_tcp_keepalive(&params)
    }
}

/// Configuration of the sync server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls: ListenerTls,
    pub keep_alive: KeepAlive,
    /// Key of the server-side auth provider
    pub auth_provider: String,
    /// Buffered events per subscription group before slow sessions lag
    pub event_capacity: usize,
    /// Largest accepted snapshot, in bytes
    pub max_payload: usize,
    /// Frames queued for one client before its connection is dropped
    pub outbound_queue: usize,
    /// Queries read from one client but not yet handled
    pub incoming_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tls: ListenerTls::default(),
            keep_alive: KeepAlive::default(),
            auth_provider: CLIENT_CERT.to_string(),
            event_capacity: 1024,
            max_payload: FrameLimits::default().max_payload,
            outbound_queue: QueueLimits::default().outbound,
            incoming_queue: QueueLimits::default().incoming,
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file; absent keys keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&text)
            .map_err(|e| SyncError::config(format!("invalid {}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        self.tls.validate()?;
        if self.event_capacity == 0 {
            return Err(SyncError::config("event_capacity must be at least 1"));
        }
        if self.outbound_queue == 0 || self.incoming_queue == 0 {
            return Err(SyncError::config("queue capacities must be at least 1"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_payload: self.max_payload,
            ..FrameLimits::default()
        }
    }

    pub fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            outbound: self.outbound_queue,
            incoming: self.incoming_queue,
        }
    }
}
