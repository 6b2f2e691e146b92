//! Common test utilities for collab-sync integration tests
//!
//! This module provides:
//! - `TestServer`, an in-process server on an ephemeral port
//! - helpers to connect clients and wait for server notifications
//! - a catalog fixture with one repository and one branch

#![allow(unused_imports)]
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use collab_sync::client::{Client, ClientOptions, ServerDescriptor};
use collab_sync::config::{KeepAlive, ServerConfig};
use collab_sync::model::{Branch, Repository};
use collab_sync::protocol::Command;
use collab_sync::server::{self, ServerHandle};

/// How long a test waits for something that should happen
pub const WAIT: Duration = Duration::from_secs(5);

/// How long a test waits for something that should NOT happen
pub const QUIET: Duration = Duration::from_millis(300);

/// In-process server bound to 127.0.0.1 on an ephemeral port
pub struct TestServer {
    pub handle: ServerHandle,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(ServerConfig::default()).await
    }

    pub async fn start_with(config: ServerConfig) -> Self {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            keep_alive: KeepAlive::disabled(),
            ..config
        };
        let handle = server::spawn(config).await.expect("server should start");
        Self { handle }
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    pub fn descriptor(&self) -> ServerDescriptor {
        ServerDescriptor::new("127.0.0.1", self.addr().port())
    }

    pub async fn connect(&self) -> Client {
        Client::connect(&self.descriptor(), ClientOptions::default())
            .await
            .expect("client should connect")
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await.expect("clean shutdown");
    }
}

/// Create `proj1` with branch `main` through `client`
pub async fn seed_catalog(client: &Client) {
    client
        .new_repository(Repository::new("proj1", "d41d8cd9", "proj1.i64", "ELF64"))
        .await
        .expect("new repository");
    client
        .new_branch(Branch::new("proj1", "main"))
        .await
        .expect("new branch");
}

/// Next notification from the server, failing the test after `WAIT`
pub async fn next_command(client: &mut Client) -> Command {
    match tokio::time::timeout(WAIT, client.next_incoming()).await {
        Ok(Some(incoming)) => incoming.command,
        Ok(None) => panic!("Connection closed while waiting for a notification"),
        Err(_) => panic!("Timed out waiting for a notification"),
    }
}

/// Assert that nothing arrives for `QUIET`
pub async fn assert_silent(client: &mut Client) {
    if let Ok(Some(incoming)) = tokio::time::timeout(QUIET, client.next_incoming()).await {
        panic!("Expected no notification, got {:?}", incoming.command);
    }
}
