//! Client endpoint
//!
//! Connects to a sync server and exposes the command set as typed calls.
//!
//! # Example
//!
//! ```no_run
//! use collab_sync::client::{Client, ClientOptions, ServerDescriptor};
//! use collab_sync::model::Repository;
//!
//! # async fn demo() -> collab_sync::Result<()> {
//! let server = ServerDescriptor::new("127.0.0.1", 31013);
//! let client = Client::connect(&server, ClientOptions::default()).await?;
//! client
//!     .new_repository(Repository::new("proj1", "d41d8cd9", "proj1.i64", "ELF64"))
//!     .await?;
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::{client_provider, AuthConfig, AuthProvider, HandshakeData, SocketInfo, CLIENT_CERT};
use crate::config::KeepAlive;
use crate::error::{Result, SyncError};
use crate::model::{Branch, Peer, Repository};
use crate::protocol::{
    Command, CommandKind, CorrelationId, DownloadDb, FrameLimits, GetBranches, GetRepos,
    NewBranch, NewRepo, RenamedUser, Subscribe, Unsubscribe, UpdateCursors, UploadDb,
    UserColorChanged,
};
use crate::tls::{ClientSslMode, TlsSettings};
use crate::transport::{self, negotiate, Connection, Incoming, PendingReply, QueueLimits};

/// Where and how to reach a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub host: String,
    pub port: u16,
    pub tls: TlsSettings,
}

impl ServerDescriptor {
    /// A plaintext server
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: TlsSettings::plaintext(),
        }
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }
}

impl std::fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-connection settings that are not about the server itself
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub keep_alive: KeepAlive,
    /// Key of the client-side auth provider
    pub auth_provider: String,
    pub limits: FrameLimits,
    /// Once `incoming` is full the connection is dropped, so keep calling
    /// `next_incoming`
    pub queues: QueueLimits,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            keep_alive: KeepAlive::default(),
            auth_provider: CLIENT_CERT.to_string(),
            limits: FrameLimits::default(),
            queues: QueueLimits::default(),
        }
    }
}

/// A connected client
pub struct Client {
    conn: Connection,
    incoming: mpsc::Receiver<Incoming>,
    driver: Option<JoinHandle<()>>,
    provider: Box<dyn AuthProvider>,
    socket: SocketInfo,
    handshake: HandshakeData,
}

impl Client {
    /// Connect and negotiate. TLS settings are validated before any socket
    /// is opened.
    pub async fn connect(server: &ServerDescriptor, options: ClientOptions) -> Result<Self> {
        server.tls.validate()?;

        let mut provider = client_provider(&options.auth_provider)?;
        provider.load(&AuthConfig {
            client_cert_required: server.tls.client_ssl_mode == ClientSslMode::ClientCert,
        })?;

        let opened = negotiate::open_client(
            &server.host,
            server.port,
            &server.tls,
            &options.keep_alive,
            provider.as_ref(),
            &options.limits,
        )
        .await?;
        let socket = opened.socket;
        let handshake = opened.handshake;

        let (conn, incoming, driver) =
            transport::spawn(opened.ws, socket.peer_addr, options.limits, options.queues);
        tracing::info!(
            "Connected to {}{}",
            server,
            if handshake.tls { " over TLS" } else { "" }
        );

        Ok(Self {
            conn,
            incoming,
            driver: Some(driver),
            provider,
            socket,
            handshake,
        })
    }

    /// Close the connection. Queries still pending fail with `Disconnected`.
    pub async fn disconnect(mut self) -> Result<()> {
        let closing = self.provider.on_connection_closing(&self.socket);
        self.conn.close();
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
        let closed = self.provider.on_socket_closed(&self.socket);
        tracing::info!("Disconnected from {}", self.socket.peer_addr);
        closing.and(closed)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn handshake(&self) -> &HandshakeData {
        &self.handshake
    }

    pub fn is_connected(&self) -> bool {
        !self.conn.is_closed()
    }

    pub fn send_query(&self, command: Command) -> Result<PendingReply> {
        self.conn.send_query(command)
    }

    pub fn send_event(&self, command: Command) -> Result<CorrelationId> {
        self.conn.send_event(command)
    }

    pub fn notify(&self, command: Command) -> Result<()> {
        self.conn.notify(command)
    }

    /// Next notification or event from the server; `None` once disconnected.
    ///
    /// The server never expects answers from clients, so any query that
    /// does is refused here.
    pub async fn next_incoming(&mut self) -> Option<Incoming> {
        loop {
            let incoming = self.incoming.recv().await?;
            if !incoming.expects_reply() {
                return Some(incoming);
            }
            let kind = incoming.command.kind();
            tracing::debug!("Refusing server query {} #{}", kind, incoming.id);
            let refusal = Err(SyncError::Rejected {
                message: format!("client does not handle '{}'", kind),
            });
            let _ = self.conn.reply(incoming.id, kind, refusal);
        }
    }

    async fn call(&self, command: Command) -> Result<Command> {
        self.send_query(command)?.await
    }

    // ========================================================================
    // Typed commands
    // ========================================================================

    pub async fn repositories(&self) -> Result<Vec<Repository>> {
        match self.call(Command::GetRepos(GetRepos {})).await? {
            Command::GetReposReply(reply) => Ok(reply.repos),
            other => Err(unexpected(CommandKind::GetRepos, &other)),
        }
    }

    pub async fn branches(&self, repo: &str) -> Result<Vec<Branch>> {
        let query = GetBranches {
            repo: repo.to_string(),
        };
        match self.call(Command::GetBranches(query)).await? {
            Command::GetBranchesReply(reply) => Ok(reply.branches),
            other => Err(unexpected(CommandKind::GetBranches, &other)),
        }
    }

    pub async fn new_repository(&self, repo: Repository) -> Result<Repository> {
        match self.call(Command::NewRepo(NewRepo { repo })).await? {
            Command::NewRepoReply(reply) => Ok(reply.repo),
            other => Err(unexpected(CommandKind::NewRepo, &other)),
        }
    }

    /// Create a branch; the server stores it without a snapshot
    pub async fn new_branch(&self, branch: Branch) -> Result<Branch> {
        match self.call(Command::NewBranch(NewBranch { branch })).await? {
            Command::NewBranchReply(reply) => Ok(reply.branch),
            other => Err(unexpected(CommandKind::NewBranch, &other)),
        }
    }

    /// Upload a snapshot as `tick`, which must be the branch's next tick
    pub async fn upload_database(
        &self,
        repo: &str,
        branch: &str,
        tick: i64,
        payload: impl Into<Bytes>,
    ) -> Result<Branch> {
        let query = UploadDb {
            repo: repo.to_string(),
            branch: branch.to_string(),
            tick,
            payload: payload.into(),
        };
        match self.call(Command::UploadDb(query)).await? {
            Command::UploadDbReply(reply) => Ok(reply.branch),
            other => Err(unexpected(CommandKind::UploadDb, &other)),
        }
    }

    /// Latest snapshot of a branch, with the branch at that tick
    pub async fn download_database(&self, repo: &str, branch: &str) -> Result<(Branch, Bytes)> {
        let query = DownloadDb {
            repo: repo.to_string(),
            branch: branch.to_string(),
        };
        match self.call(Command::DownloadDb(query)).await? {
            Command::DownloadDbReply(reply) => Ok((reply.branch, reply.payload)),
            other => Err(unexpected(CommandKind::DownloadDb, &other)),
        }
    }

    /// Join the group of `repo`/`branch`; returns the peers already there
    pub async fn subscribe(
        &self,
        repo: &str,
        branch: &str,
        tick: i64,
        name: &str,
        color: u32,
    ) -> Result<Vec<Peer>> {
        let query = Subscribe {
            repo: repo.to_string(),
            branch: branch.to_string(),
            tick,
            color,
            name: name.to_string(),
        };
        match self.call(Command::Subscribe(query)).await? {
            Command::SubscribeReply(reply) => Ok(reply.peers),
            other => Err(unexpected(CommandKind::Subscribe, &other)),
        }
    }

    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        let query = Unsubscribe {
            name: name.to_string(),
        };
        match self.call(Command::Unsubscribe(query)).await? {
            Command::UnsubscribeReply(_) => Ok(()),
            other => Err(unexpected(CommandKind::Unsubscribe, &other)),
        }
    }

    pub fn update_cursor(&self, name: &str, ea: u64) -> Result<()> {
        self.send_event(Command::UpdateCursors(UpdateCursors {
            ea,
            name: name.to_string(),
        }))
        .map(|_| ())
    }

    pub fn rename_user(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.send_event(Command::RenamedUser(RenamedUser {
            old_name: old_name.to_string(),
            new_name: new_name.to_string(),
        }))
        .map(|_| ())
    }

    pub fn change_color(&self, name: &str, old_color: u32, new_color: u32) -> Result<()> {
        self.send_event(Command::UserColorChanged(UserColorChanged {
            name: name.to_string(),
            old_color,
            new_color,
        }))
        .map(|_| ())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.conn.close();
    }
}

fn unexpected(expected: CommandKind, actual: &Command) -> SyncError {
    SyncError::UnexpectedReply {
        expected: expected.to_string(),
        actual: actual.kind().to_string(),
    }
}
