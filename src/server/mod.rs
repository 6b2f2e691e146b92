//! Sync server
//!
//! A single process, many clients, one shared catalog.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        collab-sync-server                           │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  ┌───────────────────────────────────────────────────────────────┐  │
//! │  │                  Catalog (Arc<RwLock<..>>)                    │  │
//! │  │                                                               │  │
//! │  │  repo_1 ──► branches { main ──► BranchEntry {                 │  │
//! │  │                          tick, snapshot, members, event_tx    │  │
//! │  │                        } }                                    │  │
//! │  │  repo_2 ──► ...                                               │  │
//! │  └───────────────────────────────────────────────────────────────┘  │
//! │                                                                     │
//! │  Accept loop ──► TLS + auth ──► WebSocket ──► Session per client    │
//! │    - query dispatch against the catalog                             │
//! │    - subscription group events                                      │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Business-rule failures are answered with an error reply and the
//! connection stays open. Transport failures end only the one session.

pub mod catalog;
pub mod session;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::auth::{server_provider, AuthConfig};
use crate::config::ServerConfig;
use crate::error::{Result, SyncError};
use crate::transport::{self, negotiate};

pub use catalog::{BranchEntry, Catalog, CatalogStats, GroupEvent, SessionId};
pub use session::Session;

/// Counts reported by a running server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub repositories: usize,
    pub branches: usize,
    pub sessions: usize,
}

struct Shared {
    config: ServerConfig,
    acceptor: Option<TlsAcceptor>,
    catalog: Arc<Catalog>,
    sessions: AtomicUsize,
    next_session: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn stats(&self) -> ServerStats {
        let catalog = self.catalog.stats();
        ServerStats {
            repositories: catalog.repositories,
            branches: catalog.branches,
            sessions: self.sessions.load(Ordering::Relaxed),
        }
    }
}

/// A bound, not yet running server
pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    /// Validate `config`, load TLS material and bind the listener
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let acceptor = config.tls.acceptor()?;
        // Fail on an unknown provider key now rather than per connection
        server_provider(&config.auth_provider)?;

        let listener = TcpListener::bind(config.bind_addr()).await.map_err(|e| {
            SyncError::connection_failed(format!("cannot listen on {}: {}", config.bind_addr(), e))
        })?;

        let (shutdown, _) = watch::channel(false);
        let catalog = Arc::new(Catalog::new(config.event_capacity));
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                config,
                acceptor,
                catalog,
                sessions: AtomicUsize::new(0),
                next_session: AtomicU64::new(1),
                shutdown,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.stats()
    }

    /// Accept connections forever
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Accept connections until `shutdown` completes, then stop every session
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let scheme = if self.shared.acceptor.is_some() { "wss" } else { "ws" };
        tracing::info!("Listening on {}://{}", scheme, self.local_addr()?);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            tracing::info!("Accepted connection from {}", addr);
                            let shared = Arc::clone(&self.shared);
                            tokio::spawn(async move {
                                handle_connection(stream, shared).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        tracing::info!("Shutting down");
        self.shared.shutdown.send_replace(true);
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) {
    let config = &shared.config;
    let mut provider = match server_provider(&config.auth_provider) {
        Ok(provider) => provider,
        Err(e) => {
            tracing::error!("{}", e);
            return;
        }
    };
    let auth = AuthConfig {
        client_cert_required: config.tls.requires_client_cert(),
    };
    if let Err(e) = provider.load(&auth) {
        tracing::error!("Cannot load auth provider: {}", e);
        return;
    }

    let limits = config.frame_limits();
    let opened = match negotiate::open_server(
        stream,
        shared.acceptor.as_ref(),
        &config.keep_alive,
        provider.as_ref(),
        &limits,
    )
    .await
    {
        Ok(opened) => opened,
        Err(e) => {
            tracing::warn!("Connection refused: {}", e);
            return;
        }
    };
    let socket = opened.socket;

    let (conn, incoming, driver) =
        transport::spawn(opened.ws, socket.peer_addr, limits, config.queue_limits());
    let id = shared.next_session.fetch_add(1, Ordering::Relaxed);
    shared.sessions.fetch_add(1, Ordering::Relaxed);
    tracing::debug!("Session {} started for {}", id, socket.peer_addr);

    let session = Session::new(id, conn.clone(), incoming, Arc::clone(&shared.catalog));
    session.run(shared.shutdown.subscribe()).await;

    if let Err(e) = provider.on_connection_closing(&socket) {
        tracing::debug!("Auth closing hook failed: {}", e);
    }
    conn.close();
    let _ = driver.await;
    if let Err(e) = provider.on_socket_closed(&socket) {
        tracing::debug!("Auth socket-closed hook failed: {}", e);
    }

    shared.sessions.fetch_sub(1, Ordering::Relaxed);
    tracing::info!("Connection closed from {}", socket.peer_addr);
}

/// Handle to a server running on its own task
pub struct ServerHandle {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.stats()
    }

    /// Stop accepting, close every session and wait for the accept loop
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.stop.send(());
        self.task
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
    }
}

/// Bind and run a server in the background, e.g. inside another process
pub async fn spawn(config: ServerConfig) -> Result<ServerHandle> {
    let server = Server::bind(config).await?;
    let local_addr = server.local_addr()?;
    let shared = Arc::clone(&server.shared);

    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async move {
        let _ = stopped.await;
    }));

    Ok(ServerHandle {
        local_addr,
        shared,
        stop,
        task,
    })
}
