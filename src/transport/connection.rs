//! Connection driver
//!
//! One task owns the WebSocket for the whole life of a connection. It writes
//! queued frames, routes replies into the pending table and hands incoming
//! queries to the owner. A `Connection` is the cheap, cloneable handle used
//! to talk to that task.
//!
//! Both queues are bounded. A peer that stops reading, or an owner that
//! stops draining incoming queries, overflows them and the connection is
//! torn down instead of buffering without limit.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Result, SyncError};
use crate::protocol::{
    Command, CommandKind, CorrelationId, FrameLimits, Packet, ReplyError, NOTIFICATION_ID,
};
use crate::transport::pending::{PendingReply, PendingTable};
use crate::transport::BoxedStream;

/// How long a graceful close may wait on the peer
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A query received from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    pub id: CorrelationId,
    pub command: Command,
}

impl Incoming {
    /// Whether the peer waits for an answer to this query
    pub fn expects_reply(&self) -> bool {
        self.id != NOTIFICATION_ID && self.command.kind().has_reply()
    }
}

/// Capacities of the per-connection queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Frames waiting to be written to the peer
    pub outbound: usize,
    /// Queries received but not yet taken by the owner
    pub incoming: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            outbound: 4096,
            incoming: 4096,
        }
    }
}

enum Outbound {
    Packet(Packet),
    Close,
}

struct Shared {
    outbound: mpsc::Sender<Outbound>,
    /// Raised when the outbound queue overflows
    abort: Notify,
    pending: PendingTable,
    next_id: AtomicU64,
    peer_addr: SocketAddr,
}

impl Shared {
    fn overflowed(&self) {
        tracing::warn!("Outbound queue to {} is full, closing", self.peer_addr);
        self.abort.notify_one();
    }
}

/// Handle to a live connection
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.shared.peer_addr)
            .field("pending", &self.shared.pending.len())
            .finish()
    }
}

impl Connection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    fn next_id(&self) -> CorrelationId {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, packet: Packet) -> Result<()> {
        match self.shared.outbound.try_send(Outbound::Packet(packet)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.shared.overflowed();
                Err(SyncError::Disconnected)
            }
            Err(TrySendError::Closed(_)) => Err(SyncError::Disconnected),
        }
    }

    /// Send a query and get a handle to its eventual reply
    pub fn send_query(&self, command: Command) -> Result<PendingReply> {
        let kind = command.kind();
        if command.is_reply() {
            return Err(SyncError::config(format!(
                "cannot send a '{}' reply as a query",
                kind
            )));
        }
        if !kind.has_reply() {
            return Err(SyncError::config(format!(
                "'{}' has no reply; send it as an event",
                kind
            )));
        }

        let id = self.next_id();
        let rx = self.shared.pending.register(id)?;
        if let Err(e) = self.enqueue(Packet::Query { id, command }) {
            self.shared.pending.cancel(id);
            return Err(e);
        }
        tracing::trace!("Sent {} query #{}", kind, id);
        Ok(PendingReply::new(id, kind, rx))
    }

    /// Send a fire-and-forget query under a fresh id
    pub fn send_event(&self, command: Command) -> Result<CorrelationId> {
        if command.is_reply() {
            return Err(SyncError::config(format!(
                "cannot send a '{}' reply as an event",
                command.kind()
            )));
        }
        let id = self.next_id();
        self.enqueue(Packet::Query { id, command })?;
        Ok(id)
    }

    /// Send a notification; the peer never answers it
    pub fn notify(&self, command: Command) -> Result<()> {
        self.enqueue(Packet::Query {
            id: NOTIFICATION_ID,
            command,
        })
    }

    /// Answer query `id`. Notifications are never answered.
    pub fn reply(&self, id: CorrelationId, kind: CommandKind, result: Result<Command>) -> Result<()> {
        if id == NOTIFICATION_ID {
            return Ok(());
        }
        let packet = match result {
            Ok(command) => Packet::Reply { id, command },
            Err(e) => Packet::Error {
                id,
                kind,
                error: ReplyError::from(&e),
            },
        };
        self.enqueue(packet)
    }

    /// Ask the driver to close the socket. Pending queries fail with
    /// `Disconnected` once it has.
    pub fn close(&self) {
        if let Err(TrySendError::Full(_)) = self.shared.outbound.try_send(Outbound::Close) {
            self.shared.abort.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.outbound.is_closed()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }
}

/// Start driving `ws`. Returns the handle, the stream of incoming queries and
/// the driver task; the incoming stream ends when the connection does.
pub fn spawn(
    ws: WebSocketStream<BoxedStream>,
    peer_addr: SocketAddr,
    limits: FrameLimits,
    queues: QueueLimits,
) -> (Connection, mpsc::Receiver<Incoming>, JoinHandle<()>) {
    let (outbound_tx, outbound_rx) = mpsc::channel(queues.outbound.max(1));
    let (incoming_tx, incoming_rx) = mpsc::channel(queues.incoming.max(1));

    let shared = Arc::new(Shared {
        outbound: outbound_tx,
        abort: Notify::new(),
        pending: PendingTable::new(),
        next_id: AtomicU64::new(1),
        peer_addr,
    });

    let driver = Driver {
        ws,
        outbound_rx,
        incoming_tx,
        shared: shared.clone(),
        limits,
    };
    let task = tokio::spawn(driver.run());

    (Connection { shared }, incoming_rx, task)
}

struct Driver {
    ws: WebSocketStream<BoxedStream>,
    outbound_rx: mpsc::Receiver<Outbound>,
    incoming_tx: mpsc::Sender<Incoming>,
    shared: Arc<Shared>,
    limits: FrameLimits,
}

impl Driver {
    async fn run(mut self) {
        let peer = self.shared.peer_addr;
        let shared = Arc::clone(&self.shared);

        loop {
            tokio::select! {
                _ = shared.abort.notified() => break,

                out = self.outbound_rx.recv() => {
                    match out {
                        Some(Outbound::Packet(packet)) => {
                            // A peer that never reads must not pin the task here
                            let written = tokio::select! {
                                written = self.write(packet) => written,
                                _ = shared.abort.notified() => Err(SyncError::Disconnected),
                            };
                            if let Err(e) = written {
                                tracing::warn!("Write to {} failed: {}", peer, e);
                                break;
                            }
                        }
                        Some(Outbound::Close) | None => {
                            let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.ws.close(None)).await;
                            break;
                        }
                    }
                }

                msg = self.ws.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            match Packet::decode(&data, &self.limits) {
                                Ok(packet) => {
                                    if !self.route(packet) {
                                        tracing::warn!(
                                            "Incoming queue from {} is full, closing",
                                            peer
                                        );
                                        break;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!("Dropping {}: {}", peer, e);
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Text(_))) => {
                            tracing::warn!("Dropping {}: unexpected text frame", peer);
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = self.ws.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::debug!("{} closed the connection", peer);
                            break;
                        }
                        Some(Err(e)) => {
                            tracing::debug!("Read from {} failed: {}", peer, e);
                            break;
                        }
                        None => break,
                        _ => {}
                    }
                }
            }
        }

        let failed = self.shared.pending.fail_all();
        if failed > 0 {
            tracing::debug!("Failed {} pending queries to {}", failed, peer);
        }
    }

    async fn write(&mut self, packet: Packet) -> Result<()> {
        match packet.encode() {
            Ok(frame) => self
                .ws
                .send(Message::Binary(frame))
                .await
                .map_err(|e| SyncError::connection_failed(e.to_string())),
            Err(e) => {
                // Only this query is lost; the connection stays up.
                tracing::error!("Cannot encode {} #{}: {}", packet.kind(), packet.id(), e);
                if let Packet::Query { id, .. } = packet {
                    self.shared.pending.resolve(id, Err(e));
                }
                Ok(())
            }
        }
    }

    /// Returns false when the owner has fallen too far behind
    fn route(&mut self, packet: Packet) -> bool {
        match packet {
            Packet::Reply { id, command } => {
                if !self.shared.pending.resolve(id, Ok(command)) {
                    tracing::debug!("Dropping reply to unknown query #{}", id);
                }
            }
            Packet::Error { id, error, .. } => {
                if !self.shared.pending.resolve(id, Err(error.into())) {
                    tracing::debug!("Dropping error for unknown query #{}", id);
                }
            }
            Packet::Query { id, command } => {
                match self.incoming_tx.try_send(Incoming { id, command }) {
                    Err(TrySendError::Full(_)) => return false,
                    // The owner may already be gone; nothing is waiting then.
                    Ok(()) | Err(TrySendError::Closed(_)) => {}
                }
            }
        }
        true
    }
}
