//! Outstanding-request table
//!
//! Maps correlation ids of in-flight queries to the sender that resolves the
//! caller's `PendingReply`. Entries are registered before the query frame is
//! queued, so a fast reply can never arrive ahead of its entry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, SyncError};
use crate::protocol::{Command, CommandKind, CorrelationId};

pub type ReplyResult = Result<Command>;

#[derive(Default)]
struct PendingState {
    entries: HashMap<CorrelationId, oneshot::Sender<ReplyResult>>,
    closed: bool,
}

/// Table of queries awaiting their reply
#[derive(Default)]
pub struct PendingTable {
    state: Mutex<PendingState>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id`; fails with `Disconnected` once the table is closed
    pub fn register(&self, id: CorrelationId) -> Result<oneshot::Receiver<ReplyResult>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SyncError::Disconnected);
        }
        let (tx, rx) = oneshot::channel();
        state.entries.insert(id, tx);
        Ok(rx)
    }

    /// Resolve `id`. Returns false when nothing was waiting for it.
    pub fn resolve(&self, id: CorrelationId, result: ReplyResult) -> bool {
        let sender = self.state.lock().entries.remove(&id);
        match sender {
            Some(tx) => {
                // The caller may have dropped its handle; that is not an error.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Forget `id` without resolving it
    pub fn cancel(&self, id: CorrelationId) {
        self.state.lock().entries.remove(&id);
    }

    /// Close the table and fail every entry with `Disconnected`
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.entries.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(SyncError::Disconnected));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Handle to the eventual reply of a query
///
/// Resolves exactly once: with the reply command, with the error the peer
/// returned, or with `Disconnected` when the connection goes away first.
#[derive(Debug)]
pub struct PendingReply {
    id: CorrelationId,
    kind: CommandKind,
    rx: oneshot::Receiver<ReplyResult>,
}

impl PendingReply {
    pub(crate) fn new(
        id: CorrelationId,
        kind: CommandKind,
        rx: oneshot::Receiver<ReplyResult>,
    ) -> Self {
        Self { id, kind, rx }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }
}

impl Future for PendingReply {
    type Output = ReplyResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let expected = self.kind;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(Ok(command))) if command.kind() != expected || !command.is_reply() => {
                Poll::Ready(Err(SyncError::UnexpectedReply {
                    expected: expected.to_string(),
                    actual: command.kind().to_string(),
                }))
            }
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SyncError::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}
