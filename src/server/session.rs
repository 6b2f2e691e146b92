//! Server-side session
//!
//! One session per accepted connection. It dispatches the client's queries
//! against the catalog and forwards events of the subscription group it has
//! joined.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};

use crate::error::{Result, SyncError};
use crate::model::Peer;
use crate::protocol::{
    Command, DownloadDbReply, GetBranchesReply, GetReposReply, NewBranchReply, NewRepoReply,
    Subscribe, SubscribeReply, UnsubscribeReply, UploadDbReply,
};
use crate::server::catalog::{BranchEntry, Catalog, GroupEvent, SessionId};
use crate::transport::{Connection, Incoming};

/// The group a session has joined
struct Subscription {
    repo: String,
    branch: String,
    entry: Arc<BranchEntry>,
    events: broadcast::Receiver<GroupEvent>,
}

pub struct Session {
    id: SessionId,
    conn: Connection,
    incoming: mpsc::Receiver<Incoming>,
    catalog: Arc<Catalog>,
    subscription: Option<Subscription>,
}

impl Session {
    pub fn new(
        id: SessionId,
        conn: Connection,
        incoming: mpsc::Receiver<Incoming>,
        catalog: Arc<Catalog>,
    ) -> Self {
        Self {
            id,
            conn,
            incoming,
            catalog,
            subscription: None,
        }
    }

    /// Serve until the connection ends or the server shuts down
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                incoming = self.incoming.recv() => {
                    match incoming {
                        Some(incoming) => self.dispatch(incoming),
                        None => break,
                    }
                }

                event = next_event(&mut self.subscription) => {
                    if !self.on_group_event(event) {
                        break;
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("Session {} stopping for shutdown", self.id);
                        break;
                    }
                }
            }
        }

        // Disconnect counts as leaving the group
        self.leave_group();
    }

    fn dispatch(&mut self, incoming: Incoming) {
        let Incoming { id, command } = incoming;
        let kind = command.kind();

        if kind.is_event() {
            self.relay(command);
            return;
        }

        let result = self.handle(command);
        if let Err(e) = &result {
            if e.is_business_rule() {
                tracing::debug!("Session {}: {} #{} refused: {}", self.id, kind, id, e);
            } else {
                tracing::warn!("Session {}: {} #{} failed: {}", self.id, kind, id, e);
            }
        }
        if self.conn.reply(id, kind, result).is_err() {
            tracing::debug!("Session {}: reply to #{} dropped, connection closed", self.id, id);
        }
    }

    fn handle(&mut self, command: Command) -> Result<Command> {
        match command {
            Command::GetRepos(_) => Ok(Command::GetReposReply(GetReposReply {
                repos: self.catalog.repositories(),
            })),
            Command::GetBranches(query) => Ok(Command::GetBranchesReply(GetBranchesReply {
                branches: self.catalog.branches(&query.repo),
            })),
            Command::NewRepo(query) => {
                let repo = self.catalog.insert_repository(query.repo)?;
                Ok(Command::NewRepoReply(NewRepoReply { repo }))
            }
            Command::NewBranch(query) => {
                let branch = self.catalog.insert_branch(query.branch)?;
                Ok(Command::NewBranchReply(NewBranchReply { branch }))
            }
            Command::UploadDb(query) => {
                let branch =
                    self.catalog
                        .upload(&query.repo, &query.branch, query.tick, query.payload)?;
                Ok(Command::UploadDbReply(UploadDbReply { branch }))
            }
            Command::DownloadDb(query) => {
                let (branch, payload) = self.catalog.download(&query.repo, &query.branch)?;
                Ok(Command::DownloadDbReply(DownloadDbReply { branch, payload }))
            }
            Command::Subscribe(query) => self.subscribe(query),
            Command::Unsubscribe(_) => {
                self.leave_group();
                Ok(Command::UnsubscribeReply(UnsubscribeReply {}))
            }
            other => Err(SyncError::Rejected {
                message: format!("'{}' is not a query the server handles", other.kind()),
            }),
        }
    }

    fn subscribe(&mut self, query: Subscribe) -> Result<Command> {
        let entry = self.catalog.branch(&query.repo, &query.branch)?;
        self.leave_group();

        let peer = Peer {
            name: query.name.clone(),
            color: query.color,
            cursor: None,
        };
        let repo = query.repo.clone();
        let branch = query.branch.clone();
        let (peers, events) = entry.join(self.id, peer, Command::Subscribe(query));
        tracing::info!(
            "Session {} joined {}/{} ({} other peers)",
            self.id,
            repo,
            branch,
            peers.len()
        );

        self.subscription = Some(Subscription {
            repo,
            branch,
            entry,
            events,
        });
        Ok(Command::SubscribeReply(SubscribeReply { peers }))
    }

    fn leave_group(&mut self) {
        if let Some(sub) = self.subscription.take() {
            if sub.entry.leave(self.id).is_some() {
                tracing::info!("Session {} left {}/{}", self.id, sub.repo, sub.branch);
            }
        }
    }

    fn relay(&mut self, command: Command) {
        match &self.subscription {
            Some(sub) => {
                sub.entry.relay(self.id, command);
            }
            None => {
                tracing::debug!(
                    "Session {}: dropping {} while not subscribed",
                    self.id,
                    command.kind()
                );
            }
        }
    }

    /// Forward one group event. Returns false when the session must end.
    ///
    /// A session that lagged has lost events its client can never recover,
    /// so its connection is closed and the client has to subscribe again.
    fn on_group_event(
        &mut self,
        event: std::result::Result<GroupEvent, broadcast::error::RecvError>,
    ) -> bool {
        match event {
            Ok(event) if event.origin == self.id => true,
            Ok(event) => {
                if self.conn.notify(event.command).is_err() {
                    tracing::debug!("Session {}: event dropped, connection closed", self.id);
                    return false;
                }
                true
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(
                    "Session {} lagged, skipped {} group events; closing",
                    self.id,
                    skipped
                );
                self.conn.close();
                false
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.subscription = None;
                true
            }
        }
    }
}

async fn next_event(
    subscription: &mut Option<Subscription>,
) -> std::result::Result<GroupEvent, broadcast::error::RecvError> {
    match subscription {
        Some(sub) => sub.events.recv().await,
        None => std::future::pending().await,
    }
}
