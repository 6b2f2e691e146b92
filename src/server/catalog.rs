//! Repository catalog
//!
//! Holds every repository, its branches, the latest snapshot per branch and
//! the subscription group of each branch. Many sessions share one catalog.
//!
//! Locking is layered so that different branches never contend:
//! the repository map and each repository's branch map are `RwLock`s held
//! only for lookup and insert; everything about one branch sits behind that
//! branch's own `Mutex`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::error::{Result, SyncError};
use crate::model::{Branch, Peer, Repository, NO_SNAPSHOT_TICK};
use crate::protocol::{Command, Unsubscribe};

/// Identifies one server-side session
pub type SessionId = u64;

/// Command relayed to a subscription group
#[derive(Debug, Clone)]
pub struct GroupEvent {
    /// Session that caused the event; it does not receive it back
    pub origin: SessionId,
    pub command: Command,
}

struct BranchState {
    branch: Branch,
    snapshot: Option<Bytes>,
    members: HashMap<SessionId, Peer>,
}

/// One branch: metadata, latest snapshot and subscription group
pub struct BranchEntry {
    state: Mutex<BranchState>,
    events: broadcast::Sender<GroupEvent>,
}

impl BranchEntry {
    fn new(branch: Branch, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            state: Mutex::new(BranchState {
                branch,
                snapshot: None,
                members: HashMap::new(),
            }),
            events,
        }
    }

    pub fn branch(&self) -> Branch {
        self.state.lock().branch.clone()
    }

    /// Store `payload` if `tick` is the next one; returns the updated branch
    pub fn upload(&self, tick: i64, payload: Bytes) -> Result<Branch> {
        let mut state = self.state.lock();
        let expected = state.branch.next_tick();
        if tick != expected {
            return Err(SyncError::StaleTick {
                current: state.branch.tick,
                attempted: tick,
            });
        }
        state.branch.tick = tick;
        state.snapshot = Some(payload);
        Ok(state.branch.clone())
    }

    /// Latest snapshot and the branch it belongs to
    pub fn download(&self) -> Result<(Branch, Bytes)> {
        let state = self.state.lock();
        match &state.snapshot {
            Some(payload) if state.branch.has_snapshot() => {
                Ok((state.branch.clone(), payload.clone()))
            }
            _ => Err(SyncError::NoSnapshot {
                repo: state.branch.repo.clone(),
                branch: state.branch.name.clone(),
            }),
        }
    }

    /// Add `session` to the group. Returns the peers that were already there
    /// and a receiver for the group's events. `notice` goes to those peers.
    pub fn join(
        &self,
        session: SessionId,
        peer: Peer,
        notice: Command,
    ) -> (Vec<Peer>, broadcast::Receiver<GroupEvent>) {
        let mut state = self.state.lock();
        let peers = state
            .members
            .iter()
            .filter(|(id, _)| **id != session)
            .map(|(_, peer)| peer.clone())
            .collect();
        state.members.insert(session, peer);
        let receiver = self.events.subscribe();
        self.send(session, notice);
        (peers, receiver)
    }

    /// Remove `session` from the group and tell the others it left
    pub fn leave(&self, session: SessionId) -> Option<Peer> {
        let mut state = self.state.lock();
        let peer = state.members.remove(&session)?;
        self.send(
            session,
            Command::Unsubscribe(Unsubscribe {
                name: peer.name.clone(),
            }),
        );
        Some(peer)
    }

    /// Record what a user-state event says about its sender, then relay it
    pub fn relay(&self, session: SessionId, command: Command) -> bool {
        let mut state = self.state.lock();
        let Some(peer) = state.members.get_mut(&session) else {
            return false;
        };
        match &command {
            Command::UpdateCursors(event) => peer.cursor = Some(event.ea),
            Command::RenamedUser(event) => peer.name = event.new_name.clone(),
            Command::UserColorChanged(event) => peer.color = event.new_color,
            _ => {}
        }
        self.send(session, command);
        true
    }

    pub fn members(&self) -> Vec<Peer> {
        self.state.lock().members.values().cloned().collect()
    }

    // Called with the state lock held so relay order matches update order.
    fn send(&self, origin: SessionId, command: Command) {
        // No receivers is fine: nobody else is subscribed.
        let _ = self.events.send(GroupEvent { origin, command });
    }
}

struct RepoEntry {
    repo: Repository,
    branches: RwLock<BTreeMap<String, Arc<BranchEntry>>>,
}

/// Counts reported by `Catalog::stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub repositories: usize,
    pub branches: usize,
}

/// All repositories known to the server
pub struct Catalog {
    repos: RwLock<BTreeMap<String, Arc<RepoEntry>>>,
    event_capacity: usize,
}

impl Catalog {
    pub fn new(event_capacity: usize) -> Self {
        Self {
            repos: RwLock::new(BTreeMap::new()),
            event_capacity: event_capacity.max(1),
        }
    }

    fn repo(&self, name: &str) -> Option<Arc<RepoEntry>> {
        self.repos.read().get(name).cloned()
    }

    pub fn repositories(&self) -> Vec<Repository> {
        self.repos
            .read()
            .values()
            .map(|entry| entry.repo.clone())
            .collect()
    }

    /// Branches of `repo`; empty when the repository does not exist
    pub fn branches(&self, repo: &str) -> Vec<Branch> {
        let Some(entry) = self.repo(repo) else {
            return Vec::new();
        };
        let branches: Vec<Arc<BranchEntry>> = entry.branches.read().values().cloned().collect();
        branches.iter().map(|b| b.branch()).collect()
    }

    pub fn insert_repository(&self, repo: Repository) -> Result<Repository> {
        let mut repos = self.repos.write();
        if repos.contains_key(&repo.name) {
            return Err(SyncError::DuplicateName { name: repo.name });
        }
        tracing::info!("New repository '{}'", repo.name);
        repos.insert(
            repo.name.clone(),
            Arc::new(RepoEntry {
                repo: repo.clone(),
                branches: RwLock::new(BTreeMap::new()),
            }),
        );
        Ok(repo)
    }

    /// Insert a branch. Whatever tick the caller sent, it starts without a
    /// snapshot.
    pub fn insert_branch(&self, mut branch: Branch) -> Result<Branch> {
        let entry = self.repo(&branch.repo).ok_or_else(|| SyncError::UnknownRepository {
            repo: branch.repo.clone(),
        })?;
        branch.tick = NO_SNAPSHOT_TICK;

        let mut branches = entry.branches.write();
        if branches.contains_key(&branch.name) {
            return Err(SyncError::DuplicateName { name: branch.name });
        }
        tracing::info!("New branch '{}' in '{}'", branch.name, branch.repo);
        branches.insert(
            branch.name.clone(),
            Arc::new(BranchEntry::new(branch.clone(), self.event_capacity)),
        );
        Ok(branch)
    }

    pub fn branch(&self, repo: &str, branch: &str) -> Result<Arc<BranchEntry>> {
        self.repo(repo)
            .and_then(|entry| entry.branches.read().get(branch).cloned())
            .ok_or_else(|| SyncError::UnknownBranch {
                repo: repo.to_string(),
                branch: branch.to_string(),
            })
    }

    pub fn upload(&self, repo: &str, branch: &str, tick: i64, payload: Bytes) -> Result<Branch> {
        let stored = self.branch(repo, branch)?.upload(tick, payload)?;
        tracing::debug!("Snapshot {}/{} now at tick {}", repo, branch, stored.tick);
        Ok(stored)
    }

    pub fn download(&self, repo: &str, branch: &str) -> Result<(Branch, Bytes)> {
        self.branch(repo, branch)?.download()
    }

    pub fn stats(&self) -> CatalogStats {
        let repos = self.repos.read();
        CatalogStats {
            repositories: repos.len(),
            branches: repos.values().map(|entry| entry.branches.read().len()).sum(),
        }
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(1024)
    }
}
