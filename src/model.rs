//! Catalog records shared by the client and the server
//!
//! These are the structures carried inside command fields. They are plain
//! serde types; the server owns the authoritative copies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tick of a branch that has never received an upload
pub const NO_SNAPSHOT_TICK: i64 = -1;

/// A shared database, keyed by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    /// Hash of the database content the repository was created from
    pub hash: String,
    /// Original file name of the database
    pub file: String,
    /// File type reported by the creating client
    #[serde(rename = "type")]
    pub file_type: String,
    pub date: DateTime<Utc>,
}

impl Repository {
    pub fn new(
        name: impl Into<String>,
        hash: impl Into<String>,
        file: impl Into<String>,
        file_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
            file: file.into(),
            file_type: file_type.into(),
            date: Utc::now(),
        }
    }
}

/// A named line of snapshots within a repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub repo: String,
    pub name: String,
    pub date: DateTime<Utc>,
    pub tick: i64,
}

impl Branch {
    /// A branch with no snapshot yet
    pub fn new(repo: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            name: name.into(),
            date: Utc::now(),
            tick: NO_SNAPSHOT_TICK,
        }
    }

    /// Whether a snapshot can be downloaded from this branch
    pub fn has_snapshot(&self) -> bool {
        self.tick != NO_SNAPSHOT_TICK
    }

    /// The only tick an upload may declare next
    pub fn next_tick(&self) -> i64 {
        self.tick.max(0) + 1
    }
}

/// Public view of a subscribed session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub color: u32,
    /// Last known cursor address, if the peer reported one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<u64>,
}
