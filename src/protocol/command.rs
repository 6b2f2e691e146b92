//! Command registry and field codec
//!
//! Every command kind has a wire identifier, a query side and (for most
//! kinds) a reply side. `build` turns a typed command into a JSON object
//! plus an optional detached payload; `parse` is the inverse.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::model::{Branch, Peer, Repository};

/// Structured fields of a command as they appear in a frame header
pub type Fields = serde_json::Map<String, Value>;

/// The closed set of command kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    GetRepos,
    GetBranches,
    NewRepo,
    NewBranch,
    UploadDb,
    DownloadDb,
    Subscribe,
    Unsubscribe,
    UpdateCursors,
    RenamedUser,
    UserColorChanged,
}

impl CommandKind {
    pub const ALL: [CommandKind; 11] = [
        Self::GetRepos,
        Self::GetBranches,
        Self::NewRepo,
        Self::NewBranch,
        Self::UploadDb,
        Self::DownloadDb,
        Self::Subscribe,
        Self::Unsubscribe,
        Self::UpdateCursors,
        Self::RenamedUser,
        Self::UserColorChanged,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::GetRepos => "get_repos",
            Self::GetBranches => "get_branches",
            Self::NewRepo => "new_repo",
            Self::NewBranch => "new_branch",
            Self::UploadDb => "upload_db",
            Self::DownloadDb => "download_db",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::UpdateCursors => "update_cursors",
            Self::RenamedUser => "renamed_user",
            Self::UserColorChanged => "user_color_changed",
        }
    }

    /// Look up a kind by its wire identifier
    pub fn from_wire(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.wire_name() == name)
            .ok_or_else(|| SyncError::UnknownCommand {
                kind: name.to_string(),
            })
    }

    /// Whether a query of this kind is answered by a reply
    pub fn has_reply(self) -> bool {
        !self.is_event()
    }

    /// Fire-and-forget events relayed to the rest of a subscription group
    pub fn is_event(self) -> bool {
        matches!(
            self,
            Self::UpdateCursors | Self::RenamedUser | Self::UserColorChanged
        )
    }

    pub fn query_is_container(self) -> bool {
        self == Self::UploadDb
    }

    pub fn reply_is_container(self) -> bool {
        self == Self::DownloadDb
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

// ============================================================================
// Command bodies
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRepos {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReposReply {
    pub repos: Vec<Repository>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBranches {
    pub repo: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBranchesReply {
    pub branches: Vec<Branch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRepo {
    pub repo: Repository,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRepoReply {
    pub repo: Repository,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBranch {
    pub branch: Branch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBranchReply {
    pub branch: Branch,
}

/// Container query: the database snapshot travels as the frame payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadDb {
    pub repo: String,
    pub branch: String,
    pub tick: i64,
    #[serde(skip)]
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadDbReply {
    pub branch: Branch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDb {
    pub repo: String,
    pub branch: String,
}

/// Container reply carrying the stored snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDbReply {
    pub branch: Branch,
    #[serde(skip)]
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscribe {
    pub repo: String,
    pub branch: String,
    pub tick: i64,
    pub color: u32,
    pub name: String,
}

/// Peers already in the group when the subscription was accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeReply {
    pub peers: Vec<Peer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsubscribe {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeReply {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCursors {
    pub ea: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamedUser {
    pub old_name: String,
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserColorChanged {
    pub name: String,
    pub old_color: u32,
    pub new_color: u32,
}

/// A typed command, query side or reply side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetRepos(GetRepos),
    GetReposReply(GetReposReply),
    GetBranches(GetBranches),
    GetBranchesReply(GetBranchesReply),
    NewRepo(NewRepo),
    NewRepoReply(NewRepoReply),
    NewBranch(NewBranch),
    NewBranchReply(NewBranchReply),
    UploadDb(UploadDb),
    UploadDbReply(UploadDbReply),
    DownloadDb(DownloadDb),
    DownloadDbReply(DownloadDbReply),
    Subscribe(Subscribe),
    SubscribeReply(SubscribeReply),
    Unsubscribe(Unsubscribe),
    UnsubscribeReply(UnsubscribeReply),
    UpdateCursors(UpdateCursors),
    RenamedUser(RenamedUser),
    UserColorChanged(UserColorChanged),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::GetRepos(_) | Self::GetReposReply(_) => CommandKind::GetRepos,
            Self::GetBranches(_) | Self::GetBranchesReply(_) => CommandKind::GetBranches,
            Self::NewRepo(_) | Self::NewRepoReply(_) => CommandKind::NewRepo,
            Self::NewBranch(_) | Self::NewBranchReply(_) => CommandKind::NewBranch,
            Self::UploadDb(_) | Self::UploadDbReply(_) => CommandKind::UploadDb,
            Self::DownloadDb(_) | Self::DownloadDbReply(_) => CommandKind::DownloadDb,
            Self::Subscribe(_) | Self::SubscribeReply(_) => CommandKind::Subscribe,
            Self::Unsubscribe(_) | Self::UnsubscribeReply(_) => CommandKind::Unsubscribe,
            Self::UpdateCursors(_) => CommandKind::UpdateCursors,
            Self::RenamedUser(_) => CommandKind::RenamedUser,
            Self::UserColorChanged(_) => CommandKind::UserColorChanged,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Self::GetReposReply(_)
                | Self::GetBranchesReply(_)
                | Self::NewRepoReply(_)
                | Self::NewBranchReply(_)
                | Self::UploadDbReply(_)
                | Self::DownloadDbReply(_)
                | Self::SubscribeReply(_)
                | Self::UnsubscribeReply(_)
        )
    }

    /// The opaque payload of a container command
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Self::UploadDb(query) => Some(&query.payload),
            Self::DownloadDbReply(reply) => Some(&reply.payload),
            _ => None,
        }
    }

    /// Serialize the structured fields and detach the payload, if any
    pub fn build(&self) -> Result<(Fields, Option<Bytes>)> {
        let fields = match self {
            Self::GetRepos(c) => to_fields(c)?,
            Self::GetReposReply(c) => to_fields(c)?,
            Self::GetBranches(c) => to_fields(c)?,
            Self::GetBranchesReply(c) => to_fields(c)?,
            Self::NewRepo(c) => to_fields(c)?,
            Self::NewRepoReply(c) => to_fields(c)?,
            Self::NewBranch(c) => to_fields(c)?,
            Self::NewBranchReply(c) => to_fields(c)?,
            Self::UploadDb(c) => to_fields(c)?,
            Self::UploadDbReply(c) => to_fields(c)?,
            Self::DownloadDb(c) => to_fields(c)?,
            Self::DownloadDbReply(c) => to_fields(c)?,
            Self::Subscribe(c) => to_fields(c)?,
            Self::SubscribeReply(c) => to_fields(c)?,
            Self::Unsubscribe(c) => to_fields(c)?,
            Self::UnsubscribeReply(c) => to_fields(c)?,
            Self::UpdateCursors(c) => to_fields(c)?,
            Self::RenamedUser(c) => to_fields(c)?,
            Self::UserColorChanged(c) => to_fields(c)?,
        };
        Ok((fields, self.payload().cloned()))
    }

    /// Populate a typed command from its fields and payload
    pub fn parse(
        kind: CommandKind,
        is_reply: bool,
        fields: Fields,
        payload: Option<Bytes>,
    ) -> Result<Self> {
        let payload = payload.unwrap_or_default();
        let command = match (kind, is_reply) {
            (CommandKind::GetRepos, false) => Self::GetRepos(from_fields(kind, fields)?),
            (CommandKind::GetRepos, true) => Self::GetReposReply(from_fields(kind, fields)?),
            (CommandKind::GetBranches, false) => Self::GetBranches(from_fields(kind, fields)?),
            (CommandKind::GetBranches, true) => {
                Self::GetBranchesReply(from_fields(kind, fields)?)
            }
            (CommandKind::NewRepo, false) => Self::NewRepo(from_fields(kind, fields)?),
            (CommandKind::NewRepo, true) => Self::NewRepoReply(from_fields(kind, fields)?),
            (CommandKind::NewBranch, false) => Self::NewBranch(from_fields(kind, fields)?),
            (CommandKind::NewBranch, true) => Self::NewBranchReply(from_fields(kind, fields)?),
            (CommandKind::UploadDb, false) => {
                let mut query: UploadDb = from_fields(kind, fields)?;
                query.payload = payload;
                Self::UploadDb(query)
            }
            (CommandKind::UploadDb, true) => Self::UploadDbReply(from_fields(kind, fields)?),
            (CommandKind::DownloadDb, false) => Self::DownloadDb(from_fields(kind, fields)?),
            (CommandKind::DownloadDb, true) => {
                let mut reply: DownloadDbReply = from_fields(kind, fields)?;
                reply.payload = payload;
                Self::DownloadDbReply(reply)
            }
            (CommandKind::Subscribe, false) => Self::Subscribe(from_fields(kind, fields)?),
            (CommandKind::Subscribe, true) => Self::SubscribeReply(from_fields(kind, fields)?),
            (CommandKind::Unsubscribe, false) => Self::Unsubscribe(from_fields(kind, fields)?),
            (CommandKind::Unsubscribe, true) => {
                Self::UnsubscribeReply(from_fields(kind, fields)?)
            }
            (CommandKind::UpdateCursors, false) => {
                Self::UpdateCursors(from_fields(kind, fields)?)
            }
            (CommandKind::RenamedUser, false) => Self::RenamedUser(from_fields(kind, fields)?),
            (CommandKind::UserColorChanged, false) => {
                Self::UserColorChanged(from_fields(kind, fields)?)
            }
            (kind, true) => {
                return Err(SyncError::malformed(format!(
                    "'{}' has no reply side",
                    kind
                )))
            }
        };
        Ok(command)
    }
}

/// Error carried by a reply whose error flag is set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ReplyError {
    DuplicateName { name: String },
    UnknownRepository { repo: String },
    UnknownBranch { repo: String, branch: String },
    StaleTick { current: i64, attempted: i64 },
    NoSnapshot { repo: String, branch: String },
    Rejected { message: String },
}

impl ReplyError {
    pub fn to_fields(&self) -> Result<Fields> {
        to_fields(self)
    }

    pub fn from_fields(kind: CommandKind, fields: Fields) -> Result<Self> {
        from_fields(kind, fields)
    }
}

impl From<&SyncError> for ReplyError {
    fn from(err: &SyncError) -> Self {
        match err {
            SyncError::DuplicateName { name } => Self::DuplicateName { name: name.clone() },
            SyncError::UnknownRepository { repo } => Self::UnknownRepository { repo: repo.clone() },
            SyncError::UnknownBranch { repo, branch } => Self::UnknownBranch {
                repo: repo.clone(),
                branch: branch.clone(),
            },
            SyncError::StaleTick { current, attempted } => Self::StaleTick {
                current: *current,
                attempted: *attempted,
            },
            SyncError::NoSnapshot { repo, branch } => Self::NoSnapshot {
                repo: repo.clone(),
                branch: branch.clone(),
            },
            SyncError::Rejected { message } => Self::Rejected {
                message: message.clone(),
            },
            other => Self::Rejected {
                message: other.to_string(),
            },
        }
    }
}

impl From<ReplyError> for SyncError {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::DuplicateName { name } => Self::DuplicateName { name },
            ReplyError::UnknownRepository { repo } => Self::UnknownRepository { repo },
            ReplyError::UnknownBranch { repo, branch } => Self::UnknownBranch { repo, branch },
            ReplyError::StaleTick { current, attempted } => Self::StaleTick { current, attempted },
            ReplyError::NoSnapshot { repo, branch } => Self::NoSnapshot { repo, branch },
            ReplyError::Rejected { message } => Self::Rejected { message },
        }
    }
}

fn to_fields<T: Serialize>(body: &T) -> Result<Fields> {
    match serde_json::to_value(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(SyncError::malformed(format!(
            "command fields must be an object, got {}",
            other
        ))),
        Err(e) => Err(SyncError::malformed(format!("failed to build fields: {}", e))),
    }
}

fn from_fields<T: DeserializeOwned>(kind: CommandKind, fields: Fields) -> Result<T> {
    serde_json::from_value(Value::Object(fields))
        .map_err(|e| SyncError::malformed(format!("invalid fields for '{}': {}", kind, e)))
}
