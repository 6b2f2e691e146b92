//! Wire protocol
//!
//! `command` holds the closed command registry and the field codec;
//! `frame` turns commands into self-delimiting frames and back.

pub mod command;
pub mod frame;

pub use command::{
    Command, CommandKind, DownloadDb, DownloadDbReply, Fields, GetBranches, GetBranchesReply,
    GetRepos, GetReposReply, NewBranch, NewBranchReply, NewRepo, NewRepoReply, RenamedUser,
    ReplyError, Subscribe, SubscribeReply, Unsubscribe, UnsubscribeReply, UpdateCursors,
    UploadDb, UploadDbReply, UserColorChanged,
};
pub use frame::{CorrelationId, FrameLimits, Packet, NOTIFICATION_ID};
