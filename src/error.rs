//! Error types and exit codes for collab-sync

use std::process::ExitCode;
use thiserror::Error;

/// Main error type for collab-sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Auth provider '{provider}' rejected the connection during {stage}")]
    AuthRejected { provider: String, stage: String },

    #[error("Unknown command: {kind}")]
    UnknownCommand { kind: String },

    #[error("Malformed frame: {message}")]
    MalformedFrame { message: String },

    #[error("Name already exists: {name}")]
    DuplicateName { name: String },

    #[error("Unknown repository: {repo}")]
    UnknownRepository { repo: String },

    #[error("Unknown branch: {repo}/{branch}")]
    UnknownBranch { repo: String, branch: String },

    #[error("Stale tick: branch is at {current}, upload declared {attempted}")]
    StaleTick { current: i64, attempted: i64 },

    #[error("No snapshot uploaded yet for {repo}/{branch}")]
    NoSnapshot { repo: String, branch: String },

    #[error("Peer rejected the query: {message}")]
    Rejected { message: String },

    #[error("Unexpected reply: expected {expected}, got {actual}")]
    UnexpectedReply { expected: String, actual: String },

    #[error("Disconnected")]
    Disconnected,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedFrame {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Business-rule failures travel back to the peer as error replies and
    /// leave the connection open. Everything else is local or fatal.
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            Self::DuplicateName { .. }
                | Self::UnknownRepository { .. }
                | Self::UnknownBranch { .. }
                | Self::StaleTick { .. }
                | Self::NoSnapshot { .. }
                | Self::Rejected { .. }
        )
    }

    /// Convert error to an exit code for the server binary:
    /// - 1: IO error
    /// - 2: Configuration error
    /// - 3: Connection / TLS / auth failure
    /// - 4: Protocol violation
    /// - 5: Business-rule rejection
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Io(_) => ExitCode::from(1),
            Self::Config { .. } => ExitCode::from(2),
            Self::ConnectionFailed { .. } | Self::AuthRejected { .. } | Self::Disconnected => {
                ExitCode::from(3)
            }
            Self::UnknownCommand { .. }
            | Self::MalformedFrame { .. }
            | Self::UnexpectedReply { .. } => ExitCode::from(4),
            Self::DuplicateName { .. }
            | Self::UnknownRepository { .. }
            | Self::UnknownBranch { .. }
            | Self::StaleTick { .. }
            | Self::NoSnapshot { .. }
            | Self::Rejected { .. } => ExitCode::from(5),
        }
    }
}

/// Result type alias for collab-sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
