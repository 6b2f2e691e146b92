//! Frame layout on the wire
//!
//! Each frame travels as one binary WebSocket message:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┬──────────────────────┐
//! │ u32 (BE)     │ header JSON                  │ payload (size bytes) │
//! │ header len   │ {kind,id,reply,error,fields, │ container commands   │
//! │              │  size}                       │ only                 │
//! └──────────────┴──────────────────────────────┴──────────────────────┘
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::protocol::command::{Command, CommandKind, Fields, ReplyError};

/// Correlation id of a frame. `0` marks a notification that is never answered.
pub type CorrelationId = u64;

pub const NOTIFICATION_ID: CorrelationId = 0;

const LENGTH_PREFIX: usize = 4;

/// Upper bounds applied while decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_header: usize,
    pub max_payload: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_header: 16 * 1024 * 1024,
            max_payload: 1024 * 1024 * 1024,
        }
    }
}

impl FrameLimits {
    /// Largest whole frame these limits accept
    pub fn max_frame(&self) -> usize {
        LENGTH_PREFIX + self.max_header + self.max_payload
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
    kind: String,
    id: CorrelationId,
    reply: bool,
    #[serde(default)]
    error: bool,
    #[serde(default)]
    fields: Fields,
    #[serde(default)]
    size: u64,
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Query {
        id: CorrelationId,
        command: Command,
    },
    Reply {
        id: CorrelationId,
        command: Command,
    },
    Error {
        id: CorrelationId,
        kind: CommandKind,
        error: ReplyError,
    },
}

impl Packet {
    pub fn id(&self) -> CorrelationId {
        match self {
            Self::Query { id, .. } | Self::Reply { id, .. } | Self::Error { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Query { command, .. } | Self::Reply { command, .. } => command.kind(),
            Self::Error { kind, .. } => *kind,
        }
    }

    /// Encode into a single self-delimiting frame
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (header, payload) = match self {
            Self::Query { id, command } | Self::Reply { id, command } => {
                let (fields, payload) = command.build()?;
                let header = FrameHeader {
                    kind: command.kind().wire_name().to_string(),
                    id: *id,
                    reply: matches!(self, Self::Reply { .. }),
                    error: false,
                    fields,
                    size: payload.as_ref().map(|p| p.len() as u64).unwrap_or(0),
                };
                (header, payload)
            }
            Self::Error { id, kind, error } => {
                let header = FrameHeader {
                    kind: kind.wire_name().to_string(),
                    id: *id,
                    reply: true,
                    error: true,
                    fields: error.to_fields()?,
                    size: 0,
                };
                (header, None)
            }
        };

        let header = serde_json::to_vec(&header)
            .map_err(|e| SyncError::malformed(format!("failed to encode header: {}", e)))?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| SyncError::malformed("header exceeds u32 length"))?;

        let payload_len = payload.as_ref().map(|p| p.len()).unwrap_or(0);
        let mut frame = Vec::with_capacity(LENGTH_PREFIX + header.len() + payload_len);
        frame.extend_from_slice(&header_len.to_be_bytes());
        frame.extend_from_slice(&header);
        if let Some(payload) = payload {
            frame.extend_from_slice(&payload);
        }
        Ok(frame)
    }

    /// Decode one complete frame
    pub fn decode(frame: &[u8], limits: &FrameLimits) -> Result<Self> {
        if frame.len() < LENGTH_PREFIX {
            return Err(SyncError::malformed(format!(
                "frame of {} bytes is shorter than its length prefix",
                frame.len()
            )));
        }
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&frame[..LENGTH_PREFIX]);
        let header_len = u32::from_be_bytes(prefix) as usize;
        if header_len > limits.max_header {
            return Err(SyncError::malformed(format!(
                "header of {} bytes exceeds limit of {}",
                header_len, limits.max_header
            )));
        }

        let body = &frame[LENGTH_PREFIX..];
        if body.len() < header_len {
            return Err(SyncError::malformed(format!(
                "header declares {} bytes but only {} present",
                header_len,
                body.len()
            )));
        }
        let (header_bytes, payload_bytes) = body.split_at(header_len);
        let header: FrameHeader = serde_json::from_slice(header_bytes)
            .map_err(|e| SyncError::malformed(format!("invalid header: {}", e)))?;

        if header.size > limits.max_payload as u64 {
            return Err(SyncError::malformed(format!(
                "payload of {} bytes exceeds limit of {}",
                header.size, limits.max_payload
            )));
        }
        if payload_bytes.len() as u64 != header.size {
            return Err(SyncError::malformed(format!(
                "header declares a {} byte payload, frame carries {}",
                header.size,
                payload_bytes.len()
            )));
        }

        let kind = CommandKind::from_wire(&header.kind)?;
        if header.error {
            if !header.reply {
                return Err(SyncError::malformed("error flag set on a query"));
            }
            return Ok(Self::Error {
                id: header.id,
                kind,
                error: ReplyError::from_fields(kind, header.fields)?,
            });
        }

        let is_container = if header.reply {
            kind.reply_is_container()
        } else {
            kind.query_is_container()
        };
        if !is_container && header.size != 0 {
            return Err(SyncError::malformed(format!(
                "'{}' does not carry a payload",
                kind
            )));
        }
        let payload = is_container.then(|| Bytes::copy_from_slice(payload_bytes));

        let command = Command::parse(kind, header.reply, header.fields, payload)?;
        Ok(if header.reply {
            Self::Reply {
                id: header.id,
                command,
            }
        } else {
            Self::Query {
                id: header.id,
                command,
            }
        })
    }
}
