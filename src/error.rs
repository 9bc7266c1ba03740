//! Error type for the protocol layer.
//!
//! Job-level code (client flows, daemon entry points) wraps these in
//! `anyhow::Error` with context; everything below the session speaks `SyncError`.

use crate::buffer::CodecError;
use crate::message::MessageType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Codec(#[from] CodecError),

    #[error("unknown message type {0:?}")]
    UnknownMessageType([u8; 2]),

    #[error("packet length {len} outside (0, {max}]")]
    FrameLength { len: i64, max: usize },

    #[error("packet header says {header} but body carries {body}")]
    TypeMismatch { header: MessageType, body: MessageType },

    #[error("unexpected {got} while waiting for {expected}")]
    Unexpected {
        expected: &'static str,
        got: MessageType,
    },

    #[error("connection closed while waiting for {0}")]
    Closed(&'static str),

    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("connection rejected: {0}")]
    Rejected(String),

    #[error("invalid path {path:?}: {reason}")]
    Path { path: String, reason: String },

    #[error("{0}")]
    Protocol(String),

    #[error("job cancelled")]
    Cancelled,
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
