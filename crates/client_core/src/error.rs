use shared::{
    domain::{MessageId, StreamId},
    error::TransportError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel for stream {0} already exists")]
    AlreadyJoined(StreamId),
    #[error("no channel for stream {0}")]
    NotFound(StreamId),
    #[error("only the creator may delete channel {0}")]
    NotCreator(StreamId),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("directory lookup failed for {stream_id}: {reason}")]
    Directory { stream_id: StreamId, reason: String },
    #[error("metadata persistence failed for {stream_id}: {reason}")]
    Persistence { stream_id: StreamId, reason: String },
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("no channel for stream {0}")]
    NotFound(StreamId),
    #[error("channel {0} is read-only")]
    ReadOnly(StreamId),
    #[error("publish permission denied on stream {0}")]
    PermissionDenied(StreamId),
    #[error("failed to construct signed message: {0}")]
    Sign(String),
    #[error("publish failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        source: TransportError,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("message {0} is not pending")]
    NotPending(MessageId),
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("no channel for stream {0}")]
    NotFound(StreamId),
    #[error("no pagination cursor yet for stream {0}")]
    NoCursor(StreamId),
}
