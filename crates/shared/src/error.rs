use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed failures surfaced by the pub/sub transport.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TransportError {
    #[error("permission denied on stream {0}")]
    PermissionDenied(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("transport failure: {0}")]
    Unknown(String),
}

impl TransportError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, TransportError::PermissionDenied(_))
    }
}
