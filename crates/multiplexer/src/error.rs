use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

use crate::queue::QueueFull;

/// Failures a client request can hit inside the multiplexer. None of them are
/// fatal to the shared session; they are reported back to the requesting
/// client only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    #[error("join rejected: endpoint {requested} conflicts with active endpoint {active}")]
    ConfigConflict { active: String, requested: String },
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("{operation} requires a prior join")]
    NotJoined { operation: &'static str },
    #[error(transparent)]
    QueueFull(#[from] QueueFull),
    #[error("failed to encode outgoing envelope for message {message_id}: {reason}")]
    Encode { message_id: String, reason: String },
}

impl MuxError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ConfigConflict { .. } => ErrorCode::ConfigConflict,
            Self::InvalidEndpoint { .. } => ErrorCode::InvalidEndpoint,
            Self::NotJoined { .. } => ErrorCode::NotJoined,
            Self::QueueFull(_) => ErrorCode::QueueFull,
            Self::Encode { .. } => ErrorCode::Internal,
        }
    }
}

impl From<&MuxError> for ApiError {
    fn from(value: &MuxError) -> Self {
        ApiError::new(value.code(), value.to_string())
    }
}
