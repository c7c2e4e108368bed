use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SfuError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Peer is closed")]
    Closed,
}

/// Machine-readable error kind carried in signaling error replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    NegotiationError,
    ResourceExhausted,
    Closed,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidState => "invalid_state",
            Self::NegotiationError => "negotiation_error",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Closed => "closed",
        }
    }
}

impl SfuError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Negotiation(_) => ErrorKind::NegotiationError,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Closed => ErrorKind::Closed,
        }
    }

    pub fn negotiation(err: impl std::fmt::Display) -> Self {
        Self::Negotiation(err.to_string())
    }
}

impl From<webrtc::Error> for SfuError {
    fn from(err: webrtc::Error) -> Self {
        match err {
            webrtc::Error::ErrConnectionClosed => Self::Closed,
            other => Self::Negotiation(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
