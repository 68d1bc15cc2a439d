//! Error types for the artcache SDK

use artcache_protocol::{ContentHash, FrameError, ProtocolError};
use thiserror::Error;

use crate::config::TierKind;

/// Result type alias for artcache SDK operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// artcache SDK error types
#[derive(Error, Debug)]
pub enum CacheError {
    /// Content does not match its declared hash
    #[error("Hash mismatch - declared: {expected}, actual: {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// A build action did not produce all of its declared outputs
    #[error("Incomplete artifact for {label}: missing {missing:?}")]
    IncompleteArtifact { label: String, missing: Vec<String> },

    /// Key, path or file list failed validation
    #[error("Invalid artifact: {0}")]
    InvalidArtifact(String),

    /// A remote tier failed or returned something unusable
    #[error("{tier} transport error: {message}")]
    Transport { tier: TierKind, message: String },

    /// A remote tier did not answer in time
    #[error("{0} tier timed out")]
    Timeout(TierKind),

    /// Local filesystem failure
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// RPC framing error
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CacheError {
    pub(crate) fn transport(tier: TierKind, message: impl Into<String>) -> Self {
        Self::Transport {
            tier,
            message: message.into(),
        }
    }
}

impl From<ProtocolError> for CacheError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::HashMismatch { expected, actual } => {
                Self::HashMismatch { expected, actual }
            }
            other => Self::InvalidArtifact(other.to_string()),
        }
    }
}
