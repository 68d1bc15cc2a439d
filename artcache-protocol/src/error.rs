use thiserror::Error;

use crate::hash::ContentHash;

/// Errors raised while validating keys and artifacts
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid file path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("Hash mismatch - expected: {expected}, actual: {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("Archive error: {0}")]
    Archive(String),
}

/// Errors raised by the RPC frame codec
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: u64, max: u64 },

    #[error("Frame checksum mismatch - expected: {expected:08x}, actual: {actual:08x}")]
    Checksum { expected: u32, actual: u32 },
}

/// Result type alias for protocol validation
pub type Result<T> = std::result::Result<T, ProtocolError>;
