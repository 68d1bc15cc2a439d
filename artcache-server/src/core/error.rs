use artcache_protocol::{ContentHash, ProtocolError, RpcErrorKind};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Main error type for artcache server operations
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Hash mismatch for {key} - declared: {expected}, actual: {actual}")]
    HashMismatch {
        key: String,
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("Artifact of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("Request body too large: {0}")]
    BodyTooLarge(String),

    #[error("Storage full: {0}")]
    StorageFull(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) | Self::HashMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::TooLarge { .. } | Self::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::StorageFull(_) => StatusCode::INSUFFICIENT_STORAGE,
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error kind reported over the RPC transport
    pub fn rpc_kind(&self) -> RpcErrorKind {
        match self {
            Self::NotFound(_) | Self::InvalidRequest(_) => RpcErrorKind::InvalidRequest,
            Self::HashMismatch { .. } => RpcErrorKind::HashMismatch,
            Self::TooLarge { .. } | Self::BodyTooLarge(_) => RpcErrorKind::TooLarge,
            Self::StorageFull(_) | Self::Storage(_) => RpcErrorKind::Storage,
            Self::Internal(_) => RpcErrorKind::Internal,
        }
    }

    /// Classify an IO failure, separating out-of-space from other errors
    pub fn from_io(context: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            Self::StorageFull(format!("{context}: {err}"))
        } else {
            Self::Storage(format!("{context}: {err}"))
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(err: ProtocolError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

/// Implement IntoResponse for Axum integration
impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

/// Result type alias for server operations
pub type Result<T> = std::result::Result<T, ServerError>;
