//! RPC message types
//!
//! One request frame yields exactly one response frame carrying the same
//! `request_id`. Store and fetch carry the whole file list in a single message.

use serde::{Deserialize, Serialize};

use crate::artifact::{Artifact, ArtifactFile, HashedArtifact};
use crate::error::Result;
use crate::hash::ContentHash;
use crate::key::ArtifactKey;

/// RPC request envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Unique request identifier
    pub request_id: String,
    /// Operation to execute
    pub op: RpcOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcOp {
    Fetch {
        key: ArtifactKey,
    },
    Store {
        key: ArtifactKey,
        hash: ContentHash,
        files: Vec<ArtifactFile>,
    },
    /// Remove every os_arch variant of one artifact
    Delete {
        artifact: String,
    },
    DeleteAll,
}

/// RPC response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Matching request identifier
    pub request_id: String,
    pub result: RpcResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcResult {
    Hit {
        hash: ContentHash,
        files: Vec<ArtifactFile>,
    },
    Miss,
    Stored,
    Deleted {
        removed: u64,
    },
    Error {
        kind: RpcErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorKind {
    InvalidRequest,
    HashMismatch,
    TooLarge,
    Storage,
    Internal,
}

impl RpcRequest {
    /// Create a request with a fresh identifier
    pub fn new(op: RpcOp) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            op,
        }
    }

    pub fn fetch(key: ArtifactKey) -> Self {
        Self::new(RpcOp::Fetch { key })
    }

    pub fn store(key: ArtifactKey, artifact: &HashedArtifact) -> Self {
        Self::new(RpcOp::Store {
            key,
            hash: artifact.hash,
            files: artifact.artifact.files().to_vec(),
        })
    }

    pub fn delete(artifact: impl Into<String>) -> Self {
        Self::new(RpcOp::Delete {
            artifact: artifact.into(),
        })
    }

    pub fn delete_all() -> Self {
        Self::new(RpcOp::DeleteAll)
    }
}

impl RpcResponse {
    pub fn new(request_id: impl Into<String>, result: RpcResult) -> Self {
        Self {
            request_id: request_id.into(),
            result,
        }
    }

    pub fn error(
        request_id: impl Into<String>,
        kind: RpcErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            request_id,
            RpcResult::Error {
                kind,
                message: message.into(),
            },
        )
    }

    pub fn hit(request_id: impl Into<String>, artifact: HashedArtifact) -> Self {
        Self::new(
            request_id,
            RpcResult::Hit {
                hash: artifact.hash,
                files: artifact.artifact.into_files(),
            },
        )
    }
}

/// Rebuild a verified artifact from wire parts
pub fn hashed_from_wire(hash: ContentHash, files: Vec<ArtifactFile>) -> Result<HashedArtifact> {
    HashedArtifact::verified(hash, Artifact::new(files)?)
}
