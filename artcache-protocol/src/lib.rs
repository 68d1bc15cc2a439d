//! Shared vocabulary of the artcache servers and clients: cache keys, the
//! artifact content model and its digest, and the HTTP/RPC wire encodings.

pub mod archive;
pub mod artifact;
pub mod error;
pub mod frame;
pub mod hash;
pub mod key;
pub mod rpc;

/// Header carrying the declared content hash on HTTP requests and responses
pub const HASH_HEADER: &str = "x-artifact-hash";

pub use artifact::{Artifact, ArtifactFile, HashedArtifact, validate_file_path};
pub use error::{FrameError, ProtocolError, Result};
pub use hash::{ArtifactHasher, ContentHash};
pub use key::{ArtifactKey, RESERVED_PREFIX, validate_artifact, validate_os_arch};
pub use rpc::{RpcErrorKind, RpcOp, RpcRequest, RpcResponse, RpcResult};
