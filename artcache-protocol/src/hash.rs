//! SHA-256 content digests

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;

/// Domain tag mixed into every artifact digest
const ARTIFACT_DOMAIN: &[u8] = b"artcache-v1\0";

/// 256-bit digest identifying artifact content
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Digest arbitrary bytes (no domain tag)
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}

/// Incremental hasher producing the canonical artifact digest.
///
/// Each file contributes `u64-le(path len) | path | u64-le(data len) | data`;
/// callers must feed files in path order.
pub struct ArtifactHasher {
    inner: Sha256,
}

impl ArtifactHasher {
    pub fn new() -> Self {
        let mut inner = Sha256::new();
        inner.update(ARTIFACT_DOMAIN);
        Self { inner }
    }

    pub fn file(&mut self, path: &str, data: &[u8]) {
        self.inner.update((path.len() as u64).to_le_bytes());
        self.inner.update(path.as_bytes());
        self.inner.update((data.len() as u64).to_le_bytes());
        self.inner.update(data);
    }

    pub fn finish(self) -> ContentHash {
        ContentHash(self.inner.finalize().into())
    }
}

impl Default for ArtifactHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|e| ProtocolError::InvalidArtifact(format!("bad content hash {s:?}: {e}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
