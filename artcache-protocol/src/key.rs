use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProtocolError, Result};

/// Prefix reserved for cache bookkeeping files and directories
pub const RESERVED_PREFIX: &str = ".artcache";

const MAX_OS_ARCH_LEN: usize = 64;
const MAX_ARTIFACT_LEN: usize = 1024;

/// Composite cache key: `(os_arch, artifact path)`.
///
/// The artifact path carries the build target plus a hash segment derived
/// from the action inputs, so distinct configurations never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawKey")]
pub struct ArtifactKey {
    os_arch: String,
    artifact: String,
}

#[derive(Deserialize)]
struct RawKey {
    os_arch: String,
    artifact: String,
}

impl TryFrom<RawKey> for ArtifactKey {
    type Error = ProtocolError;

    fn try_from(raw: RawKey) -> Result<Self> {
        Self::new(raw.os_arch, raw.artifact)
    }
}

impl ArtifactKey {
    /// Create a validated key
    pub fn new(os_arch: impl Into<String>, artifact: impl Into<String>) -> Result<Self> {
        let os_arch = os_arch.into();
        let artifact = artifact.into();
        validate_os_arch(&os_arch)?;
        validate_artifact(&artifact)?;
        Ok(Self { os_arch, artifact })
    }

    /// Parse `os_arch/artifact/...` as used in HTTP paths
    pub fn from_path(path: &str) -> Result<Self> {
        let path = path.trim_start_matches('/');
        let (os_arch, artifact) = path
            .split_once('/')
            .ok_or_else(|| ProtocolError::InvalidKey(format!("missing artifact in {path:?}")))?;
        Self::new(os_arch, artifact)
    }

    pub fn os_arch(&self) -> &str {
        &self.os_arch
    }

    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    /// `os_arch/artifact`
    pub fn to_path(&self) -> String {
        format!("{}/{}", self.os_arch, self.artifact)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os_arch, self.artifact)
    }
}

pub fn validate_os_arch(os_arch: &str) -> Result<()> {
    if os_arch.is_empty() || os_arch.len() > MAX_OS_ARCH_LEN {
        return Err(ProtocolError::InvalidKey(format!(
            "os_arch must be 1-{MAX_OS_ARCH_LEN} bytes, got {}",
            os_arch.len()
        )));
    }
    if !os_arch
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(ProtocolError::InvalidKey(format!(
            "os_arch {os_arch:?} may only contain [A-Za-z0-9_-]"
        )));
    }
    Ok(())
}

/// Validate an artifact path (the key component, not a file inside it)
pub fn validate_artifact(artifact: &str) -> Result<()> {
    if artifact.is_empty() || artifact.len() > MAX_ARTIFACT_LEN {
        return Err(ProtocolError::InvalidKey(format!(
            "artifact must be 1-{MAX_ARTIFACT_LEN} bytes, got {}",
            artifact.len()
        )));
    }
    for segment in artifact.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(ProtocolError::InvalidKey(format!(
                "artifact {artifact:?} has an empty or relative segment"
            )));
        }
        if segment.starts_with(RESERVED_PREFIX) {
            return Err(ProtocolError::InvalidKey(format!(
                "artifact {artifact:?} uses reserved prefix {RESERVED_PREFIX}"
            )));
        }
        if !segment.bytes().all(is_artifact_byte) {
            return Err(ProtocolError::InvalidKey(format!(
                "artifact segment {segment:?} contains unsupported characters"
            )));
        }
    }
    Ok(())
}

fn is_artifact_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-' | b'+' | b'=' | b'@' | b',' | b'~')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_key() {
        let key = ArtifactKey::new("linux_amd64", "src/core/lib/abc123").unwrap();
        assert_eq!(key.os_arch(), "linux_amd64");
        assert_eq!(key.artifact(), "src/core/lib/abc123");
        assert_eq!(key.to_string(), "linux_amd64/src/core/lib/abc123");
    }

    #[test]
    fn test_from_path() {
        let key = ArtifactKey::from_path("/darwin_arm64/tools/gen/ff00").unwrap();
        assert_eq!(key.os_arch(), "darwin_arm64");
        assert_eq!(key.artifact(), "tools/gen/ff00");

        assert!(ArtifactKey::from_path("linux_amd64").is_err());
        assert!(ArtifactKey::from_path("linux_amd64/").is_err());
    }

    #[test]
    fn test_rejects_traversal_and_reserved() {
        assert!(ArtifactKey::new("linux_amd64", "../etc/passwd").is_err());
        assert!(ArtifactKey::new("linux_amd64", "a//b").is_err());
        assert!(ArtifactKey::new("linux_amd64", "/abs").is_err());
        assert!(ArtifactKey::new("linux_amd64", "a/./b").is_err());
        assert!(ArtifactKey::new("linux_amd64", "a/.artcache-entry").is_err());
        assert!(ArtifactKey::new("linux_amd64", "a b").is_err());
        assert!(ArtifactKey::new("linux_amd64", "a:b").is_err());
    }

    #[test]
    fn test_rejects_bad_os_arch() {
        assert!(ArtifactKey::new("", "a").is_err());
        assert!(ArtifactKey::new(".tmp", "a").is_err());
        assert!(ArtifactKey::new("linux/amd64", "a").is_err());
        assert!(ArtifactKey::new("x".repeat(65), "a").is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: ArtifactKey =
            serde_json::from_str(r#"{"os_arch":"linux_amd64","artifact":"a/b"}"#).unwrap();
        assert_eq!(ok.artifact(), "a/b");

        let bad = serde_json::from_str::<ArtifactKey>(r#"{"os_arch":"linux_amd64","artifact":"../x"}"#);
        assert!(bad.is_err());
    }
}
