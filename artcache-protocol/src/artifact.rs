//! Artifact content model
//!
//! An artifact is the set of files one build action produced. Files are kept
//! sorted by path so the content hash is independent of the order in which a
//! producer happened to enumerate them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{ProtocolError, Result};
use crate::hash::{ArtifactHasher, ContentHash};
use crate::key::RESERVED_PREFIX;

const MAX_FILE_PATH_LEN: usize = 4096;

/// One file of an artifact, addressed by its relative path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    pub path: String,
    pub data: Bytes,
}

impl ArtifactFile {
    pub fn new(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }
}

/// Validated, normalised file list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    files: Vec<ArtifactFile>,
}

impl Artifact {
    /// Validate paths, reject duplicates and sort by path
    pub fn new(mut files: Vec<ArtifactFile>) -> Result<Self> {
        if files.is_empty() {
            return Err(ProtocolError::InvalidArtifact(
                "artifact contains no files".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(files.len());
        for file in &files {
            validate_file_path(&file.path)?;
            if !seen.insert(file.path.as_str()) {
                return Err(ProtocolError::InvalidArtifact(format!(
                    "duplicate file path {:?}",
                    file.path
                )));
            }
        }

        // A file cannot also be a directory holding other files
        for file in &files {
            let mut rest = file.path.as_str();
            while let Some((parent, _)) = rest.rsplit_once('/') {
                if seen.contains(parent) {
                    return Err(ProtocolError::InvalidArtifact(format!(
                        "{parent:?} is both a file and a directory"
                    )));
                }
                rest = parent;
            }
        }
        drop(seen);

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Self { files })
    }

    pub fn files(&self) -> &[ArtifactFile] {
        &self.files
    }

    pub fn into_files(self) -> Vec<ArtifactFile> {
        self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Sum of file sizes in bytes
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.data.len() as u64).sum()
    }

    /// Canonical content digest
    pub fn content_hash(&self) -> ContentHash {
        let mut hasher = ArtifactHasher::new();
        for file in &self.files {
            hasher.file(&file.path, &file.data);
        }
        hasher.finish()
    }

    pub fn get(&self, path: &str) -> Option<&ArtifactFile> {
        self.files
            .binary_search_by(|f| f.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.files[i])
    }
}

/// Artifact content paired with the hash it is declared to have
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedArtifact {
    pub hash: ContentHash,
    pub artifact: Artifact,
}

impl HashedArtifact {
    /// Compute the hash for freshly produced content
    pub fn seal(artifact: Artifact) -> Self {
        Self {
            hash: artifact.content_hash(),
            artifact,
        }
    }

    /// Pair content with a hash received from elsewhere, verifying agreement
    pub fn verified(hash: ContentHash, artifact: Artifact) -> Result<Self> {
        let hashed = Self { hash, artifact };
        hashed.verify()?;
        Ok(hashed)
    }

    /// Recompute the digest and compare with the declared one
    pub fn verify(&self) -> Result<()> {
        let actual = self.artifact.content_hash();
        if actual != self.hash {
            return Err(ProtocolError::HashMismatch {
                expected: self.hash,
                actual,
            });
        }
        Ok(())
    }
}

/// Validate a file path inside an artifact
pub fn validate_file_path(path: &str) -> Result<()> {
    let invalid = |reason: &str| ProtocolError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    if path.len() > MAX_FILE_PATH_LEN {
        return Err(invalid("path too long"));
    }
    if path
        .chars()
        .any(|c| c.is_control() || c == '\\' || c == '"')
    {
        return Err(invalid("contains control characters, backslashes or quotes"));
    }
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(invalid("must be relative without empty, '.' or '..' segments"));
        }
        if segment.starts_with(RESERVED_PREFIX) {
            return Err(invalid("uses a reserved name"));
        }
    }
    Ok(())
}
