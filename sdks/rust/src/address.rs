//! Content Addresser
//!
//! Maps a finished build action to its cache key and the content hash of its
//! declared outputs. [`action_key`] and [`address`] are pure; reading outputs
//! from disk and writing fetched artifacts back live in [`collect_outputs`]
//! and [`restore_outputs`].

use artcache_protocol::{Artifact, ArtifactFile, ArtifactKey, ContentHash, HashedArtifact};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{CacheError, Result};

const ACTION_DOMAIN: &[u8] = b"artcache-action-v1\0";

/// Output files of an action, keyed by path relative to the output root
pub type OutputSet = BTreeMap<String, Bytes>;

/// A build action as seen by the cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildAction {
    /// Target label, e.g. `//src/core:lib`
    pub label: String,
    /// Platform the outputs are built for, e.g. `linux_amd64`
    pub os_arch: String,
    /// Toolchain identity (compiler version, ABI)
    pub toolchain: String,
    /// Command line run by the action
    pub command: Vec<String>,
    /// Content hashes of the action inputs, keyed by path
    pub inputs: BTreeMap<String, ContentHash>,
    /// Configuration values that affect the outputs
    pub config: BTreeMap<String, String>,
    /// Output files or directories the action promises to produce
    pub declared_outputs: Vec<String>,
}

/// Cache key plus verified content of one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressedArtifact {
    pub key: ArtifactKey,
    pub artifact: HashedArtifact,
}

/// Convert a target label into an artifact path prefix.
///
/// `//src/core:lib` becomes `src/core/lib`.
pub fn label_path(label: &str) -> Result<String> {
    let trimmed = label.strip_prefix("//").unwrap_or(label);
    let path = trimmed
        .split(['/', ':'])
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");

    if path.is_empty() {
        return Err(CacheError::InvalidArtifact(format!("empty label: {label:?}")));
    }
    Ok(path)
}

/// Digest of everything that determines an action's outputs
pub fn action_hash(action: &BuildAction) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(ACTION_DOMAIN);

    let mut field = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    };

    field(action.label.as_bytes());
    field(action.os_arch.as_bytes());
    field(action.toolchain.as_bytes());

    field(&(action.command.len() as u64).to_le_bytes());
    for arg in &action.command {
        field(arg.as_bytes());
    }

    field(&(action.inputs.len() as u64).to_le_bytes());
    for (path, hash) in &action.inputs {
        field(path.as_bytes());
        field(hash.as_bytes());
    }

    field(&(action.config.len() as u64).to_le_bytes());
    for (name, value) in &action.config {
        field(name.as_bytes());
        field(value.as_bytes());
    }

    let declared = declared_set(action);
    field(&(declared.len() as u64).to_le_bytes());
    for output in &declared {
        field(output.as_bytes());
    }

    ContentHash::from_bytes(hasher.finalize().into())
}

/// Cache key of an action: `{os_arch}` plus `{label path}/{action hash}`
pub fn action_key(action: &BuildAction) -> Result<ArtifactKey> {
    let artifact = format!("{}/{}", label_path(&action.label)?, action_hash(action));
    Ok(ArtifactKey::new(action.os_arch.as_str(), artifact)?)
}

/// Key an action and hash its declared outputs.
///
/// A declared output matches the file with exactly that path, or every file
/// below it when it names a directory. Files outside the declared set are not
/// part of the artifact.
pub fn address(action: &BuildAction, outputs: &OutputSet) -> Result<AddressedArtifact> {
    let key = action_key(action)?;

    let mut files = Vec::new();
    let mut missing = Vec::new();
    for declared in declared_set(action) {
        let prefix = format!("{declared}/");
        let before = files.len();
        for (path, data) in outputs {
            if *path == declared || path.starts_with(&prefix) {
                files.push(ArtifactFile::new(path.clone(), data.clone()));
            }
        }
        if files.len() == before {
            missing.push(declared);
        }
    }

    if !missing.is_empty() {
        return Err(CacheError::IncompleteArtifact {
            label: action.label.clone(),
            missing,
        });
    }

    // Overlapping declarations (`out` and `out/a`) select the same file twice
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files.dedup_by(|a, b| a.path == b.path);

    let artifact = HashedArtifact::seal(Artifact::new(files)?);
    debug!(
        "Addressed {} as {} ({} files, hash {})",
        action.label,
        key,
        artifact.artifact.len(),
        artifact.hash
    );
    Ok(AddressedArtifact { key, artifact })
}

/// Read an action's declared outputs below `root`.
///
/// Declared outputs that do not exist are skipped; [`address`] reports them.
pub fn collect_outputs(root: &Path, declared: &[String]) -> Result<OutputSet> {
    let mut outputs = OutputSet::new();

    for output in declared {
        let output = normalize(output);
        let path = root.join(&output);
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };

        if meta.is_file() {
            outputs.insert(output, Bytes::from(fs::read(&path)?));
            continue;
        }

        for entry in WalkDir::new(&path).follow_links(false) {
            let entry = entry.map_err(|e| {
                CacheError::Storage(std::io::Error::other(format!(
                    "failed to walk {}: {e}",
                    path.display()
                )))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| CacheError::InvalidArtifact(e.to_string()))?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            outputs.insert(rel, Bytes::from(fs::read(entry.path())?));
        }
    }

    Ok(outputs)
}

/// Write a fetched artifact into the output tree at `root`
pub fn restore_outputs(root: &Path, artifact: &Artifact) -> Result<()> {
    for file in artifact.files() {
        let dest = root.join(&file.path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = dest.with_file_name(format!(
            ".{}.{}.restore",
            dest.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            uuid::Uuid::new_v4().simple()
        ));
        fs::write(&tmp, &file.data)?;
        if let Err(e) = fs::rename(&tmp, &dest) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
    }
    Ok(())
}

fn normalize(output: &str) -> String {
    output.trim_matches('/').to_string()
}

fn declared_set(action: &BuildAction) -> BTreeSet<String> {
    action
        .declared_outputs
        .iter()
        .map(|o| normalize(o))
        .filter(|o| !o.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action() -> BuildAction {
        BuildAction {
            label: "//src/core:lib".into(),
            os_arch: "linux_amd64".into(),
            toolchain: "gcc-13.2".into(),
            command: vec!["cc".into(), "-c".into(), "core.c".into()],
            inputs: BTreeMap::from([("src/core/core.c".into(), ContentHash::digest(b"int x;"))]),
            config: BTreeMap::from([("opt".into(), "2".into())]),
            declared_outputs: vec!["lib/libcore.a".into(), "include".into()],
        }
    }

    fn outputs() -> OutputSet {
        OutputSet::from([
            ("lib/libcore.a".into(), Bytes::from_static(b"archive")),
            ("include/core.h".into(), Bytes::from_static(b"header")),
            ("include/sub/extra.h".into(), Bytes::from_static(b"extra")),
            ("scratch.log".into(), Bytes::from_static(b"noise")),
        ])
    }

    #[test]
    fn test_label_path() {
        assert_eq!(label_path("//src/core:lib").unwrap(), "src/core/lib");
        assert_eq!(label_path("//:all").unwrap(), "all");
        assert_eq!(label_path("//tools/gen").unwrap(), "tools/gen");
        assert!(label_path("//").is_err());
    }

    #[test]
    fn test_action_key_is_deterministic() {
        let a = action_key(&action()).unwrap();
        let b = action_key(&action()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.os_arch(), "linux_amd64");
        assert!(a.artifact().starts_with("src/core/lib/"));
        assert_eq!(a.artifact().len(), "src/core/lib/".len() + 64);
    }

    #[test]
    fn test_key_depends_on_platform_and_toolchain() {
        let base = action_key(&action()).unwrap();

        let mut other = action();
        other.os_arch = "darwin_arm64".into();
        let other_key = action_key(&other).unwrap();
        assert_ne!(base.artifact(), other_key.artifact());

        let mut other = action();
        other.toolchain = "gcc-14.1".into();
        assert_ne!(base, action_key(&other).unwrap());

        let mut other = action();
        other.inputs.insert("src/core/extra.c".into(), ContentHash::digest(b""));
        assert_ne!(base, action_key(&other).unwrap());
    }

    #[test]
    fn test_declared_output_order_does_not_matter() {
        let mut reordered = action();
        reordered.declared_outputs.reverse();
        assert_eq!(action_key(&action()).unwrap(), action_key(&reordered).unwrap());
    }

    #[test]
    fn test_address_selects_declared_files() {
        let addressed = address(&action(), &outputs()).unwrap();
        let paths: Vec<&str> = addressed
            .artifact
            .artifact
            .files()
            .iter()
            .map(|f| f.path.as_str())
            .collect();
        assert_eq!(
            paths,
            vec!["include/core.h", "include/sub/extra.h", "lib/libcore.a"]
        );
        assert!(addressed.artifact.verify().is_ok());

        // Undeclared files do not change the hash
        let mut noisy = outputs();
        noisy.insert("other.tmp".into(), Bytes::from_static(b"more noise"));
        assert_eq!(
            address(&action(), &noisy).unwrap().artifact.hash,
            addressed.artifact.hash
        );
    }

    #[test]
    fn test_address_missing_output_is_incomplete() {
        let mut partial = outputs();
        partial.remove("lib/libcore.a");

        match address(&action(), &partial) {
            Err(CacheError::IncompleteArtifact { label, missing }) => {
                assert_eq!(label, "//src/core:lib");
                assert_eq!(missing, vec!["lib/libcore.a".to_string()]);
            }
            other => panic!("expected IncompleteArtifact, got {other:?}"),
        }
    }

    #[test]
    fn test_directory_prefix_is_segment_aware() {
        let mut action = action();
        action.declared_outputs = vec!["lib".into()];
        let outputs = OutputSet::from([("lib-extra/x".into(), Bytes::from_static(b"x"))]);
        assert!(matches!(
            address(&action, &outputs),
            Err(CacheError::IncompleteArtifact { .. })
        ));
    }

    #[test]
    fn test_collect_and_restore() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("lib")).unwrap();
        fs::create_dir_all(src.path().join("include/sub")).unwrap();
        fs::write(src.path().join("lib/libcore.a"), b"archive").unwrap();
        fs::write(src.path().join("include/core.h"), b"header").unwrap();
        fs::write(src.path().join("include/sub/extra.h"), b"extra").unwrap();
        fs::write(src.path().join("scratch.log"), b"noise").unwrap();

        let collected = collect_outputs(src.path(), &action().declared_outputs).unwrap();
        assert_eq!(collected.len(), 3);
        assert!(!collected.contains_key("scratch.log"));

        let addressed = address(&action(), &collected).unwrap();
        let mut expected = outputs();
        expected.remove("scratch.log");
        assert_eq!(addressed.artifact.hash, address(&action(), &expected).unwrap().artifact.hash);

        let dest = tempfile::tempdir().unwrap();
        restore_outputs(dest.path(), &addressed.artifact.artifact).unwrap();
        assert_eq!(fs::read(dest.path().join("include/sub/extra.h")).unwrap(), b"extra");
        assert_eq!(fs::read(dest.path().join("lib/libcore.a")).unwrap(), b"archive");
    }
}
