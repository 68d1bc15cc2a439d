//! Tar encoding used for HTTP bodies

use std::io::Read;

use crate::artifact::{Artifact, ArtifactFile};
use crate::error::{ProtocolError, Result};

/// Content type of tar-encoded artifact bodies
pub const TAR_CONTENT_TYPE: &str = "application/x-tar";

/// Encode an artifact as a deterministic tar archive
pub fn to_tar(artifact: &Artifact) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::with_capacity(
        artifact.total_size() as usize + artifact.len() * 1024,
    ));
    builder.mode(tar::HeaderMode::Deterministic);

    for file in artifact.files() {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(file.data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        builder
            .append_data(&mut header, &file.path, file.data.as_ref())
            .map_err(|e| ProtocolError::Archive(format!("failed to add {}: {e}", file.path)))?;
    }

    builder
        .into_inner()
        .map_err(|e| ProtocolError::Archive(e.to_string()))
}

/// Decode a tar archive into a validated artifact
pub fn from_tar(data: &[u8]) -> Result<Artifact> {
    let mut archive = tar::Archive::new(data);
    let entries = archive
        .entries()
        .map_err(|e| ProtocolError::Archive(e.to_string()))?;

    let mut files = Vec::new();
    for entry in entries {
        let mut entry = entry.map_err(|e| ProtocolError::Archive(e.to_string()))?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            continue;
        }
        if !entry_type.is_file() {
            return Err(ProtocolError::Archive(format!(
                "unsupported tar entry type {entry_type:?}"
            )));
        }

        let path = String::from_utf8(entry.path_bytes().into_owned())
            .map_err(|_| ProtocolError::Archive("non UTF-8 path in archive".to_string()))?;
        let path = path.strip_prefix("./").unwrap_or(&path).to_string();

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| ProtocolError::Archive(format!("failed to read {path}: {e}")))?;
        files.push(ArtifactFile::new(path, data));
    }

    Artifact::new(files)
}
