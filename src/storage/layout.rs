//! On-disk placement of entity documents and whole-file replacement.

use crate::config::{DocumentLayout, NamespaceConfig};
use crate::core::{EntityKey, Result, StateError};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const DOCUMENT_EXTENSION: &str = "json";
const QUARANTINE_SUFFIX: &str = "corrupt";

/// Resolves the file holding `entity`'s document in `namespace`.
///
/// - flat: `<root>/<namespace>/<platform>/<id>.json`
/// - per-entity directory: `<root>/<namespace>/<platform>/<id>/<file>.json`
pub fn document_path(namespace: &NamespaceConfig, entity: &EntityKey) -> Result<PathBuf> {
    entity.validate()?;
    let platform_dir = namespace
        .root
        .join(&namespace.name)
        .join(entity.platform.as_str());

    let path = match &namespace.layout {
        DocumentLayout::Flat => {
            platform_dir.join(format!("{}.{}", entity.id, DOCUMENT_EXTENSION))
        }
        DocumentLayout::EntityDirectory { file_stem } => platform_dir
            .join(&entity.id)
            .join(format!("{}.{}", file_stem, DOCUMENT_EXTENSION)),
    };
    Ok(path)
}

/// Reads a document file. `Ok(None)` when the file does not exist.
pub fn read_file(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StateError::IoError(format!(
            "Failed to read '{}': {}",
            path.display(),
            err
        ))),
    }
}

/// Replaces `path` with `bytes` via a temp file in the same directory, so
/// readers see either the old document or the new one, never a torn write.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        StateError::IoError(format!("'{}' has no parent directory", path.display()))
    })?;
    fs::create_dir_all(parent).map_err(|err| {
        StateError::IoError(format!(
            "Failed to create parent directory '{}': {}",
            parent.display(),
            err
        ))
    })?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|err| {
        StateError::IoError(format!(
            "Failed to create temp file in '{}': {}",
            parent.display(),
            err
        ))
    })?;
    tmp.write_all(bytes).map_err(|err| {
        StateError::IoError(format!(
            "Failed to write temp file for '{}': {}",
            path.display(),
            err
        ))
    })?;
    tmp.as_file().sync_all().map_err(|err| {
        StateError::IoError(format!(
            "Failed to sync temp file for '{}': {}",
            path.display(),
            err
        ))
    })?;
    tmp.persist(path).map_err(|err| {
        StateError::IoError(format!(
            "Failed to replace '{}': {}",
            path.display(),
            err.error
        ))
    })?;
    Ok(())
}

/// Moves a document that failed to decode out of the way and returns where it went.
pub fn quarantine(path: &Path) -> Result<PathBuf> {
    let mut target = path.as_os_str().to_owned();
    target.push(".");
    target.push(QUARANTINE_SUFFIX);
    let target = PathBuf::from(target);

    fs::rename(path, &target).map_err(|err| {
        StateError::IoError(format!(
            "Failed to quarantine '{}': {}",
            path.display(),
            err
        ))
    })?;
    Ok(target)
}
