pub mod artifacts;
pub mod workspace;

use std::io::Write;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::StorageError;

pub use artifacts::{ArtifactStore, ARTIFACT_FILE_NAME, ARTIFACT_MEDIA_TYPE};
pub use workspace::{StageDir, StagedJob, StagingError, Upload, WorkspaceLayout, WorkspaceManager};

/// Creates `path` and any missing parents.
pub fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Hidden sibling used as the staging file for an atomic replace of `path`.
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

/// Replaces `path` with `content` so readers see either the old or the new
/// bytes, never a torn file: write a hidden sibling, fsync, rename over.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let tmp = temp_sibling(path);
    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()
    })();
    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(StorageError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        });
    }

    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        StorageError::MoveFile {
            from: tmp.clone(),
            to: path.to_path_buf(),
            source: e,
        }
    })
}

/// Copies `src` next to `dst` and renames it into place, so `dst` appears
/// complete or not at all.
pub fn copy_atomic(src: &Path, dst: &Path) -> Result<(), StorageError> {
    if let Some(parent) = dst.parent() {
        ensure_directory(parent)?;
    }

    let tmp = temp_sibling(dst);
    if let Err(e) = std::fs::copy(src, &tmp) {
        let _ = std::fs::remove_file(&tmp);
        return Err(StorageError::MoveFile {
            from: src.to_path_buf(),
            to: dst.to_path_buf(),
            source: e,
        });
    }

    std::fs::rename(&tmp, dst).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        StorageError::MoveFile {
            from: tmp.clone(),
            to: dst.to_path_buf(),
            source: e,
        }
    })
}

/// Removes a file, treating "already gone" as success.
pub fn remove_file_if_exists(path: &Path) -> Result<bool, StorageError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::Remove {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Removes a directory tree, treating "already gone" as success.
pub fn remove_dir_if_exists(path: &Path) -> Result<bool, StorageError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::Remove {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// True for the hidden staging files produced by [`write_atomic`].
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// Sum of file sizes below `dir`; zero when it does not exist.
pub fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
