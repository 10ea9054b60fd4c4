use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage::{copy_atomic, ensure_directory, remove_file_if_exists};

/// File name the export stage writes into `output/`.
pub const ARTIFACT_FILE_NAME: &str = "model.glb";
pub const ARTIFACT_MEDIA_TYPE: &str = "model/gltf-binary";

/// Flat store of published models, `<dir>/<job_id>.glb`, kept apart from
/// workspaces so it survives intermediate-file cleanup.
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        ensure_directory(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.glb", job_id))
    }

    pub fn exists(&self, job_id: &str) -> bool {
        self.path_for(job_id).is_file()
    }

    /// Copies `produced` into the store. The artifact appears complete or
    /// not at all; re-publishing overwrites the previous file.
    pub fn publish(&self, job_id: &str, produced: &Path) -> Result<PathBuf, StorageError> {
        if !produced.is_file() {
            return Err(StorageError::MissingFile(produced.to_path_buf()));
        }
        let target = self.path_for(job_id);
        copy_atomic(produced, &target)?;
        info!(job_id, "Artifact published");
        Ok(target)
    }

    /// Removes the artifact. Absent artifacts are not an error.
    pub fn remove(&self, job_id: &str) -> Result<bool, StorageError> {
        let removed = remove_file_if_exists(&self.path_for(job_id))?;
        if removed {
            debug!(job_id, "Artifact removed");
        }
        Ok(removed)
    }

    /// Name offered to clients downloading the artifact.
    pub fn download_name(job_id: &str) -> String {
        format!("atlas-{}.glb", job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use assert_fs::TempDir;

    #[test]
    fn test_publish_copies_into_store() {
        let temp = TempDir::new().unwrap();
        let produced = temp.child("work/output/model.glb");
        produced.write_binary(b"glTF-bytes").unwrap();
        let store = ArtifactStore::new(temp.path().join("artifacts")).unwrap();

        let path = store.publish("job", produced.path()).unwrap();

        assert_eq!(path, store.path_for("job"));
        temp.child("artifacts/job.glb").assert(&b"glTF-bytes"[..]);
        assert!(produced.path().exists());
    }

    #[test]
    fn test_publish_missing_output() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path().join("artifacts")).unwrap();
        let result = store.publish("job", &temp.path().join("nope.glb"));
        assert!(matches!(result, Err(StorageError::MissingFile(_))));
        assert!(!store.exists("job"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::new(temp.path()).unwrap();
        std::fs::write(store.path_for("job"), b"x").unwrap();
        assert!(store.remove("job").unwrap());
        assert!(!store.remove("job").unwrap());
    }

    #[test]
    fn test_download_name() {
        assert_eq!(ArtifactStore::download_name("abc"), "atlas-abc.glb");
    }
}
