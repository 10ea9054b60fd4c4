use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::UploadLimits;
use crate::error::{StorageError, ValidationError};
use crate::storage::{dir_size, ensure_directory, remove_dir_if_exists};

const COPY_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_IMAGE_EXTENSION: &str = ".jpg";

/// The directories of a job workspace. `Images` holds staged uploads; every
/// other entry is the output directory of one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageDir {
    Images,
    Masks,
    Sparse,
    Dense,
    Mesh,
    Output,
}

impl StageDir {
    pub const ALL: [StageDir; 6] = [
        StageDir::Images,
        StageDir::Masks,
        StageDir::Sparse,
        StageDir::Dense,
        StageDir::Mesh,
        StageDir::Output,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            StageDir::Images => "images",
            StageDir::Masks => "masks",
            StageDir::Sparse => "sparse",
            StageDir::Dense => "dense",
            StageDir::Mesh => "mesh",
            StageDir::Output => "output",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.dir_name() == name)
    }
}

impl fmt::Display for StageDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Paths of one job's workspace tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub job_id: String,
    pub root: PathBuf,
}

impl WorkspaceLayout {
    pub fn dir(&self, dir: StageDir) -> PathBuf {
        self.root.join(dir.dir_name())
    }

    pub fn images(&self) -> PathBuf {
        self.dir(StageDir::Images)
    }
}

/// One uploaded image: an optional client file name and its byte stream.
pub struct Upload {
    pub filename: Option<String>,
    reader: Box<dyn Read + Send>,
}

impl Upload {
    pub fn new<R: Read + Send + 'static>(filename: Option<String>, reader: R) -> Self {
        Self {
            filename,
            reader: Box::new(reader),
        }
    }

    pub fn from_bytes(filename: &str, bytes: Vec<u8>) -> Self {
        Self::new(Some(filename.to_string()), std::io::Cursor::new(bytes))
    }

    pub fn from_path(path: &Path) -> Result<Self, StorageError> {
        let file = std::fs::File::open(path).map_err(|e| StorageError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        let filename = path.file_name().map(|n| n.to_string_lossy().to_string());
        Ok(Self::new(filename, file))
    }
}

impl fmt::Debug for Upload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upload")
            .field("filename", &self.filename)
            .finish_non_exhaustive()
    }
}

/// Result of a successful staging call.
#[derive(Debug, Clone)]
pub struct StagedJob {
    pub layout: WorkspaceLayout,
    /// Staged image paths, in upload order.
    pub images: Vec<PathBuf>,
    pub total_bytes: u64,
}

#[derive(Error, Debug)]
pub enum StagingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Owns `<root>/<job_id>/` trees.
pub struct WorkspaceManager {
    root: PathBuf,
    limits: UploadLimits,
}

impl WorkspaceManager {
    pub fn new<P: AsRef<Path>>(root: P, limits: UploadLimits) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        ensure_directory(&root)?;
        Ok(Self { root, limits })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    pub fn layout(&self, job_id: &str) -> WorkspaceLayout {
        WorkspaceLayout {
            job_id: job_id.to_string(),
            root: self.root.join(job_id),
        }
    }

    /// Path of `dir` inside the workspace of `job_id`. No I/O.
    pub fn resolve(&self, job_id: &str, dir: StageDir) -> PathBuf {
        self.layout(job_id).dir(dir)
    }

    pub fn exists(&self, job_id: &str) -> bool {
        self.layout(job_id).root.is_dir()
    }

    /// Streams `uploads` into `images/` as `0000.<ext>`, `0001.<ext>`, ...
    ///
    /// Count and cumulative size limits are enforced while bytes arrive. On
    /// any error the partially written workspace is removed before returning.
    pub fn stage<I>(&self, job_id: &str, uploads: I) -> Result<StagedJob, StagingError>
    where
        I: IntoIterator<Item = Upload>,
    {
        let uploads = uploads.into_iter();
        let (lower, upper) = uploads.size_hint();
        if let Some(upper) = upper {
            if upper < self.limits.min_images {
                return Err(ValidationError::TooFewInputs {
                    min: self.limits.min_images,
                    actual: upper,
                }
                .into());
            }
        }
        if lower > self.limits.max_images {
            return Err(ValidationError::TooManyInputs {
                max: self.limits.max_images,
            }
            .into());
        }

        let layout = self.layout(job_id);
        let result = self.stage_into(&layout, uploads);
        match &result {
            Ok(staged) => info!(
                job_id,
                num_images = staged.images.len(),
                total_bytes = staged.total_bytes,
                "Staged uploads"
            ),
            Err(e) => {
                debug!(job_id, error = %e, "Staging rejected, removing workspace");
                if let Err(cleanup) = remove_dir_if_exists(&layout.root) {
                    warn!(job_id, error = %cleanup, "Failed to remove rejected workspace");
                }
            }
        }
        result
    }

    fn stage_into<I>(&self, layout: &WorkspaceLayout, uploads: I) -> Result<StagedJob, StagingError>
    where
        I: Iterator<Item = Upload>,
    {
        let images_dir = layout.images();
        ensure_directory(&images_dir)?;

        let limit = self.limits.max_upload_bytes();
        let mut buffer = vec![0u8; COPY_CHUNK_SIZE];
        let mut images = Vec::new();
        let mut total_bytes: u64 = 0;

        for (index, mut upload) in uploads.enumerate() {
            if index >= self.limits.max_images {
                return Err(ValidationError::TooManyInputs {
                    max: self.limits.max_images,
                }
                .into());
            }

            let extension = staged_extension(upload.filename.as_deref())?;
            let dest = images_dir.join(format!("{:04}{}", index, extension));
            let mut file = std::fs::File::create(&dest).map_err(|e| StorageError::WriteFile {
                path: dest.clone(),
                source: e,
            })?;

            loop {
                let read = upload.reader.read(&mut buffer).map_err(|e| StorageError::ReadFile {
                    path: PathBuf::from(upload.filename.as_deref().unwrap_or("<upload>")),
                    source: e,
                })?;
                if read == 0 {
                    break;
                }
                total_bytes += read as u64;
                if total_bytes > limit {
                    return Err(ValidationError::PayloadTooLarge {
                        limit_mb: self.limits.max_upload_mb,
                    }
                    .into());
                }
                file.write_all(&buffer[..read])
                    .map_err(|e| StorageError::WriteFile {
                        path: dest.clone(),
                        source: e,
                    })?;
            }

            images.push(dest);
        }

        if images.len() < self.limits.min_images {
            return Err(ValidationError::TooFewInputs {
                min: self.limits.min_images,
                actual: images.len(),
            }
            .into());
        }

        Ok(StagedJob {
            layout: layout.clone(),
            images,
            total_bytes,
        })
    }

    /// Creates every stage directory of an existing workspace.
    ///
    /// Fails with `WorkspaceMissing` instead of recreating a workspace that
    /// was deleted.
    pub fn prepare(&self, job_id: &str) -> Result<WorkspaceLayout, StorageError> {
        let layout = self.layout(job_id);
        if !layout.root.is_dir() {
            return Err(StorageError::WorkspaceMissing(layout.root));
        }
        for dir in StageDir::ALL {
            ensure_directory(&layout.dir(dir))?;
        }
        Ok(layout)
    }

    /// Removes the workspace tree. Absent workspaces are not an error.
    pub fn destroy(&self, job_id: &str) -> Result<bool, StorageError> {
        let removed = remove_dir_if_exists(&self.layout(job_id).root)?;
        if removed {
            debug!(job_id, "Workspace removed");
        }
        Ok(removed)
    }

    /// Total bytes of regular files under the workspace.
    pub fn disk_usage(&self, job_id: &str) -> u64 {
        dir_size(&self.layout(job_id).root)
    }
}

/// Lower-cased extension of the client file name, `.jpg` when there is none.
/// Extensions that do not name an image type are rejected.
fn staged_extension(filename: Option<&str>) -> Result<String, ValidationError> {
    let extension = filename
        .and_then(|f| Path::new(f).extension())
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    let Some(extension) = extension else {
        return Ok(DEFAULT_IMAGE_EXTENSION.to_string());
    };

    let is_image = mime_guess::from_ext(&extension)
        .iter()
        .any(|m| m.type_() == mime_guess::mime::IMAGE);
    if !is_image {
        return Err(ValidationError::UnsupportedMedia {
            filename: filename.unwrap_or_default().to_string(),
        });
    }

    Ok(format!(".{}", extension))
}
