use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::options::JobOptions;
use crate::stages::error::StageError;
use crate::storage::StageDir;

/// Why an attempt was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    SoftTimeLimit,
    HardTimeLimit,
    Shutdown,
}

impl CancelReason {
    fn to_code(self) -> u8 {
        match self {
            CancelReason::SoftTimeLimit => 1,
            CancelReason::HardTimeLimit => 2,
            CancelReason::Shutdown => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(CancelReason::SoftTimeLimit),
            2 => Some(CancelReason::HardTimeLimit),
            3 => Some(CancelReason::Shutdown),
            _ => None,
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::SoftTimeLimit => write!(f, "soft time limit reached"),
            CancelReason::HardTimeLimit => write!(f, "hard time limit reached"),
            CancelReason::Shutdown => write!(f, "worker shutting down"),
        }
    }
}

/// Shared cancellation flag for one execution attempt.
///
/// Adapters poll it between units of work and while waiting on child
/// processes. The most recent reason wins.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    reason: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: CancelReason) {
        self.reason.store(reason.to_code(), Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason.load(Ordering::SeqCst) != 0
    }

    pub fn reason(&self) -> Option<CancelReason> {
        CancelReason::from_code(self.reason.load(Ordering::SeqCst))
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn check(&self) -> Result<(), StageError> {
        match self.reason() {
            Some(reason) => Err(StageError::Cancelled(reason.to_string())),
            None => Ok(()),
        }
    }
}

/// The input directories handed to a stage, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInputs {
    dirs: Vec<(StageDir, PathBuf)>,
}

impl StageInputs {
    pub fn new(dirs: Vec<(StageDir, PathBuf)>) -> Self {
        Self { dirs }
    }

    /// The first declared input.
    pub fn primary(&self) -> Option<&Path> {
        self.dirs.first().map(|(_, p)| p.as_path())
    }

    pub fn get(&self, dir: StageDir) -> Option<&Path> {
        self.dirs
            .iter()
            .find(|(d, _)| *d == dir)
            .map(|(_, p)| p.as_path())
    }

    pub fn require(&self, dir: StageDir) -> Result<&Path, StageError> {
        self.get(dir).ok_or(StageError::MissingInput(dir))
    }

    pub fn iter(&self) -> impl Iterator<Item = (StageDir, &Path)> {
        self.dirs.iter().map(|(d, p)| (*d, p.as_path()))
    }
}

/// Identity of the running stage, plus the attempt's cancellation flag.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: String,
    pub stage: &'static str,
    pub cancel: CancelToken,
}

/// What a stage left in its output directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageOutcome {
    pub produced: Vec<PathBuf>,
}

impl StageOutcome {
    pub fn from_dir(dir: &Path) -> Result<Self, StageError> {
        Ok(Self {
            produced: list_files(dir)?,
        })
    }
}

/// One black-box pipeline step: read the input directories, populate
/// `output_dir` with the well-known files the next stage expects.
pub trait StageAdapter: Send + Sync {
    fn run(
        &self,
        inputs: &StageInputs,
        output_dir: &Path,
        options: &JobOptions,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError>;
}

/// Regular, non-hidden files directly inside `dir`, sorted by name.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>, StageError> {
    let entries = std::fs::read_dir(dir).map_err(|e| StageError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| !n.starts_with('.'))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}
