//! Stage adapters that stand in for the external reconstruction tools.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use atlas::stages::context::list_files;
use atlas::stages::{
    StageAdapter, StageAdapters, StageContext, StageError, StageInputs, StageOutcome,
    StageRegistry,
};
use atlas::storage::StageDir;
use atlas::JobOptions;

use super::fixtures::minimal_glb;

/// One adapter invocation as seen by the adapter.
#[derive(Debug, Clone)]
pub struct StageCall {
    pub job_id: String,
    pub stage: &'static str,
    /// File names found in each input directory, in declaration order.
    pub inputs: Vec<(StageDir, Vec<String>)>,
    pub output_dir: PathBuf,
}

/// Shared record of every adapter invocation.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<StageCall>>>,
}

impl CallLog {
    pub fn record(&self, inputs: &StageInputs, output_dir: &Path, ctx: &StageContext) {
        let inputs = inputs
            .iter()
            .map(|(dir, path)| {
                let names = list_files(path)
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
                    .collect();
                (dir, names)
            })
            .collect();
        self.calls.lock().unwrap().push(StageCall {
            job_id: ctx.job_id.clone(),
            stage: ctx.stage,
            inputs,
            output_dir: output_dir.to_path_buf(),
        });
    }

    pub fn calls(&self) -> Vec<StageCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stages(&self) -> Vec<&'static str> {
        self.calls().iter().map(|c| c.stage).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn find(&self, stage: &str) -> Option<StageCall> {
        self.calls().into_iter().find(|c| c.stage == stage)
    }
}

/// Writes fixed files into the output directory.
pub struct WriteFiles {
    pub files: Vec<(&'static str, Vec<u8>)>,
    pub log: CallLog,
}

impl WriteFiles {
    pub fn new(log: &CallLog, files: Vec<(&'static str, Vec<u8>)>) -> Self {
        Self {
            files,
            log: log.clone(),
        }
    }
}

impl StageAdapter for WriteFiles {
    fn run(
        &self,
        inputs: &StageInputs,
        output_dir: &Path,
        _options: &JobOptions,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        self.log.record(inputs, output_dir, ctx);
        ctx.cancel.check()?;
        for (name, content) in &self.files {
            let path = output_dir.join(name);
            std::fs::write(&path, content).map_err(|e| StageError::Io { path, source: e })?;
        }
        StageOutcome::from_dir(output_dir)
    }
}

/// Copies every file of the primary input into the output directory.
pub struct CopyInputs {
    pub log: CallLog,
}

impl StageAdapter for CopyInputs {
    fn run(
        &self,
        inputs: &StageInputs,
        output_dir: &Path,
        _options: &JobOptions,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        self.log.record(inputs, output_dir, ctx);
        let Some(primary) = inputs.primary() else {
            return Err(StageError::MissingInput(StageDir::Images));
        };
        for file in list_files(primary)? {
            let Some(name) = file.file_name() else {
                continue;
            };
            let dest = output_dir.join(name);
            std::fs::copy(&file, &dest).map_err(|e| StageError::Io {
                path: dest.clone(),
                source: e,
            })?;
        }
        StageOutcome::from_dir(output_dir)
    }
}

/// Fails like an external tool exiting non-zero.
pub struct FailingTool {
    pub program: &'static str,
    pub stderr: &'static str,
    pub log: CallLog,
}

impl StageAdapter for FailingTool {
    fn run(
        &self,
        inputs: &StageInputs,
        output_dir: &Path,
        _options: &JobOptions,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        self.log.record(inputs, output_dir, ctx);
        Err(StageError::ToolFailed {
            program: self.program.to_string(),
            status: "exit status: 1".to_string(),
            stderr: self.stderr.to_string(),
        })
    }
}

/// Reports an output missing from its (absolute) output directory.
pub struct MissingOutput {
    pub log: CallLog,
}

impl StageAdapter for MissingOutput {
    fn run(
        &self,
        inputs: &StageInputs,
        output_dir: &Path,
        _options: &JobOptions,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        self.log.record(inputs, output_dir, ctx);
        Err(StageError::MissingOutput {
            pattern: "*.ply".to_string(),
            dir: output_dir.to_path_buf(),
        })
    }
}

/// Polls for cancellation, giving up after `max_wait`.
pub struct BlockUntilCancel {
    pub max_wait: Duration,
    pub log: CallLog,
}

impl StageAdapter for BlockUntilCancel {
    fn run(
        &self,
        inputs: &StageInputs,
        output_dir: &Path,
        _options: &JobOptions,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        self.log.record(inputs, output_dir, ctx);
        let started = Instant::now();
        while started.elapsed() < self.max_wait {
            ctx.cancel.check()?;
            thread::sleep(Duration::from_millis(5));
        }
        Ok(StageOutcome::default())
    }
}

/// Sleeps without looking at the cancellation flag.
pub struct Unresponsive {
    pub duration: Duration,
    pub log: CallLog,
}

impl StageAdapter for Unresponsive {
    fn run(
        &self,
        inputs: &StageInputs,
        output_dir: &Path,
        _options: &JobOptions,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        self.log.record(inputs, output_dir, ctx);
        thread::sleep(self.duration);
        Ok(StageOutcome::default())
    }
}

/// Deletes the job's status record behind the executor's back.
pub struct DeletesStatus {
    pub status_dir: PathBuf,
    pub log: CallLog,
}

impl StageAdapter for DeletesStatus {
    fn run(
        &self,
        inputs: &StageInputs,
        output_dir: &Path,
        _options: &JobOptions,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        self.log.record(inputs, output_dir, ctx);
        let path = self.status_dir.join(format!("{}.json", ctx.job_id));
        std::fs::remove_file(&path).map_err(|e| StageError::Io { path, source: e })?;
        Ok(StageOutcome::default())
    }
}

/// Runs `hook` with the job id in place of a tool.
pub struct RunHook {
    hook: Box<dyn Fn(&str) -> Result<(), StageError> + Send + Sync>,
    log: CallLog,
}

impl RunHook {
    pub fn new<F>(log: &CallLog, hook: F) -> Self
    where
        F: Fn(&str) -> Result<(), StageError> + Send + Sync + 'static,
    {
        Self {
            hook: Box::new(hook),
            log: log.clone(),
        }
    }
}

impl StageAdapter for RunHook {
    fn run(
        &self,
        inputs: &StageInputs,
        output_dir: &Path,
        _options: &JobOptions,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        self.log.record(inputs, output_dir, ctx);
        (self.hook)(&ctx.job_id)?;
        Ok(StageOutcome::default())
    }
}

/// Fake tools for the standard five-stage topology. Each stage writes the
/// file its successor expects; export writes a one-triangle GLB.
pub fn fake_adapters(log: &CallLog) -> StageAdapters {
    StageAdapters {
        segmentation: Arc::new(CopyInputs { log: log.clone() }),
        sparse: Arc::new(WriteFiles::new(log, vec![("cameras.txt", b"1 PINHOLE".to_vec())])),
        dense: Arc::new(WriteFiles::new(log, vec![("fused.ply", b"ply".to_vec())])),
        mesh: Arc::new(WriteFiles::new(log, vec![("mesh.ply", b"ply".to_vec())])),
        export: Arc::new(WriteFiles::new(log, vec![("model.glb", minimal_glb())])),
    }
}

pub fn fake_registry(log: &CallLog) -> StageRegistry {
    StageRegistry::standard(fake_adapters(log))
}

/// The fake topology with the dense stage replaced by `dense`.
pub fn registry_with_dense(log: &CallLog, dense: Arc<dyn StageAdapter>) -> StageRegistry {
    StageRegistry::standard(StageAdapters {
        dense,
        ..fake_adapters(log)
    })
}

/// The fake topology with the segmentation stage replaced by `segmentation`.
pub fn registry_with_segmentation(
    log: &CallLog,
    segmentation: Arc<dyn StageAdapter>,
) -> StageRegistry {
    StageRegistry::standard(StageAdapters {
        segmentation,
        ..fake_adapters(log)
    })
}
