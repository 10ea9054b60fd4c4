use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Root of the status, workspace, artifact and queue trees.
    /// Resolved against the platform data directory when absent.
    #[serde(default)]
    pub storage_root: Option<PathBuf>,
    #[serde(default)]
    pub limits: UploadLimits,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub workspace_ttl_hours: Option<u64>,
    #[serde(default)]
    pub segmentation: SegmentationSettings,
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Settings {
    /// The configured storage root, or `<data dir>/atlas`.
    pub fn resolved_storage_root(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage_root {
            Some(root) => Ok(root.clone()),
            None => dirs::data_dir()
                .map(|dir| dir.join("atlas"))
                .ok_or(ConfigError::NoStorageRoot),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadLimits {
    #[serde(default = "default_min_images")]
    pub min_images: usize,
    #[serde(default = "default_max_images")]
    pub max_images: usize,
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,
}

fn default_min_images() -> usize {
    3
}

fn default_max_images() -> usize {
    200
}

fn default_max_upload_mb() -> u64 {
    500
}

impl UploadLimits {
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            min_images: default_min_images(),
            max_images: default_max_images(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_hard_limit")]
    pub hard_time_limit_secs: u64,
    #[serde(default = "default_soft_limit")]
    pub soft_time_limit_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_lease_grace")]
    pub lease_grace_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_hard_limit() -> u64 {
    7200
}

fn default_soft_limit() -> u64 {
    6600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_lease_grace() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    500
}

impl WorkerSettings {
    pub fn hard_time_limit(&self) -> Duration {
        Duration::from_secs(self.hard_time_limit_secs)
    }

    pub fn soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.soft_time_limit_secs)
    }

    pub fn lease_grace(&self) -> Duration {
        Duration::from_secs(self.lease_grace_secs)
    }

    /// Lifetime of a job lease: the hard limit plus the grace period.
    pub fn lease_ttl(&self) -> Duration {
        self.hard_time_limit() + self.lease_grace()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            hard_time_limit_secs: default_hard_limit(),
            soft_time_limit_secs: default_soft_limit(),
            max_attempts: default_max_attempts(),
            lease_grace_secs: default_lease_grace(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SegmentationSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// An external program invocation. `args` may contain `{input}`,
/// `{input.<dir>}`, `{output}` and `{option.<key>}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Glob patterns relative to the output directory. Each must match at
    /// least one file after a successful run; `|` separates alternatives.
    #[serde(default)]
    pub expected_outputs: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: &str, args: &[&str], expected_outputs: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
            expected_outputs: expected_outputs.iter().map(|o| o.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_segmentation_tool")]
    pub segmentation: ToolCommand,
    #[serde(default = "default_sparse_tool")]
    pub sparse: ToolCommand,
    #[serde(default = "default_dense_tool")]
    pub dense: ToolCommand,
    #[serde(default = "default_mesh_tool")]
    pub mesh: ToolCommand,
    #[serde(default = "default_export_tool")]
    pub export: ToolCommand,
}

fn default_segmentation_tool() -> ToolCommand {
    ToolCommand::new(
        "atlas-sam",
        &["--images", "{input}", "--output", "{output}"],
        &["*"],
    )
}

fn default_sparse_tool() -> ToolCommand {
    ToolCommand::new(
        "openmvg-sfm",
        &[
            "--images",
            "{input.images}",
            "--masks",
            "{input.masks}",
            "--output",
            "{output}",
            "--quality",
            "{option.quality}",
        ],
        &["sfm_data.json"],
    )
}

fn default_dense_tool() -> ToolCommand {
    ToolCommand::new(
        "openmvs-densify",
        &[
            "--sparse",
            "{input.sparse}",
            "--images",
            "{input.images}",
            "--output",
            "{output}",
            "--resolution-level",
            "{option.resolution_level}",
        ],
        &["scene_dense.mvs"],
    )
}

fn default_mesh_tool() -> ToolCommand {
    ToolCommand::new(
        "openmvs-mesh",
        &["--input", "{input}", "--output", "{output}"],
        &["*.ply|*.obj"],
    )
}

fn default_export_tool() -> ToolCommand {
    ToolCommand::new(
        "atlas-export",
        &[
            "--mesh",
            "{input}",
            "--output",
            "{output}",
            "--target-triangles",
            "{option.target_triangles}",
            "--max-texture-size",
            "{option.max_texture_size}",
        ],
        &["model.glb"],
    )
}

impl ToolSettings {
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &ToolCommand)> {
        [
            ("segmentation", &self.segmentation),
            ("sparse", &self.sparse),
            ("dense", &self.dense),
            ("mesh", &self.mesh),
            ("export", &self.export),
        ]
        .into_iter()
    }
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            segmentation: default_segmentation_tool(),
            sparse: default_sparse_tool(),
            dense: default_dense_tool(),
            mesh: default_mesh_tool(),
            export: default_export_tool(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingSettings {
    #[serde(default)]
    pub format: LogFormat,
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default)]
    pub filter: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.limits, UploadLimits::default());
        assert_eq!(settings.limits.min_images, 3);
        assert_eq!(settings.limits.max_images, 200);
        assert_eq!(settings.worker.hard_time_limit_secs, 7200);
        assert_eq!(settings.worker.soft_time_limit_secs, 6600);
        assert_eq!(settings.worker.max_attempts, 3);
        assert!(settings.worker.count >= 1);
        assert!(settings.segmentation.enabled);
        assert!(settings.workspace_ttl_hours.is_none());
        assert_eq!(settings.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_explicit_storage_root_wins() {
        let settings = Settings {
            storage_root: Some(PathBuf::from("/srv/atlas")),
            ..Settings::default()
        };
        assert_eq!(
            settings.resolved_storage_root().unwrap(),
            PathBuf::from("/srv/atlas")
        );
    }

    #[test]
    fn test_max_upload_bytes() {
        let limits = UploadLimits {
            min_images: 1,
            max_images: 2,
            max_upload_mb: 3,
        };
        assert_eq!(limits.max_upload_bytes(), 3 * 1024 * 1024);
    }

    #[test]
    fn test_lease_ttl_is_hard_limit_plus_grace() {
        let worker = WorkerSettings {
            hard_time_limit_secs: 100,
            lease_grace_secs: 20,
            ..WorkerSettings::default()
        };
        assert_eq!(worker.lease_ttl(), Duration::from_secs(120));
    }

    #[test]
    fn test_partial_tool_override_keeps_other_defaults() {
        let json = r#"{"tools": {"mesh": {"program": "my-mesher", "args": ["{input}", "{output}"]}}}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.tools.mesh.program, "my-mesher");
        assert!(settings.tools.mesh.expected_outputs.is_empty());
        assert_eq!(settings.tools.export.program, "atlas-export");
    }
}
