pub mod loader;
pub mod schema;

pub use loader::{apply_env_overrides, load_settings, load_settings_from_str};
pub use schema::{
    LogFormat, LoggingSettings, SegmentationSettings, Settings, ToolCommand, ToolSettings,
    UploadLimits, WorkerSettings,
};
