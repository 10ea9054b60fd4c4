use std::path::{Path, PathBuf};

use crate::config::schema::{LogFormat, Settings};
use crate::error::ConfigError;
use crate::stages::command::validate_template;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub const ENV_STORAGE_ROOT: &str = "ATLAS_STORAGE_ROOT";
pub const ENV_WORKER_COUNT: &str = "ATLAS_WORKER_COUNT";
pub const ENV_LOG_FORMAT: &str = "ATLAS_LOG_FORMAT";

pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_settings_from_str(&content)
}

pub fn load_settings_from_str(content: &str) -> Result<Settings, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let settings: Settings = serde_json::from_value(json_value)?;

    validate_settings(&settings)?;

    Ok(settings)
}

/// Applies `ATLAS_*` environment overrides on top of file or default settings,
/// then re-runs semantic validation.
pub fn apply_env_overrides(settings: &mut Settings) -> Result<(), ConfigError> {
    if let Ok(root) = std::env::var(ENV_STORAGE_ROOT) {
        if !root.trim().is_empty() {
            settings.storage_root = Some(PathBuf::from(root));
        }
    }

    if let Ok(count) = std::env::var(ENV_WORKER_COUNT) {
        settings.worker.count = match count.trim().parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(ConfigError::InvalidEnv {
                    name: ENV_WORKER_COUNT,
                    value: count,
                })
            }
        };
    }

    if let Ok(format) = std::env::var(ENV_LOG_FORMAT) {
        settings.logging.format = match format.trim().to_ascii_lowercase().as_str() {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            _ => {
                return Err(ConfigError::InvalidEnv {
                    name: ENV_LOG_FORMAT,
                    value: format,
                })
            }
        };
    }

    validate_settings(settings)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    let limits = &settings.limits;
    if limits.min_images == 0 || limits.min_images > limits.max_images {
        return Err(ConfigError::Validation {
            message: format!(
                "limits.min_images ({}) must be between 1 and limits.max_images ({})",
                limits.min_images, limits.max_images
            ),
        });
    }

    let worker = &settings.worker;
    if worker.count == 0 {
        return Err(ConfigError::Validation {
            message: "worker.count must be at least 1".to_string(),
        });
    }
    if worker.soft_time_limit_secs >= worker.hard_time_limit_secs {
        return Err(ConfigError::Validation {
            message: format!(
                "worker.soft_time_limit_secs ({}) must be below worker.hard_time_limit_secs ({})",
                worker.soft_time_limit_secs, worker.hard_time_limit_secs
            ),
        });
    }
    if worker.max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "worker.max_attempts must be at least 1".to_string(),
        });
    }

    for (stage, tool) in settings.tools.iter() {
        validate_template(tool).map_err(|reason| ConfigError::InvalidTool {
            stage: stage.to_string(),
            reason,
        })?;
    }

    Ok(())
}
