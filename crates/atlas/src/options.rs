//! Typed job options, validated once at submission.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

const OPTIONS_SCHEMA_JSON: &str = include_str!("../../../schema/options-v1.json");

static OPTIONS_SCHEMA: LazyLock<Value> =
    LazyLock::new(|| serde_json::from_str(OPTIONS_SCHEMA_JSON).unwrap_or(Value::Bool(true)));

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobOptions {
    #[serde(default)]
    pub quality: Quality,
    #[serde(default = "default_resolution_level")]
    pub resolution_level: u8,
    #[serde(default = "default_target_triangles")]
    pub target_triangles: u32,
    #[serde(default = "default_max_texture_size")]
    pub max_texture_size: u32,
    #[serde(default = "default_true")]
    pub enable_segmentation: bool,
    /// Keys this crate does not interpret; kept so they echo back unchanged.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_resolution_level() -> u8 {
    1
}

fn default_target_triangles() -> u32 {
    100_000
}

fn default_max_texture_size() -> u32 {
    2048
}

fn default_true() -> bool {
    true
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            quality: Quality::default(),
            resolution_level: default_resolution_level(),
            target_triangles: default_target_triangles(),
            max_texture_size: default_max_texture_size(),
            enable_segmentation: true,
            extra: BTreeMap::new(),
        }
    }
}

impl JobOptions {
    /// Parses and validates a raw options document. An empty or
    /// whitespace-only document yields the defaults.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        Self::parse_document(raw).map(|(options, _)| options)
    }

    /// Like [`parse`](Self::parse), also returning the document as the
    /// client sent it (`{}` when empty) for echoing in status records.
    pub fn parse_document(raw: &str) -> Result<(Self, Value), ValidationError> {
        if raw.trim().is_empty() {
            return Ok((Self::default(), Value::Object(Default::default())));
        }
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ValidationError::InvalidOptions(format!("malformed JSON: {}", e)))?;
        let options = Self::from_value(value.clone())?;
        Ok((options, value))
    }

    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        if !value.is_object() {
            return Err(ValidationError::InvalidOptions(
                "options must be a JSON object".to_string(),
            ));
        }

        let validator = jsonschema::validator_for(&OPTIONS_SCHEMA)
            .map_err(|e| ValidationError::InvalidOptions(format!("schema unavailable: {}", e)))?;
        let errors: Vec<String> = validator.iter_errors(&value).map(|e| e.to_string()).collect();
        if !errors.is_empty() {
            return Err(ValidationError::InvalidOptions(errors.join("; ")));
        }

        serde_json::from_value(value).map_err(|e| ValidationError::InvalidOptions(e.to_string()))
    }

    /// Serialized form echoed back in status records.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Looks up an option by key as a command-line argument string.
    pub fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "quality" => Some(self.quality.as_str().to_string()),
            "resolution_level" => Some(self.resolution_level.to_string()),
            "target_triangles" => Some(self.target_triangles.to_string()),
            "max_texture_size" => Some(self.max_texture_size.to_string()),
            "enable_segmentation" => Some(self.enable_segmentation.to_string()),
            other => self.extra.get(other).map(|v| match v {
                Value::String(s) => s.clone(),
                v => v.to_string(),
            }),
        }
    }
}
