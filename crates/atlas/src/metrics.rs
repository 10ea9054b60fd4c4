//! Terminal QA metrics read from the published GLB artifact.
//!
//! Computation is best effort: anything that cannot be parsed leaves the
//! corresponding metric at its default and never fails the job.

use std::io::Cursor;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::sanitize;
use crate::status::bytes_to_mb;

const GLB_MAGIC: &[u8; 4] = b"glTF";
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;
const MODE_TRIANGLES: u64 = 4;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EstimatedQuality {
    #[default]
    Low,
    Medium,
    High,
}

impl EstimatedQuality {
    pub fn from_triangles(triangles: u64) -> Self {
        if triangles > 50_000 {
            EstimatedQuality::High
        } else if triangles > 10_000 {
            EstimatedQuality::Medium
        } else {
            EstimatedQuality::Low
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
    pub size: [f64; 3],
}

impl BoundingBox {
    fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        let size = [max[0] - min[0], max[1] - min[1], max[2] - min[2]];
        Self { min, max, size }
    }

    fn union(&self, other: &BoundingBox) -> BoundingBox {
        let mut min = self.min;
        let mut max = self.max;
        for axis in 0..3 {
            min[axis] = min[axis].min(other.min[axis]);
            max[axis] = max[axis].max(other.max[axis]);
        }
        BoundingBox::new(min, max)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextureSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QaMetrics {
    #[serde(default)]
    pub file_size_mb: f64,
    #[serde(default)]
    pub triangle_count: u64,
    #[serde(default)]
    pub vertex_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
    #[serde(default)]
    pub texture_count: usize,
    /// Dimensions of the first embedded texture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texture_size: Option<TextureSize>,
    #[serde(default)]
    pub estimated_quality: EstimatedQuality,
    /// Disk footprint of the job workspace at completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_size_mb: Option<f64>,
}

#[derive(Error, Debug)]
enum GlbError {
    #[error("file is not a GLB container")]
    BadMagic,

    #[error("unsupported glTF container version {0}")]
    Version(u32),

    #[error("truncated GLB")]
    Truncated,

    #[error("first chunk is not JSON")]
    MissingJson,

    #[error("invalid glTF JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Metrics for `artifact`, plus the workspace footprint when known.
/// Returns `None` only when the artifact itself cannot be stat'ed.
pub fn compute(artifact: &Path, workspace_bytes: Option<u64>) -> Option<QaMetrics> {
    let size = match std::fs::metadata(artifact) {
        Ok(meta) => meta.len(),
        Err(e) => {
            warn!(file = %sanitize::redact_path(artifact), error = %e, "Artifact not readable for metrics");
            return None;
        }
    };

    let mut metrics = QaMetrics {
        file_size_mb: bytes_to_mb(size),
        ..QaMetrics::default()
    };

    match std::fs::read(artifact)
        .map_err(|e| e.to_string())
        .and_then(|bytes| analyze(&bytes).map_err(|e| e.to_string()))
    {
        Ok(analysis) => {
            metrics.triangle_count = analysis.triangles;
            metrics.vertex_count = analysis.vertices;
            metrics.bounding_box = analysis.bounds;
            metrics.texture_count = analysis.texture_count;
            metrics.texture_size = analysis.texture_size;
            metrics.estimated_quality = EstimatedQuality::from_triangles(analysis.triangles);
        }
        Err(e) => warn!(error = %e, "Could not analyze GLB, reporting file size only"),
    }

    metrics.workspace_size_mb = workspace_bytes.map(bytes_to_mb);

    debug!(
        triangles = metrics.triangle_count,
        vertices = metrics.vertex_count,
        quality = ?metrics.estimated_quality,
        "Computed QA metrics"
    );
    Some(metrics)
}

#[derive(Debug, Default)]
struct Analysis {
    triangles: u64,
    vertices: u64,
    bounds: Option<BoundingBox>,
    texture_count: usize,
    texture_size: Option<TextureSize>,
}

struct Chunks<'a> {
    json: &'a [u8],
    bin: Option<&'a [u8]>,
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, GlbError> {
    let slice = bytes.get(offset..offset + 4).ok_or(GlbError::Truncated)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn split_chunks(bytes: &[u8]) -> Result<Chunks<'_>, GlbError> {
    if bytes.get(0..4) != Some(&GLB_MAGIC[..]) {
        return Err(GlbError::BadMagic);
    }
    let version = read_u32(bytes, 4)?;
    if version != 2 {
        return Err(GlbError::Version(version));
    }
    let total = (read_u32(bytes, 8)? as usize).min(bytes.len());

    let mut offset = 12;
    let mut json = None;
    let mut bin = None;
    while offset + 8 <= total {
        let length = read_u32(bytes, offset)? as usize;
        let kind = read_u32(bytes, offset + 4)?;
        let start = offset + 8;
        let data = bytes.get(start..start + length).ok_or(GlbError::Truncated)?;
        match kind {
            CHUNK_JSON if json.is_none() => json = Some(data),
            CHUNK_BIN if bin.is_none() => bin = Some(data),
            _ => {}
        }
        offset = start + length;
    }

    Ok(Chunks {
        json: json.ok_or(GlbError::MissingJson)?,
        bin,
    })
}

fn analyze(bytes: &[u8]) -> Result<Analysis, GlbError> {
    let chunks = split_chunks(bytes)?;
    let gltf: Value = serde_json::from_slice(chunks.json)?;
    let accessors = gltf["accessors"].as_array().cloned().unwrap_or_default();
    let accessor_count = |index: &Value| {
        accessor(&accessors, index)
            .and_then(|a| a["count"].as_u64())
            .unwrap_or(0)
    };

    let mut analysis = Analysis::default();
    let primitives = gltf["meshes"]
        .as_array()
        .into_iter()
        .flatten()
        .flat_map(|mesh| mesh["primitives"].as_array().cloned().unwrap_or_default());

    for primitive in primitives {
        let position = &primitive["attributes"]["POSITION"];
        let vertices = accessor_count(position);
        analysis.vertices += vertices;

        let mode = primitive["mode"].as_u64().unwrap_or(MODE_TRIANGLES);
        if mode == MODE_TRIANGLES {
            let corners = match primitive.get("indices") {
                Some(indices) => accessor_count(indices),
                None => vertices,
            };
            analysis.triangles += corners / 3;
        }

        let bounds = accessor(&accessors, position).and_then(accessor_bounds);
        analysis.bounds = match (analysis.bounds.take(), bounds) {
            (Some(acc), Some(b)) => Some(acc.union(&b)),
            (acc, b) => acc.or(b),
        };
    }

    let images = gltf["images"].as_array().cloned().unwrap_or_default();
    analysis.texture_count = gltf["textures"]
        .as_array()
        .map(|t| t.len())
        .unwrap_or(images.len());
    analysis.texture_size = images
        .first()
        .and_then(|image| embedded_image_size(&gltf, image, chunks.bin));

    Ok(analysis)
}

fn accessor<'a>(accessors: &'a [Value], index: &Value) -> Option<&'a Value> {
    accessors.get(usize::try_from(index.as_u64()?).ok()?)
}

fn accessor_bounds(accessor: &Value) -> Option<BoundingBox> {
    let axis = |v: &Value| -> Option<[f64; 3]> {
        let values = v.as_array()?;
        if values.len() < 3 {
            return None;
        }
        Some([values[0].as_f64()?, values[1].as_f64()?, values[2].as_f64()?])
    };
    Some(BoundingBox::new(
        axis(&accessor["min"])?,
        axis(&accessor["max"])?,
    ))
}

/// Decodes only the header of an image stored in the BIN chunk.
fn embedded_image_size(gltf: &Value, image: &Value, bin: Option<&[u8]>) -> Option<TextureSize> {
    let bin = bin?;
    let view = &gltf["bufferViews"][image["bufferView"].as_u64()? as usize];
    let offset = view["byteOffset"].as_u64().unwrap_or(0) as usize;
    let length = view["byteLength"].as_u64()? as usize;
    let data = bin.get(offset..offset.checked_add(length)?)?;

    let (width, height) = image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()?;
    Some(TextureSize { width, height })
}
