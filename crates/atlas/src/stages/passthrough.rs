//! Identity masks for runs without segmentation.

use std::path::Path;

use image::{GrayImage, Luma};
use tracing::debug;

use crate::options::JobOptions;
use crate::stages::context::{list_files, StageAdapter, StageContext, StageInputs, StageOutcome};
use crate::stages::error::StageError;
use crate::storage::StageDir;

/// Writes a fully white single-channel mask for every staged image, with
/// the image's dimensions and file name, so downstream stages see every
/// pixel as foreground.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughMaskAdapter;

impl StageAdapter for PassthroughMaskAdapter {
    fn run(
        &self,
        inputs: &StageInputs,
        output_dir: &Path,
        _options: &JobOptions,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        let images_dir = inputs.require(StageDir::Images)?;
        let images = list_files(images_dir)?;
        if images.is_empty() {
            return Err(StageError::NoInputs(images_dir.to_path_buf()));
        }

        let mut produced = Vec::with_capacity(images.len());
        for image_path in images {
            ctx.cancel.check()?;

            let (width, height) =
                image::image_dimensions(&image_path).map_err(|e| StageError::Image {
                    path: image_path.clone(),
                    source: e,
                })?;
            let mask = GrayImage::from_pixel(width, height, Luma([255u8]));

            let Some(file_name) = image_path.file_name() else {
                continue;
            };
            let mask_path = output_dir.join(file_name);
            mask.save(&mask_path).map_err(|e| StageError::Image {
                path: mask_path.clone(),
                source: e,
            })?;
            produced.push(mask_path);
        }

        debug!(job_id = %ctx.job_id, masks = produced.len(), "Wrote passthrough masks");
        Ok(StageOutcome { produced })
    }
}
