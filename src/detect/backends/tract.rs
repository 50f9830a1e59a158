#![cfg(feature = "backend-tract")]

//! ONNX face detection and embedding via tract.
//!
//! The detector expects an UltraFace-style model: input `1x3xHxW` normalised
//! as `(p - 127) / 128`, outputs `scores [1, N, 2]` and `boxes [1, N, 4]` with
//! corner coordinates in `0..1`. Higher `upsample` values split the frame into
//! `2^n x 2^n` tiles, so small faces cover more of the model input.
//!
//! The encoder expects a `1x3xSxS` face crop normalised as `(p - 127.5) / 128`
//! and produces a `1x128` embedding.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{FaceDetector, FaceEncoder};
use crate::detect::result::FaceBox;
use crate::identity::EMBEDDING_DIM;

type Plan = TypedRunnableModel<TypedModel>;

const NMS_IOU: f32 = 0.3;
/// Upper bound on tiling so a misconfigured boost cannot explode the cost.
const MAX_UPSAMPLE: u32 = 2;
/// Extra context around the detected box before encoding.
const CROP_MARGIN: f32 = 0.15;

fn load_plan(model_path: &Path, width: usize, height: usize) -> Result<Plan> {
    tract_onnx::onnx()
        .model_for_path(model_path)
        .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
        .with_input_fact(
            0,
            InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, height, width)),
        )
        .context("failed to set input fact")?
        .into_optimized()
        .context("failed to optimize ONNX model")?
        .into_runnable()
        .context("failed to build runnable ONNX model")
}

/// Region of the source frame in pixel coordinates.
#[derive(Clone, Copy, Debug)]
struct Region {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
}

/// Nearest-neighbour resample of `region` into a normalised CHW tensor.
fn region_to_tensor(
    pixels: &[u8],
    frame_width: u32,
    region: Region,
    out_w: usize,
    out_h: usize,
    mean: f32,
    scale: f32,
) -> Tensor {
    let frame_width = frame_width as usize;
    let input = tract_ndarray::Array4::from_shape_fn((1, 3, out_h, out_w), |(_, c, y, x)| {
        let sx = region.x as usize + x * region.w as usize / out_w;
        let sy = region.y as usize + y * region.h as usize / out_h;
        let idx = (sy * frame_width + sx) * 3 + c;
        (pixels[idx] as f32 - mean) / scale
    });
    input.into_tensor()
}

fn check_frame(pixels: &[u8], width: u32, height: u32) -> Result<()> {
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
    if pixels.len() != expected || width == 0 || height == 0 {
        return Err(anyhow!(
            "expected {} RGB bytes for {}x{}, received {}",
            expected,
            width,
            height,
            pixels.len()
        ));
    }
    Ok(())
}

// -------------------- Detector --------------------

pub struct TractFaceDetector {
    model: Plan,
    input_width: usize,
    input_height: usize,
    score_threshold: f32,
}

impl TractFaceDetector {
    /// Load a detector model with a fixed `input_width`x`input_height` input.
    pub fn new<P: AsRef<Path>>(model_path: P, input_width: u32, input_height: u32) -> Result<Self> {
        let model = load_plan(
            model_path.as_ref(),
            input_width as usize,
            input_height as usize,
        )?;
        Ok(Self {
            model,
            input_width: input_width as usize,
            input_height: input_height as usize,
            score_threshold: 0.7,
        })
    }

    fn detect_region(&self, pixels: &[u8], frame_width: u32, region: Region) -> Result<Vec<(FaceBox, f32)>> {
        let input = region_to_tensor(
            pixels,
            frame_width,
            region,
            self.input_width,
            self.input_height,
            127.0,
            128.0,
        );
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("face detector inference failed")?;
        if outputs.len() < 2 {
            return Err(anyhow!("face detector produced {} outputs, expected 2", outputs.len()));
        }
        let scores = outputs[0]
            .to_array_view::<f32>()
            .context("detector scores were not f32")?;
        let boxes = outputs[1]
            .to_array_view::<f32>()
            .context("detector boxes were not f32")?;
        let scores = scores
            .as_slice()
            .ok_or_else(|| anyhow!("detector scores are not contiguous"))?;
        let boxes = boxes
            .as_slice()
            .ok_or_else(|| anyhow!("detector boxes are not contiguous"))?;

        let mut found = Vec::new();
        for (i, pair) in scores.chunks_exact(2).enumerate() {
            let score = pair[1];
            if score < self.score_threshold {
                continue;
            }
            let Some(b) = boxes.get(i * 4..i * 4 + 4) else {
                break;
            };
            let to_x = |v: f32| region.x + (v.clamp(0.0, 1.0) * region.w as f32) as u32;
            let to_y = |v: f32| region.y + (v.clamp(0.0, 1.0) * region.h as f32) as u32;
            found.push((FaceBox::new(to_y(b[1]), to_x(b[2]), to_y(b[3]), to_x(b[0])), score));
        }
        Ok(found)
    }
}

/// Greedy non-maximum suppression, highest score first.
fn non_max_suppression(mut candidates: Vec<(FaceBox, f32)>, iou: f32) -> Vec<FaceBox> {
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut kept: Vec<FaceBox> = Vec::new();
    for (candidate, _) in candidates {
        if kept.iter().all(|k| k.iou(&candidate) < iou) {
            kept.push(candidate);
        }
    }
    kept
}

/// Tiles covering a `width`x`height` frame for the given upsample level.
fn tiles(width: u32, height: u32, upsample: u32) -> Vec<Region> {
    let per_side = 1u32 << upsample.min(MAX_UPSAMPLE);
    let tile_w = width / per_side;
    let tile_h = height / per_side;
    if tile_w == 0 || tile_h == 0 {
        return vec![Region {
            x: 0,
            y: 0,
            w: width,
            h: height,
        }];
    }
    let mut out = Vec::new();
    for row in 0..per_side {
        for col in 0..per_side {
            let x = col * tile_w;
            let y = row * tile_h;
            // Last row and column absorb the remainder.
            let w = if col + 1 == per_side { width - x } else { tile_w };
            let h = if row + 1 == per_side { height - y } else { tile_h };
            out.push(Region { x, y, w, h });
        }
    }
    out
}

impl FaceDetector for TractFaceDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        upsample: u32,
    ) -> Result<Vec<FaceBox>> {
        check_frame(pixels, width, height)?;
        let mut candidates = Vec::new();
        for region in tiles(width, height, upsample) {
            candidates.extend(self.detect_region(pixels, width, region)?);
        }
        Ok(non_max_suppression(candidates, NMS_IOU))
    }

    fn warm_up(&mut self) -> Result<()> {
        let w = self.input_width as u32;
        let h = self.input_height as u32;
        let blank = vec![0u8; w as usize * h as usize * 3];
        self.detect(&blank, w, h, 0).map(|_| ())
    }
}

// -------------------- Encoder --------------------

pub struct TractFaceEncoder {
    model: Plan,
    input_size: usize,
}

impl TractFaceEncoder {
    /// Load an embedding model with a square `input_size` input.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let size = input_size as usize;
        Ok(Self {
            model: load_plan(model_path.as_ref(), size, size)?,
            input_size: size,
        })
    }
}

/// Square crop around `face` with a margin, clamped to the frame.
fn face_crop(face: &FaceBox, width: u32, height: u32) -> Option<Region> {
    let side = face.width().max(face.height()) as f32 * (1.0 + 2.0 * CROP_MARGIN);
    let cx = (face.left + face.right) as f32 / 2.0;
    let cy = (face.top + face.bottom) as f32 / 2.0;
    let x0 = (cx - side / 2.0).max(0.0) as u32;
    let y0 = (cy - side / 2.0).max(0.0) as u32;
    let x1 = ((cx + side / 2.0) as u32).min(width);
    let y1 = ((cy + side / 2.0) as u32).min(height);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(Region {
        x: x0,
        y: y0,
        w: x1 - x0,
        h: y1 - y0,
    })
}

impl FaceEncoder for TractFaceEncoder {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn encode(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        face: &FaceBox,
    ) -> Result<Vec<f32>> {
        check_frame(pixels, width, height)?;
        let region = face_crop(face, width, height)
            .ok_or_else(|| anyhow!("face box {:?} is empty after clamping", face))?;
        let input = region_to_tensor(
            pixels,
            width,
            region,
            self.input_size,
            self.input_size,
            127.5,
            128.0,
        );
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("face encoder inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("face encoder produced no outputs"))?;
        let values: Vec<f32> = output
            .to_array_view::<f32>()
            .context("embedding tensor was not f32")?
            .iter()
            .copied()
            .collect();
        if values.len() != EMBEDDING_DIM {
            return Err(anyhow!(
                "encoder produced {} values, expected {}",
                values.len(),
                EMBEDDING_DIM
            ));
        }
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return Err(anyhow!("encoder produced a zero embedding"));
        }
        Ok(values.into_iter().map(|v| v / norm).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiles_cover_frame_without_gaps() {
        let regions = tiles(641, 481, 1);
        assert_eq!(regions.len(), 4);
        let area: u64 = regions.iter().map(|r| r.w as u64 * r.h as u64).sum();
        assert_eq!(area, 641 * 481);
    }

    #[test]
    fn nms_drops_overlapping_lower_scores() {
        let kept = non_max_suppression(
            vec![
                (FaceBox::new(0, 100, 100, 0), 0.8),
                (FaceBox::new(2, 102, 102, 2), 0.95),
                (FaceBox::new(200, 300, 300, 200), 0.75),
            ],
            NMS_IOU,
        );
        assert_eq!(kept, vec![FaceBox::new(2, 102, 102, 2), FaceBox::new(200, 300, 300, 200)]);
    }

    #[test]
    fn crop_is_clamped_to_frame() {
        let region = face_crop(&FaceBox::new(0, 50, 50, 0), 40, 40).unwrap();
        assert_eq!((region.x, region.y), (0, 0));
        assert!(region.w <= 40 && region.h <= 40);
    }
}
