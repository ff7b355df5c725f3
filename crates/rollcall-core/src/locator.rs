//! UltraFace face locator via ONNX Runtime.
//!
//! Runs the Ultra-Light-Fast face detector (version-RFB-320): a plain
//! resize to 320x240, one forward pass producing per-prior scores and
//! normalized corner boxes, then NMS and deterministic ordering.

use crate::raster;
use crate::types::{FaceRegion, Frame};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const ULTRAFACE_INPUT_WIDTH: usize = 320;
const ULTRAFACE_INPUT_HEIGHT: usize = 240;
const ULTRAFACE_MEAN: f32 = 127.0;
const ULTRAFACE_STD: f32 = 128.0;
const ULTRAFACE_CONFIDENCE_THRESHOLD: f32 = 0.7;
const ULTRAFACE_NMS_THRESHOLD: f32 = 0.3;
/// Output tensor order: [scores (1,N,2), boxes (1,N,4)].
const ULTRAFACE_SCORES_OUTPUT: usize = 0;
const ULTRAFACE_BOXES_OUTPUT: usize = 1;

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Pluggable face location capability.
///
/// "No face present" is an empty result, never an error.
pub trait FaceLocator: Send {
    /// Locate faces in a frame, ordered by descending confidence
    /// (ties broken left-to-right).
    fn locate(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>, LocatorError>;
}

/// UltraFace-based locator.
pub struct OnnxFaceLocator {
    session: Session,
}

impl OnnxFaceLocator {
    /// Load the UltraFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, LocatorError> {
        if !Path::new(model_path).exists() {
            return Err(LocatorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded UltraFace model"
        );

        Ok(Self { session })
    }

    /// Preprocess a grayscale frame into a NCHW float tensor.
    ///
    /// UltraFace takes a plain (non-letterboxed) resize; box coordinates
    /// come back normalized to [0, 1] so no de-mapping is needed.
    fn preprocess(frame: &Frame) -> Array4<f32> {
        let resized = raster::resize_bilinear(
            &frame.data,
            frame.width as usize,
            frame.height as usize,
            ULTRAFACE_INPUT_WIDTH,
            ULTRAFACE_INPUT_HEIGHT,
        );

        let mut tensor =
            Array4::<f32>::zeros((1, 3, ULTRAFACE_INPUT_HEIGHT, ULTRAFACE_INPUT_WIDTH));

        for y in 0..ULTRAFACE_INPUT_HEIGHT {
            for x in 0..ULTRAFACE_INPUT_WIDTH {
                let pixel = resized[y * ULTRAFACE_INPUT_WIDTH + x] as f32;
                let normalized = (pixel - ULTRAFACE_MEAN) / ULTRAFACE_STD;
                // Grayscale -> 3-channel: replicate Y
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }

        tensor
    }
}

impl FaceLocator for OnnxFaceLocator {
    fn locate(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>, LocatorError> {
        validate_frame(frame)?;

        let input = Self::preprocess(frame);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, scores) = outputs[ULTRAFACE_SCORES_OUTPUT]
            .try_extract_tensor::<f32>()
            .map_err(|e| LocatorError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[ULTRAFACE_BOXES_OUTPUT]
            .try_extract_tensor::<f32>()
            .map_err(|e| LocatorError::InferenceFailed(format!("boxes: {e}")))?;

        let candidates = decode_candidates(
            scores,
            boxes,
            frame.width as f32,
            frame.height as f32,
            ULTRAFACE_CONFIDENCE_THRESHOLD,
        );

        let mut regions = nms(candidates, ULTRAFACE_NMS_THRESHOLD);
        sort_regions(&mut regions);
        Ok(regions)
    }
}

/// Reject frames that cannot be processed. An empty classroom is fine;
/// an empty buffer is not.
fn validate_frame(frame: &Frame) -> Result<(), LocatorError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(LocatorError::InvalidFrame(format!(
            "zero-sized frame ({}x{})",
            frame.width, frame.height
        )));
    }
    let expected = (frame.width * frame.height) as usize;
    if frame.data.is_empty() {
        return Err(LocatorError::InvalidFrame("empty pixel buffer".into()));
    }
    if frame.data.len() != expected {
        return Err(LocatorError::InvalidFrame(format!(
            "unsupported channel layout: expected {expected} grayscale bytes, got {}",
            frame.data.len()
        )));
    }
    Ok(())
}

/// Decode UltraFace output into frame-space regions above `threshold`.
///
/// `scores` is (N, 2) [background, face] and `boxes` is (N, 4) normalized
/// [x1, y1, x2, y2], both flattened row-major.
fn decode_candidates(
    scores: &[f32],
    boxes: &[f32],
    frame_w: f32,
    frame_h: f32,
    threshold: f32,
) -> Vec<FaceRegion> {
    let num_priors = scores.len() / 2;
    let mut regions = Vec::new();

    for i in 0..num_priors {
        let confidence = scores[i * 2 + 1];
        if confidence <= threshold || !confidence.is_finite() {
            continue;
        }

        let off = i * 4;
        if off + 3 >= boxes.len() {
            continue;
        }
        let x1 = (boxes[off].clamp(0.0, 1.0)) * frame_w;
        let y1 = (boxes[off + 1].clamp(0.0, 1.0)) * frame_h;
        let x2 = (boxes[off + 2].clamp(0.0, 1.0)) * frame_w;
        let y2 = (boxes[off + 3].clamp(0.0, 1.0)) * frame_h;

        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        regions.push(FaceRegion {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence,
        });
    }

    regions
}

/// Order regions by descending confidence; ties break left-to-right so
/// repeated runs over the same frame are deterministic.
fn sort_regions(regions: &mut [FaceRegion]) {
    regions.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.x.partial_cmp(&b.x).unwrap_or(std::cmp::Ordering::Equal))
    });
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut regions: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    sort_regions(&mut regions);

    let mut keep = Vec::new();
    let mut suppressed = vec![false; regions.len()];

    for i in 0..regions.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(regions[i].clone());

        for j in (i + 1)..regions.len() {
            if !suppressed[j] && iou(&regions[i], &regions[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Intersection-over-Union between two regions.
fn iou(a: &FaceRegion, b: &FaceRegion) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
