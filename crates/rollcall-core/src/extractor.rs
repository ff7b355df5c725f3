//! MobileFaceNet embedding extractor via ONNX Runtime.
//!
//! Crops a located face, resizes it to the 112x112 model input, and
//! produces a unit-normalized 512-dimensional embedding. Deterministic
//! for fixed inputs — no hidden state.

use crate::raster;
use crate::types::{Embedding, FaceRegion, Frame};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const EXTRACTOR_INPUT_SIZE: usize = 112;
const EXTRACTOR_MEAN: f32 = 127.5;
const EXTRACTOR_STD: f32 = 127.5; // symmetric normalization, ArcFace-family convention
const EXTRACTOR_MODEL_VERSION: &str = "w600k_mbf";
/// Smallest usable crop edge; anything below cannot produce a stable vector.
const MIN_CROP_EDGE: usize = 8;

/// System-wide embedding dimensionality. Every gallery reference and
/// probe must have exactly this many components.
pub const EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("region out of bounds: {x:.0},{y:.0} {w:.0}x{h:.0} exceeds {frame_w}x{frame_h} frame")]
    RegionOutOfBounds {
        x: f32,
        y: f32,
        w: f32,
        h: f32,
        frame_w: u32,
        frame_h: u32,
    },
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Pluggable embedding extraction capability, treated as a pre-trained
/// black box. Implementations must be pure functions of their inputs.
pub trait EmbeddingExtractor: Send {
    fn extract(&mut self, frame: &Frame, region: &FaceRegion) -> Result<Embedding, ExtractorError>;
}

/// MobileFaceNet-based extractor.
pub struct OnnxEmbeddingExtractor {
    session: Session,
}

impl OnnxEmbeddingExtractor {
    /// Load the recognition ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, ExtractorError> {
        if !Path::new(model_path).exists() {
            return Err(ExtractorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded embedding model");

        Ok(Self { session })
    }

    /// Preprocess a 112x112 grayscale crop into a NCHW float tensor.
    fn preprocess(face: &[u8]) -> Array4<f32> {
        let size = EXTRACTOR_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..size {
            for x in 0..size {
                let pixel = face.get(y * size + x).copied().unwrap_or(0) as f32;
                let normalized = (pixel - EXTRACTOR_MEAN) / EXTRACTOR_STD;
                // Grayscale -> 3-channel: replicate Y
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }

        tensor
    }
}

impl EmbeddingExtractor for OnnxEmbeddingExtractor {
    fn extract(&mut self, frame: &Frame, region: &FaceRegion) -> Result<Embedding, ExtractorError> {
        let rect = checked_crop_rect(frame, region)?;
        let cropped = raster::crop(
            &frame.data,
            frame.width as usize,
            rect.x,
            rect.y,
            rect.w,
            rect.h,
        );
        let resized = raster::resize_bilinear(
            &cropped,
            rect.w,
            rect.h,
            EXTRACTOR_INPUT_SIZE,
            EXTRACTOR_INPUT_SIZE,
        );

        let input = Self::preprocess(&resized);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::ExtractionFailed(format!("embedding output: {e}")))?;

        if raw_data.len() != EMBEDDING_DIM {
            return Err(ExtractorError::ExtractionFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        Embedding::unit(raw_data.to_vec(), Some(EXTRACTOR_MODEL_VERSION.to_string())).ok_or_else(
            || ExtractorError::ExtractionFailed("zero-norm embedding (degenerate crop)".into()),
        )
    }
}

/// Integer crop rectangle known to lie within the frame.
#[derive(Debug)]
struct CropRect {
    x: usize,
    y: usize,
    w: usize,
    h: usize,
}

/// Validate a region against frame bounds and round it to whole pixels.
///
/// A region that spills past the frame is a caller error, not something
/// to silently clamp. A region too small to resize meaningfully is a
/// degenerate crop.
fn checked_crop_rect(frame: &Frame, region: &FaceRegion) -> Result<CropRect, ExtractorError> {
    let out_of_bounds = || ExtractorError::RegionOutOfBounds {
        x: region.x,
        y: region.y,
        w: region.width,
        h: region.height,
        frame_w: frame.width,
        frame_h: frame.height,
    };

    if region.x < 0.0
        || region.y < 0.0
        || region.width <= 0.0
        || region.height <= 0.0
        || !region.x.is_finite()
        || !region.y.is_finite()
    {
        return Err(out_of_bounds());
    }

    let x = region.x.floor() as usize;
    let y = region.y.floor() as usize;
    let w = region.width.ceil() as usize;
    let h = region.height.ceil() as usize;

    if x + w > frame.width as usize || y + h > frame.height as usize {
        return Err(out_of_bounds());
    }

    if w < MIN_CROP_EDGE || h < MIN_CROP_EDGE {
        return Err(ExtractorError::ExtractionFailed(format!(
            "degenerate crop {w}x{h}, need at least {MIN_CROP_EDGE}px per edge"
        )));
    }

    Ok(CropRect { x, y, w, h })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_frame(width: u32, height: u32) -> Frame {
        Frame {
            data: vec![100u8; (width * height) as usize],
            width,
            height,
            timestamp: Utc::now(),
            camera_id: "test".into(),
        }
    }

    fn make_region(x: f32, y: f32, w: f32, h: f32) -> FaceRegion {
        FaceRegion {
            x,
            y,
            width: w,
            height: h,
            confidence: 0.9,
        }
    }

    #[test]
    fn test_crop_rect_within_bounds() {
        let frame = make_frame(100, 100);
        let rect = checked_crop_rect(&frame, &make_region(10.0, 10.0, 50.0, 50.0)).unwrap();
        assert_eq!((rect.x, rect.y, rect.w, rect.h), (10, 10, 50, 50));
    }

    #[test]
    fn test_crop_rect_rejects_spill() {
        let frame = make_frame(100, 100);
        let err = checked_crop_rect(&frame, &make_region(80.0, 10.0, 50.0, 50.0)).unwrap_err();
        assert!(matches!(err, ExtractorError::RegionOutOfBounds { .. }));
    }

    #[test]
    fn test_crop_rect_rejects_negative_origin() {
        let frame = make_frame(100, 100);
        let err = checked_crop_rect(&frame, &make_region(-5.0, 10.0, 50.0, 50.0)).unwrap_err();
        assert!(matches!(err, ExtractorError::RegionOutOfBounds { .. }));
    }

    #[test]
    fn test_crop_rect_rejects_degenerate() {
        let frame = make_frame(100, 100);
        let err = checked_crop_rect(&frame, &make_region(10.0, 10.0, 4.0, 4.0)).unwrap_err();
        assert!(matches!(err, ExtractorError::ExtractionFailed(_)));
    }

    #[test]
    fn test_crop_rect_rounds_outward() {
        let frame = make_frame(100, 100);
        let rect = checked_crop_rect(&frame, &make_region(10.4, 10.6, 20.3, 20.2)).unwrap();
        assert_eq!((rect.x, rect.y), (10, 10));
        assert_eq!((rect.w, rect.h), (21, 21));
    }

    #[test]
    fn test_preprocess_shape_and_channels() {
        let face = vec![128u8; EXTRACTOR_INPUT_SIZE * EXTRACTOR_INPUT_SIZE];
        let tensor = OnnxEmbeddingExtractor::preprocess(&face);
        assert_eq!(
            tensor.shape(),
            &[1, 3, EXTRACTOR_INPUT_SIZE, EXTRACTOR_INPUT_SIZE]
        );
        let expected = (128.0 - EXTRACTOR_MEAN) / EXTRACTOR_STD;
        assert!((tensor[[0, 0, 0, 0]] - expected).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 5, 5]], tensor[[0, 1, 5, 5]]);
        assert_eq!(tensor[[0, 1, 5, 5]], tensor[[0, 2, 5, 5]]);
    }
}
