//! rollcall-core — Face recognition and attendance pipeline.
//!
//! Turns a stream of camera frames into deduplicated, confidence-
//! qualified attendance events: UltraFace for face location, a
//! MobileFaceNet embedding model via ONNX Runtime, cosine matching with
//! an ambiguity margin, and N-of-W confirmation per session.

pub mod attendance;
pub mod extractor;
pub mod gallery;
pub mod locator;
pub mod matcher;
pub mod pipeline;
mod raster;
pub mod types;

pub use attendance::{
    AttendanceEvent, AttendanceRecorder, AttendanceSession, ConfirmPolicy, Deduplicator, SessionId,
};
pub use extractor::{EmbeddingExtractor, OnnxEmbeddingExtractor, EMBEDDING_DIM};
pub use gallery::Gallery;
pub use locator::{FaceLocator, OnnxFaceLocator};
pub use matcher::{MatchPolicy, Matcher};
pub use pipeline::{FrameSource, Pipeline};
pub use types::{Embedding, EnrolledIdentity, FaceRegion, Frame, MatchOutcome, MatchResult};
