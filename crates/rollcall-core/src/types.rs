use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single grayscale camera frame, owned for one pipeline pass.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture time, used for attendance timestamps and the confirmation window.
    pub timestamp: DateTime<Utc>,
    /// Source camera/stream identifier.
    pub camera_id: String,
}

/// Bounding box for a located face within a frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detection confidence in [0, 1].
    pub confidence: f32,
}

/// Unit-normalized face embedding vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_mbf").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Build a unit-length embedding from raw model output.
    ///
    /// Returns `None` for a zero vector, which cannot be normalized and
    /// indicates an unstable extraction.
    pub fn unit(raw: Vec<f32>, model_version: Option<String>) -> Option<Self> {
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm <= 0.0 || !norm.is_finite() {
            return None;
        }
        Some(Self {
            values: raw.iter().map(|x| x / norm).collect(),
            model_version,
        })
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine distance in [0, 2]: lower = more similar.
    ///
    /// Both embeddings must be unit-normalized and of equal dimension;
    /// dimensionality is enforced at the gallery boundary.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        debug_assert_eq!(self.dim(), other.dim());
        let dot: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum();
        1.0 - dot
    }
}

/// An enrolled student: stable id, display name, and one or more
/// reference embeddings covering different poses/lighting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    pub id: String,
    pub display_name: String,
    pub references: Vec<Embedding>,
}

/// Outcome of matching one probe embedding against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Identified {
        identity_id: String,
        display_name: String,
    },
    /// No enrolled identity cleared the acceptance threshold, or the
    /// best candidate was ambiguous. Never a fabricated identity.
    Unknown,
}

/// Result of one match operation.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub outcome: MatchOutcome,
    /// Cosine distance of the nearest candidate; infinity for an empty gallery.
    pub distance: f32,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self.outcome, MatchOutcome::Identified { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(values: Vec<f32>) -> Embedding {
        Embedding::unit(values, None).unwrap()
    }

    #[test]
    fn test_unit_normalizes() {
        let e = unit(vec![3.0, 4.0]);
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_unit_rejects_zero_vector() {
        assert!(Embedding::unit(vec![0.0, 0.0, 0.0], None).is_none());
    }

    #[test]
    fn test_distance_identical() {
        let a = unit(vec![1.0, 0.0]);
        assert!(a.cosine_distance(&a).abs() < 1e-6);
    }

    #[test]
    fn test_distance_orthogonal() {
        let a = unit(vec![1.0, 0.0]);
        let b = unit(vec![0.0, 1.0]);
        assert!((a.cosine_distance(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_opposite() {
        let a = unit(vec![1.0, 0.0]);
        let b = unit(vec![-1.0, 0.0]);
        assert!((a.cosine_distance(&b) - 2.0).abs() < 1e-6);
    }
}
