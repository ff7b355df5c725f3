//! Probe-to-gallery matching with threshold and ambiguity margin.

use crate::gallery::{Gallery, GalleryError};
use crate::types::{Embedding, MatchOutcome, MatchResult};
use std::sync::Arc;

/// Acceptance policy: how close the best candidate must be, and how far
/// ahead of the runner-up. Both trade false accepts against false
/// rejects and are deployment-tuned configuration, not constants.
#[derive(Debug, Clone, Copy)]
pub struct MatchPolicy {
    /// Maximum cosine distance for a positive match.
    pub threshold: f32,
    /// Minimum distance gap to the second-nearest identity. A gap at or
    /// below this resolves to unknown rather than guessing.
    pub margin: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            threshold: 0.35,
            margin: 0.10,
        }
    }
}

/// Matches probe embeddings against the shared gallery. Stateless and
/// side-effect free.
pub struct Matcher {
    gallery: Arc<Gallery>,
    policy: MatchPolicy,
}

impl Matcher {
    pub fn new(gallery: Arc<Gallery>, policy: MatchPolicy) -> Self {
        Self { gallery, policy }
    }

    pub fn gallery(&self) -> &Arc<Gallery> {
        &self.gallery
    }

    /// Match one probe. Fails only on dimensionality mismatch; an empty
    /// gallery or an ambiguous ranking is an unknown outcome, not an error.
    pub fn match_probe(&self, probe: &Embedding) -> Result<MatchResult, GalleryError> {
        let candidates = self.gallery.lookup(probe, 2)?;

        let Some(best) = candidates.first() else {
            return Ok(MatchResult {
                outcome: MatchOutcome::Unknown,
                distance: f32::INFINITY,
            });
        };

        if best.distance > self.policy.threshold {
            tracing::debug!(
                identity = %best.identity_id,
                distance = best.distance,
                threshold = self.policy.threshold,
                "nearest identity above threshold, resolving to unknown"
            );
            return Ok(MatchResult {
                outcome: MatchOutcome::Unknown,
                distance: best.distance,
            });
        }

        if let Some(second) = candidates.get(1) {
            if second.distance - best.distance <= self.policy.margin {
                tracing::debug!(
                    best = %best.identity_id,
                    second = %second.identity_id,
                    gap = second.distance - best.distance,
                    margin = self.policy.margin,
                    "ambiguous ranking, resolving to unknown"
                );
                return Ok(MatchResult {
                    outcome: MatchOutcome::Unknown,
                    distance: best.distance,
                });
            }
        }

        Ok(MatchResult {
            outcome: MatchOutcome::Identified {
                identity_id: best.identity_id.clone(),
                display_name: best.display_name.clone(),
            },
            distance: best.distance,
        })
    }
}
