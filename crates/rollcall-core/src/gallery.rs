//! In-memory identity gallery with snapshot-swap concurrency.
//!
//! Enrollment and revocation build a fresh snapshot and swap it in
//! atomically; concurrent lookups keep reading the snapshot they
//! started with and never observe a half-applied update. Lookup is a
//! linear scan, which is plenty for classroom-sized galleries; an
//! approximate-nearest-neighbor index can replace it behind the same
//! contract.

use crate::types::{Embedding, EnrolledIdentity};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("embedding dimension mismatch: gallery holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("identity {0} has no reference embeddings")]
    EmptyReferences(String),
}

/// One nearest-neighbor candidate from a lookup.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub identity_id: String,
    pub display_name: String,
    /// Cosine distance of this identity's closest reference embedding.
    pub distance: f32,
}

/// Read-mostly gallery of enrolled identities, shared across pipeline
/// instances.
#[derive(Default)]
pub struct Gallery {
    snapshot: RwLock<Arc<Vec<EnrolledIdentity>>>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read_snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_snapshot().is_empty()
    }

    /// Dimensionality of the enrolled references, if any are present.
    pub fn dim(&self) -> Option<usize> {
        self.read_snapshot()
            .first()
            .and_then(|identity| identity.references.first())
            .map(Embedding::dim)
    }

    /// Add an identity, or replace its reference set wholesale if the
    /// id is already enrolled.
    ///
    /// Every reference must share the gallery's dimensionality;
    /// mismatches are hard errors, never padded or truncated.
    pub fn enroll(&self, identity: EnrolledIdentity) -> Result<(), GalleryError> {
        let Some(first) = identity.references.first() else {
            return Err(GalleryError::EmptyReferences(identity.id));
        };
        let dim = first.dim();
        for reference in &identity.references {
            if reference.dim() != dim {
                return Err(GalleryError::DimensionMismatch {
                    expected: dim,
                    actual: reference.dim(),
                });
            }
        }

        let mut guard = self.write_lock();
        if let Some(enrolled_dim) = guard
            .first()
            .and_then(|existing| existing.references.first())
            .map(Embedding::dim)
        {
            if dim != enrolled_dim {
                return Err(GalleryError::DimensionMismatch {
                    expected: enrolled_dim,
                    actual: dim,
                });
            }
        }

        let mut next: Vec<EnrolledIdentity> = guard.as_ref().clone();
        match next.iter_mut().find(|existing| existing.id == identity.id) {
            Some(existing) => *existing = identity,
            None => next.push(identity),
        }
        *guard = Arc::new(next);
        Ok(())
    }

    /// Remove an identity. Returns false if it was not enrolled.
    pub fn revoke(&self, identity_id: &str) -> bool {
        let mut guard = self.write_lock();
        if !guard.iter().any(|identity| identity.id == identity_id) {
            return false;
        }
        let next: Vec<EnrolledIdentity> = guard
            .iter()
            .filter(|identity| identity.id != identity_id)
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    /// Return the k nearest enrolled identities by cosine distance,
    /// ascending. An identity's distance is the minimum over its
    /// reference set. Ties break by identity id for determinism.
    pub fn lookup(&self, probe: &Embedding, k: usize) -> Result<Vec<Candidate>, GalleryError> {
        let snapshot = self.read_snapshot();
        let Some(expected) = snapshot
            .first()
            .and_then(|identity| identity.references.first())
            .map(Embedding::dim)
        else {
            return Ok(Vec::new());
        };
        if probe.dim() != expected {
            return Err(GalleryError::DimensionMismatch {
                expected,
                actual: probe.dim(),
            });
        }

        let mut candidates: Vec<Candidate> = snapshot
            .iter()
            .map(|identity| {
                let distance = identity
                    .references
                    .iter()
                    .map(|reference| probe.cosine_distance(reference))
                    .fold(f32::INFINITY, f32::min);
                Candidate {
                    identity_id: identity.id.clone(),
                    display_name: identity.display_name.clone(),
                    distance,
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.identity_id.cmp(&b.identity_id))
        });
        candidates.truncate(k);
        Ok(candidates)
    }

    fn read_snapshot(&self) -> Arc<Vec<EnrolledIdentity>> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, Arc<Vec<EnrolledIdentity>>> {
        self.snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(values: Vec<f32>) -> Embedding {
        Embedding::unit(values, None).unwrap()
    }

    fn identity(id: &str, name: &str, references: Vec<Embedding>) -> EnrolledIdentity {
        EnrolledIdentity {
            id: id.into(),
            display_name: name.into(),
            references,
        }
    }

    #[test]
    fn test_lookup_orders_by_distance() {
        let gallery = Gallery::new();
        gallery
            .enroll(identity("s1", "Ada", vec![unit(vec![1.0, 0.0, 0.0])]))
            .unwrap();
        gallery
            .enroll(identity("s2", "Bea", vec![unit(vec![0.0, 1.0, 0.0])]))
            .unwrap();

        let probe = unit(vec![0.9, 0.1, 0.0]);
        let result = gallery.lookup(&probe, 2).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].identity_id, "s1");
        assert!(result[0].distance < result[1].distance);
    }

    #[test]
    fn test_lookup_uses_closest_reference() {
        let gallery = Gallery::new();
        gallery
            .enroll(identity(
                "s1",
                "Ada",
                vec![unit(vec![0.0, 1.0]), unit(vec![1.0, 0.0])],
            ))
            .unwrap();

        let probe = unit(vec![1.0, 0.0]);
        let result = gallery.lookup(&probe, 1).unwrap();
        assert!(result[0].distance.abs() < 1e-6);
    }

    #[test]
    fn test_lookup_empty_gallery() {
        let gallery = Gallery::new();
        let probe = unit(vec![1.0, 0.0]);
        assert!(gallery.lookup(&probe, 3).unwrap().is_empty());
    }

    #[test]
    fn test_lookup_dimension_mismatch() {
        let gallery = Gallery::new();
        gallery
            .enroll(identity("s1", "Ada", vec![unit(vec![1.0, 0.0, 0.0])]))
            .unwrap();

        let probe = unit(vec![1.0, 0.0]);
        assert!(matches!(
            gallery.lookup(&probe, 1),
            Err(GalleryError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_enroll_replaces_wholesale() {
        let gallery = Gallery::new();
        gallery
            .enroll(identity("s1", "Ada", vec![unit(vec![1.0, 0.0])]))
            .unwrap();
        gallery
            .enroll(identity("s1", "Ada", vec![unit(vec![0.0, 1.0])]))
            .unwrap();

        assert_eq!(gallery.len(), 1);
        let probe = unit(vec![1.0, 0.0]);
        let result = gallery.lookup(&probe, 1).unwrap();
        // Old reference gone: distance now reflects the replacement
        assert!((result[0].distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_enroll_rejects_empty_references() {
        let gallery = Gallery::new();
        assert!(matches!(
            gallery.enroll(identity("s1", "Ada", vec![])),
            Err(GalleryError::EmptyReferences(_))
        ));
    }

    #[test]
    fn test_enroll_rejects_mixed_dimensions() {
        let gallery = Gallery::new();
        let result = gallery.enroll(identity(
            "s1",
            "Ada",
            vec![unit(vec![1.0, 0.0]), unit(vec![1.0, 0.0, 0.0])],
        ));
        assert!(matches!(result, Err(GalleryError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_enroll_rejects_foreign_dimension() {
        let gallery = Gallery::new();
        gallery
            .enroll(identity("s1", "Ada", vec![unit(vec![1.0, 0.0, 0.0])]))
            .unwrap();
        let result = gallery.enroll(identity("s2", "Bea", vec![unit(vec![1.0, 0.0])]));
        assert!(matches!(result, Err(GalleryError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_revoke() {
        let gallery = Gallery::new();
        gallery
            .enroll(identity("s1", "Ada", vec![unit(vec![1.0, 0.0])]))
            .unwrap();
        assert!(gallery.revoke("s1"));
        assert!(!gallery.revoke("s1"));
        assert!(gallery.is_empty());
    }

    #[test]
    fn test_readers_see_pre_or_post_snapshot() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let gallery = StdArc::new(Gallery::new());
        gallery
            .enroll(identity("s1", "Ada", vec![unit(vec![1.0, 0.0])]))
            .unwrap();

        let reader = {
            let gallery = gallery.clone();
            thread::spawn(move || {
                let probe = unit(vec![1.0, 0.0]);
                for _ in 0..200 {
                    let result = gallery.lookup(&probe, 10).unwrap();
                    // Snapshot is always internally consistent: 1 or 2 entries
                    assert!(!result.is_empty() && result.len() <= 2);
                }
            })
        };

        for i in 0..50 {
            let id = identity("s2", "Bea", vec![unit(vec![0.0, 1.0])]);
            if i % 2 == 0 {
                gallery.enroll(id).unwrap();
            } else {
                gallery.revoke("s2");
            }
        }

        reader.join().unwrap();
    }
}
