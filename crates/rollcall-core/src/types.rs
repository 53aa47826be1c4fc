use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }
}

/// Face embedding vector (512-dimensional, L2-normalized for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Euclidean distance between two embeddings. Lower = more similar.
    ///
    /// Dimensions beyond the shorter vector are ignored.
    pub fn distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

/// A face found in a frame together with its embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Result of matching a probe embedding against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Name of the matched person, if the best distance is under the threshold.
    pub name: Option<String>,
    /// Smallest distance seen; `None` for an empty gallery.
    pub distance: Option<f32>,
}

impl MatchResult {
    /// Label drawn next to the face box.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

/// Label for faces that do not match anyone in the gallery.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Strategy for comparing a probe embedding against the gallery.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &crate::Gallery) -> MatchResult;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// Ties resolve to the first minimum in gallery order. A distance exactly at
/// the threshold is not a match. Non-finite distances never win.
#[derive(Debug, Clone, Copy)]
pub struct DistanceMatcher {
    pub threshold: f32,
}

impl DistanceMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl Matcher for DistanceMatcher {
    fn compare(&self, probe: &Embedding, gallery: &crate::Gallery) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.entries().iter().enumerate() {
            let dist = probe.distance(&entry.embedding);
            if !dist.is_finite() {
                continue;
            }
            match best {
                Some((_, best_dist)) if dist >= best_dist => {}
                _ => best = Some((i, dist)),
            }
        }

        match best {
            Some((idx, dist)) if dist < self.threshold => MatchResult {
                name: Some(gallery.entries()[idx].name.clone()),
                distance: Some(dist),
            },
            Some((_, dist)) => MatchResult {
                name: None,
                distance: Some(dist),
            },
            None => MatchResult {
                name: None,
                distance: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Gallery, GalleryEntry};

    fn entry(name: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            name: name.into(),
            embedding: Embedding::new(values),
        }
    }

    #[test]
    fn test_distance_identical() {
        let a = Embedding::new(vec![0.5, 0.5, 0.0]);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn test_distance_orthogonal_unit() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!((a.distance(&b) - 2f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_picks_nearest() {
        let gallery = Gallery::from_entries(vec![
            entry("alice", vec![1.0, 0.0]),
            entry("bob", vec![0.0, 1.0]),
        ]);
        let probe = Embedding::new(vec![0.1, 0.9]);
        let result = DistanceMatcher::new(0.5).compare(&probe, &gallery);
        assert_eq!(result.name.as_deref(), Some("bob"));
        assert_eq!(result.label(), "bob");
    }

    #[test]
    fn test_matcher_threshold_is_strict() {
        let gallery = Gallery::from_entries(vec![entry("alice", vec![0.0, 0.0])]);
        let probe = Embedding::new(vec![0.5, 0.0]);

        let result = DistanceMatcher::new(0.5).compare(&probe, &gallery);
        assert_eq!(result.name, None);
        assert_eq!(result.label(), UNKNOWN_LABEL);
        assert_eq!(result.distance, Some(0.5));

        let result = DistanceMatcher::new(0.5001).compare(&probe, &gallery);
        assert_eq!(result.name.as_deref(), Some("alice"));
    }

    #[test]
    fn test_matcher_tie_goes_to_first_entry() {
        let gallery = Gallery::from_entries(vec![
            entry("first", vec![1.0, 0.0]),
            entry("second", vec![1.0, 0.0]),
        ]);
        let probe = Embedding::new(vec![1.0, 0.1]);
        let result = DistanceMatcher::new(0.5).compare(&probe, &gallery);
        assert_eq!(result.name.as_deref(), Some("first"));
    }

    #[test]
    fn test_matcher_empty_gallery() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let result = DistanceMatcher::new(0.5).compare(&probe, &Gallery::default());
        assert_eq!(result.name, None);
        assert_eq!(result.distance, None);
    }

    #[test]
    fn test_matcher_ignores_nan_embedding() {
        let gallery = Gallery::from_entries(vec![
            entry("alice", vec![1.0, 0.0]),
            entry("broken", vec![f32::NAN, 0.0]),
        ]);
        let probe = Embedding::new(vec![1.0, 0.1]);
        let result = DistanceMatcher::new(0.5).compare(&probe, &gallery);
        assert_eq!(result.name.as_deref(), Some("alice"));
        assert!(result.distance.unwrap().is_finite());

        let only_broken = Gallery::from_entries(vec![entry("broken", vec![f32::NAN, 0.0])]);
        let result = DistanceMatcher::new(0.5).compare(&probe, &only_broken);
        assert_eq!(result.name, None);
        assert_eq!(result.distance, None);
    }

    #[test]
    fn test_bounding_box_edges() {
        let bbox = BoundingBox {
            x: 10.0,
            y: 20.0,
            width: 30.0,
            height: 40.0,
            confidence: 0.9,
            landmarks: None,
        };
        assert_eq!(bbox.right(), 40.0);
        assert_eq!(bbox.bottom(), 60.0);
    }
}
