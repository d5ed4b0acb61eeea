use serde::{Deserialize, Serialize};

use crate::descriptor::euclidean_distance;

/// Distance below which a probe is accepted as the enrolled face.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.45;

/// An enrolled identity: username plus its canonical (averaged) descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceProfile {
    pub username: String,
    pub descriptor: Vec<f32>,
}

/// Outcome of comparing a probe descriptor against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub matched: bool,
    /// Username of the nearest profile, only when `matched`.
    pub label: Option<String>,
    /// Distance to the nearest profile; infinite for an empty gallery.
    pub distance: f32,
}

impl VerificationResult {
    pub fn no_match() -> Self {
        Self {
            matched: false,
            label: None,
            distance: f32::INFINITY,
        }
    }
}

/// Compares a probe descriptor against enrolled profiles.
pub trait Matcher {
    fn compare(
        &self,
        probe: &[f32],
        gallery: &[FaceProfile],
        threshold: f32,
    ) -> VerificationResult;
}

/// Nearest neighbour by Euclidean distance; a match requires `distance < threshold`.
///
/// Profiles whose descriptor length differs from the probe are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &[f32],
        gallery: &[FaceProfile],
        threshold: f32,
    ) -> VerificationResult {
        let nearest = gallery
            .iter()
            .filter(|p| p.descriptor.len() == probe.len())
            .map(|p| (p, euclidean_distance(probe, &p.descriptor)))
            .filter(|(_, d)| !d.is_nan())
            .min_by(|a, b| a.1.total_cmp(&b.1));

        let Some((profile, distance)) = nearest else {
            return VerificationResult::no_match();
        };

        let matched = distance < threshold;
        VerificationResult {
            matched,
            label: matched.then(|| profile.username.clone()),
            distance,
        }
    }
}
