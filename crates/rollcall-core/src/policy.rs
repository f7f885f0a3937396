//! Accept/reject decisions for raw classifier scores.
//!
//! Each [`RawScore`] variant has its own comparator. Distances accept
//! strictly below an upper bound; probabilities accept strictly above a
//! lower bound.

use crate::types::{EnrollmentSet, Prediction, RawScore, RecognitionOutcome};

pub const DEFAULT_HISTOGRAM_MAX_DISTANCE: f32 = 95.0;
/// Calibrated for 128-d dlib-style encodings. L2-normalised 512-d ArcFace
/// embeddings of the same person are usually more than 0.8 apart, so a
/// gallery built with [`crate::ArcFaceEmbedder`] needs a looser bound
/// (around 1.0 to 1.1) set through `embedding_max_distance`.
pub const DEFAULT_EMBEDDING_MAX_DISTANCE: f32 = 0.50;
pub const DEFAULT_PROBABILITY_MIN: f32 = 0.60;

/// Per-variant acceptance thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidencePolicy {
    /// LBPH: accept if distance < this.
    pub histogram_max_distance: f32,
    /// Embedding gallery: accept if distance < this.
    pub embedding_max_distance: f32,
    /// Softmax: accept if probability > this.
    pub probability_min: f32,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            histogram_max_distance: DEFAULT_HISTOGRAM_MAX_DISTANCE,
            embedding_max_distance: DEFAULT_EMBEDDING_MAX_DISTANCE,
            probability_min: DEFAULT_PROBABILITY_MIN,
        }
    }
}

impl ConfidencePolicy {
    /// Resolve a prediction against the vocabulary it was made with.
    pub fn resolve(&self, prediction: &Prediction, enrollment: &EnrollmentSet) -> RecognitionOutcome {
        let (accepted, score) = match prediction.score {
            RawScore::HistogramDistance(d) => (d < self.histogram_max_distance, d),
            RawScore::EmbeddingDistance(d) => {
                (d < self.embedding_max_distance, (1.0 - d).clamp(0.0, 1.0))
            }
            RawScore::Probability(p) => (p > self.probability_min, p),
        };

        // NaN fails every comparison above; the display score may still be NaN.
        let score = if score.is_finite() { score } else { 0.0 };

        match enrollment.get(prediction.class_index) {
            Some(identity) if accepted => RecognitionOutcome::Known {
                identity: identity.clone(),
                score,
            },
            _ => RecognitionOutcome::Unknown { score },
        }
    }
}
