use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Clamp the box to a `width` × `height` frame, returning integer pixel
    /// bounds `(x, y, w, h)`. `None` if nothing of the box is inside the frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(width);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// Stable name of an enrolled person, as produced by training.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Classifier index → identity vocabulary. Immutable once a backend is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrollmentSet {
    identities: Vec<Identity>,
}

impl EnrollmentSet {
    pub fn new(identities: Vec<Identity>) -> Self {
        Self { identities }
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names.into_iter().map(Identity::new).collect())
    }

    /// Resolve a raw classifier index. Negative or out-of-range indices
    /// (stale vocabularies, LBPH's `-1`) resolve to `None`.
    pub fn get(&self, index: i64) -> Option<&Identity> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.identities.get(i))
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.iter()
    }
}

/// Face embedding vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default)]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Euclidean distance. Lower = more similar.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// Raw classifier score, tagged by the variant that produced it.
///
/// The tag carries the comparator direction: distances are lower-is-better,
/// probabilities are higher-is-better.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RawScore {
    /// LBPH chi-square distance.
    HistogramDistance(f32),
    /// Euclidean distance in embedding space.
    EmbeddingDistance(f32),
    /// Class probability in [0, 1].
    Probability(f32),
}

impl RawScore {
    pub fn value(&self) -> f32 {
        match *self {
            RawScore::HistogramDistance(v)
            | RawScore::EmbeddingDistance(v)
            | RawScore::Probability(v) => v,
        }
    }
}

/// Classifier output for one face: the arg-best class and its score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub class_index: i64,
    pub score: RawScore,
}

/// One face in one frame.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// `None` when recognition is disabled or classifying this face failed.
    pub prediction: Option<Prediction>,
}

/// Policy-resolved judgment for a detection.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionOutcome {
    Known { identity: Identity, score: f32 },
    Unknown { score: f32 },
}

impl RecognitionOutcome {
    pub const UNKNOWN_NAME: &'static str = "Unknown";

    pub fn display_name(&self) -> &str {
        match self {
            RecognitionOutcome::Known { identity, .. } => identity.as_str(),
            RecognitionOutcome::Unknown { .. } => Self::UNKNOWN_NAME,
        }
    }

    pub fn display_score(&self) -> f32 {
        match *self {
            RecognitionOutcome::Known { score, .. } | RecognitionOutcome::Unknown { score } => {
                score
            }
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            RecognitionOutcome::Known { identity, .. } => Some(identity),
            RecognitionOutcome::Unknown { .. } => None,
        }
    }
}
