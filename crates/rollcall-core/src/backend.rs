//! Recognition backends and trained-artifact loading.
//!
//! A backend pairs an [`EnrollmentSet`] with one of three classifiers. The
//! variant is chosen by which artifacts exist in the model directory:
//!
//! | Files | Variant | Score |
//! |---|---|---|
//! | `classifier.json` + `labels.json` | Probabilistic | class probability, higher is better |
//! | `encodings.json` | NearestNeighbor | Euclidean distance, lower is better |
//! | `lbph.json` + `labels.json` | Histogram | chi-square distance, lower is better |
//!
//! Both embedding variants also need the ArcFace model (`w600k_r50.onnx`).

use crate::embedder::{ArcFaceEmbedder, Embedder, RecognizerError, ARCFACE_MODEL_FILE};
use crate::lbph::LbphModel;
use crate::types::{BoundingBox, Embedding, EnrollmentSet, Identity, Prediction, RawScore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Artifact format version this build understands.
pub const ARTIFACT_VERSION: u32 = 1;

pub const LABELS_FILE: &str = "labels.json";
pub const LBPH_FILE: &str = "lbph.json";
pub const ENCODINGS_FILE: &str = "encodings.json";
pub const CLASSIFIER_FILE: &str = "classifier.json";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("no trained artifacts found in {0}")]
    NotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid artifact {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{path} has version {found}, expected {expected}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    #[error("inconsistent artifact: {0}")]
    Invalid(String),
    #[error("embedder: {0}")]
    Embedder(#[from] RecognizerError),
}

/// Recognition strategy, fixed when the backend is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Histogram,
    NearestNeighbor,
    Probabilistic,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Histogram => "histogram",
            BackendKind::NearestNeighbor => "nearest-neighbor",
            BackendKind::Probabilistic => "probabilistic",
        })
    }
}

#[derive(Deserialize)]
struct LabelsFile {
    version: u32,
    labels: Vec<String>,
}

/// One enrolled embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub name: String,
    pub embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EncodingsFile {
    version: u32,
    entries: Vec<GalleryEntry>,
}

/// Softmax linear classifier over embeddings: `p = softmax(W·e + b)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftmaxClassifier {
    pub version: u32,
    /// One row per class.
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

impl SoftmaxClassifier {
    fn validate(&self) -> Result<(), ArtifactError> {
        if self.weights.len() != self.bias.len() {
            return Err(ArtifactError::Invalid(format!(
                "classifier has {} weight rows but {} biases",
                self.weights.len(),
                self.bias.len()
            )));
        }
        if let Some(first) = self.weights.first() {
            if self.weights.iter().any(|row| row.len() != first.len()) {
                return Err(ArtifactError::Invalid(
                    "classifier weight rows differ in length".into(),
                ));
            }
        }
        Ok(())
    }

    fn input_dim(&self) -> usize {
        self.weights.first().map_or(0, Vec::len)
    }

    /// Arg-max class and its probability. `None` for a classifier with no classes.
    pub fn predict(&self, embedding: &Embedding) -> Result<Option<(usize, f32)>, RecognizerError> {
        if embedding.dim() != self.input_dim() {
            return Err(RecognizerError::DimensionMismatch {
                expected: self.input_dim(),
                actual: embedding.dim(),
            });
        }
        let logits: Vec<f32> = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(&embedding.values).map(|(w, x)| w * x).sum::<f32>() + b)
            .collect();

        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f32 = exps.iter().sum();

        Ok(exps
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(idx, e)| (idx, e / total)))
    }
}

enum Classifier {
    Histogram(LbphModel),
    NearestNeighbor {
        embedder: Box<dyn Embedder>,
        /// (class index, enrolled embedding)
        gallery: Vec<(usize, Embedding)>,
    },
    Probabilistic {
        embedder: Box<dyn Embedder>,
        model: SoftmaxClassifier,
    },
}

/// A loaded classifier plus its label vocabulary.
///
/// Immutable once built; reloading means constructing a new backend and
/// swapping it in whole.
pub struct RecognitionBackend {
    kind: BackendKind,
    enrollment: EnrollmentSet,
    classifier: Classifier,
}

impl RecognitionBackend {
    /// LBPH variant. `labels[i]` names LBPH label `i`.
    pub fn histogram(model: LbphModel, labels: EnrollmentSet) -> Self {
        Self {
            kind: BackendKind::Histogram,
            enrollment: labels,
            classifier: Classifier::Histogram(model),
        }
    }

    /// Nearest-neighbour variant. The enrollment set is the distinct entry
    /// names in first-seen order.
    pub fn nearest_neighbor(embedder: Box<dyn Embedder>, entries: Vec<GalleryEntry>) -> Self {
        let mut names: Vec<String> = Vec::new();
        let gallery = entries
            .into_iter()
            .map(|entry| {
                let idx = match names.iter().position(|n| *n == entry.name) {
                    Some(idx) => idx,
                    None => {
                        names.push(entry.name);
                        names.len() - 1
                    }
                };
                (idx, Embedding::new(entry.embedding))
            })
            .collect();

        Self {
            kind: BackendKind::NearestNeighbor,
            enrollment: EnrollmentSet::new(names.into_iter().map(Identity::new).collect()),
            classifier: Classifier::NearestNeighbor { embedder, gallery },
        }
    }

    /// Softmax variant. `labels[i]` names class row `i`.
    pub fn probabilistic(
        embedder: Box<dyn Embedder>,
        model: SoftmaxClassifier,
        labels: EnrollmentSet,
    ) -> Result<Self, ArtifactError> {
        model.validate()?;
        if model.weights.len() != labels.len() {
            tracing::warn!(
                classes = model.weights.len(),
                labels = labels.len(),
                "classifier and label vocabulary disagree; unmatched classes resolve to Unknown"
            );
        }
        Ok(Self {
            kind: BackendKind::Probabilistic,
            enrollment: labels,
            classifier: Classifier::Probabilistic { embedder, model },
        })
    }

    /// Load whichever variant the artifacts in `model_dir` describe.
    pub fn load(model_dir: &Path) -> Result<Self, ArtifactError> {
        let has = |name: &str| model_dir.join(name).is_file();

        let backend = if has(CLASSIFIER_FILE) && has(LABELS_FILE) {
            let model: SoftmaxClassifier =
                read_versioned(&model_dir.join(CLASSIFIER_FILE), |m: &SoftmaxClassifier| {
                    m.version
                })?;
            let labels = read_labels(&model_dir.join(LABELS_FILE))?;
            let embedder = ArcFaceEmbedder::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
            Self::probabilistic(Box::new(embedder), model, labels)?
        } else if has(ENCODINGS_FILE) {
            let file: EncodingsFile =
                read_versioned(&model_dir.join(ENCODINGS_FILE), |f: &EncodingsFile| f.version)?;
            let embedder = ArcFaceEmbedder::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
            Self::nearest_neighbor(Box::new(embedder), file.entries)
        } else if has(LBPH_FILE) && has(LABELS_FILE) {
            let path = model_dir.join(LBPH_FILE);
            let model: LbphModel = read_versioned(&path, |m: &LbphModel| m.version)?;
            if let Some(bad) = model
                .samples
                .iter()
                .find(|s| s.histogram.len() != model.histogram_len())
            {
                return Err(ArtifactError::Invalid(format!(
                    "{}: sample for label {} has {} bins, expected {}",
                    path.display(),
                    bad.label,
                    bad.histogram.len(),
                    model.histogram_len()
                )));
            }
            let labels = read_labels(&model_dir.join(LABELS_FILE))?;
            Self::histogram(model, labels)
        } else {
            return Err(ArtifactError::NotFound(model_dir.to_path_buf()));
        };

        tracing::info!(
            dir = %model_dir.display(),
            kind = %backend.kind,
            enrolled = backend.enrollment.len(),
            "recognition backend loaded"
        );
        Ok(backend)
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn enrollment(&self) -> &EnrollmentSet {
        &self.enrollment
    }

    /// Classify one detected face. Pure: touches no attendance state.
    pub fn classify(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Prediction, RecognizerError> {
        match &mut self.classifier {
            Classifier::Histogram(model) => {
                let (label, distance) = model
                    .predict_face(gray, width, height, face)
                    .ok_or(RecognizerError::FaceOutOfFrame)?;
                Ok(Prediction {
                    class_index: label,
                    score: RawScore::HistogramDistance(distance),
                })
            }
            Classifier::NearestNeighbor { embedder, gallery } => {
                let query = embedder.embed(gray, width, height, face)?;
                let mut best: Option<(usize, f32)> = None;
                for (idx, enrolled) in gallery.iter() {
                    if enrolled.dim() != query.dim() {
                        return Err(RecognizerError::DimensionMismatch {
                            expected: enrolled.dim(),
                            actual: query.dim(),
                        });
                    }
                    let d = query.euclidean_distance(enrolled);
                    if best.map_or(true, |(_, b)| d < b) {
                        best = Some((*idx, d));
                    }
                }
                let (class_index, distance) = match best {
                    Some((idx, d)) => (idx as i64, d),
                    None => (-1, f32::MAX),
                };
                Ok(Prediction {
                    class_index,
                    score: RawScore::EmbeddingDistance(distance),
                })
            }
            Classifier::Probabilistic { embedder, model } => {
                let query = embedder.embed(gray, width, height, face)?;
                let (class_index, probability) = match model.predict(&query)? {
                    Some((idx, p)) => (idx as i64, p),
                    None => (-1, 0.0),
                };
                Ok(Prediction {
                    class_index,
                    score: RawScore::Probability(probability),
                })
            }
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let text = std::fs::read_to_string(path).map_err(|source| ArtifactError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ArtifactError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn read_versioned<T: DeserializeOwned>(
    path: &Path,
    version: impl Fn(&T) -> u32,
) -> Result<T, ArtifactError> {
    let value: T = read_json(path)?;
    let found = version(&value);
    if found != ARTIFACT_VERSION {
        return Err(ArtifactError::UnsupportedVersion {
            path: path.to_path_buf(),
            found,
            expected: ARTIFACT_VERSION,
        });
    }
    Ok(value)
}

fn read_labels(path: &Path) -> Result<EnrollmentSet, ArtifactError> {
    let file: LabelsFile = read_versioned(path, |f: &LabelsFile| f.version)?;
    Ok(EnrollmentSet::from_names(file.labels))
}
