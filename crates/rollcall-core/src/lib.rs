//! rollcall-core — Face detection and recognition for attendance capture.
//!
//! SCRFD finds faces; one of three trained classifiers (LBPH histograms,
//! a nearest-neighbour embedding gallery, or a softmax classifier over
//! embeddings) names them; [`ConfidencePolicy`] decides whether a name is
//! trusted enough to count.

pub mod alignment;
pub mod analyzer;
pub mod backend;
pub mod detector;
pub mod embedder;
pub mod lbph;
pub mod policy;
pub mod types;

pub use analyzer::FaceAnalyzer;
pub use backend::{ArtifactError, BackendKind, RecognitionBackend};
pub use detector::{DetectorError, DetectorOptions, FaceDetector, ScrfdDetector, SCRFD_MODEL_FILE};
pub use embedder::{ArcFaceEmbedder, Embedder, RecognizerError};
pub use policy::ConfidencePolicy;
pub use types::{
    BoundingBox, Detection, Embedding, EnrollmentSet, Identity, Prediction, RawScore,
    RecognitionOutcome,
};
