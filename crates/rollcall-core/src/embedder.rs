//! Face embedding extraction.
//!
//! [`Embedder`] turns a detected face into a fixed-length vector;
//! [`ArcFaceEmbedder`] runs the w600k_r50 ArcFace model on ONNX Runtime.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{BoundingBox, Embedding};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// ArcFace normalises symmetrically, unlike SCRFD.
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

/// File name of the embedder model inside the artifact bundle.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("embedder model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face lies outside the frame")]
    FaceOutOfFrame,
    #[error("embedding has {actual} dimensions, classifier expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces an embedding for one face in a grayscale frame.
pub trait Embedder: Send {
    fn embed(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError>;
}

/// ArcFace embedder (512-d, L2-normalised output).
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// 112×112 grayscale crop → 1×3×112×112 tensor, channels replicated.
    fn preprocess(aligned: &[u8]) -> Array4<f32> {
        let size = ALIGNED_SIZE as usize;
        Array4::from_shape_fn((1, 3, size, size), |(_, _, y, x)| {
            let pixel = aligned.get(y * size + x).copied().unwrap_or(0) as f32;
            (pixel - ARCFACE_MEAN) / ARCFACE_STD
        })
    }
}

impl Embedder for ArcFaceEmbedder {
    fn embed(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let aligned = match &face.landmarks {
            Some(landmarks) => alignment::align_face(gray, width, height, landmarks),
            None => alignment::crop_face(gray, width, height, face)
                .ok_or(RecognizerError::FaceOutOfFrame)?,
        };

        let input = Self::preprocess(&aligned);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding output: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::DimensionMismatch {
                expected: ARCFACE_EMBEDDING_DIM,
                actual: raw.len(),
            });
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}
