//! Detector plus optional recognition backend.

use crate::backend::{BackendKind, RecognitionBackend};
use crate::detector::{DetectorError, FaceDetector};
use crate::types::{Detection, EnrollmentSet};

/// What the pipeline calls once per frame.
///
/// Either half may be missing. Without a detector every frame has no faces;
/// without a backend faces are reported but never named.
#[derive(Default)]
pub struct FaceAnalyzer {
    detector: Option<Box<dyn FaceDetector>>,
    backend: Option<RecognitionBackend>,
}

impl FaceAnalyzer {
    pub fn new(
        detector: Option<Box<dyn FaceDetector>>,
        backend: Option<RecognitionBackend>,
    ) -> Self {
        Self { detector, backend }
    }

    /// Detect faces and, if a backend is loaded, classify each one.
    ///
    /// A classifier failure on one face leaves that detection without a
    /// prediction; only detector failures are returned as errors.
    pub fn detect_and_classify(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, DetectorError> {
        let Some(detector) = self.detector.as_mut() else {
            return Ok(Vec::new());
        };
        let faces = detector.detect(gray, width, height)?;

        Ok(faces
            .into_iter()
            .map(|bbox| {
                let prediction = self.backend.as_mut().and_then(|backend| {
                    backend
                        .classify(gray, width, height, &bbox)
                        .map_err(|e| tracing::warn!(error = %e, "face classification failed"))
                        .ok()
                });
                Detection { bbox, prediction }
            })
            .collect())
    }

    /// Swap in a new backend (or none), returning the old one.
    pub fn replace_backend(
        &mut self,
        backend: Option<RecognitionBackend>,
    ) -> Option<RecognitionBackend> {
        std::mem::replace(&mut self.backend, backend)
    }

    pub fn has_detector(&self) -> bool {
        self.detector.is_some()
    }

    pub fn recognition_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(RecognitionBackend::kind)
    }

    pub fn enrollment(&self) -> Option<&EnrollmentSet> {
        self.backend.as_ref().map(RecognitionBackend::enrollment)
    }
}
