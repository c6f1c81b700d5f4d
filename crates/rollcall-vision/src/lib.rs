//! rollcall-vision: ONNX face detection and encoding.
//!
//! [`OnnxProvider`] pairs an SCRFD detector with an ArcFace encoder and
//! implements [`rollcall_core::EmbeddingProvider`].

pub mod alignment;
pub mod detector;
pub mod encoder;

use detector::{DetectorError, FaceDetector};
use encoder::{EncoderError, FaceEncoder};
use image::RgbImage;
use rollcall_core::{DetectedFace, EmbeddingProvider, ProviderError};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

pub const DETECTOR_MODEL: &str = "det_10g.onnx";
pub const ENCODER_MODEL: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum VisionError {
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
}

/// ONNX sessions need `&mut` to run, so each sits behind its own lock.
pub struct OnnxProvider {
    detector: Mutex<FaceDetector>,
    encoder: Mutex<FaceEncoder>,
}

impl OnnxProvider {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, VisionError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL))?;
        let encoder = FaceEncoder::load(&model_dir.join(ENCODER_MODEL))?;
        Ok(Self {
            detector: Mutex::new(detector),
            encoder: Mutex::new(encoder),
        })
    }
}

impl EmbeddingProvider for OnnxProvider {
    fn detect_and_encode(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, ProviderError> {
        let detections = self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .detect(image)
            .map_err(|e| ProviderError(e.to_string()))?;

        let mut encoder = self.encoder.lock().unwrap_or_else(PoisonError::into_inner);
        let mut faces = Vec::with_capacity(detections.len());
        for detection in detections {
            let Some(landmarks) = detection.landmarks else {
                tracing::debug!(bbox = ?detection.bbox, "skipping face without landmarks");
                continue;
            };
            let embedding = encoder
                .encode(image, &landmarks)
                .map_err(|e| ProviderError(e.to_string()))?;
            faces.push(DetectedFace {
                region: detection.bbox,
                embedding,
            });
        }
        Ok(faces)
    }
}
