//! The face detection + encoding capability consumed by the services.

use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("embedding provider failed: {0}")]
pub struct ProviderError(pub String);

/// One face found in an image.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub region: BoundingBox,
    pub embedding: Embedding,
}

/// Image in, zero or more face embeddings out.
///
/// Implementations must be deterministic for identical pixels and return
/// embeddings of one fixed dimension. The order of the returned faces is
/// implementation-defined; recognition uses the first one.
pub trait EmbeddingProvider: Send + Sync {
    fn detect_and_encode(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, ProviderError>;
}
