//! Test doubles shared by the unit tests.

use crate::provider::{DetectedFace, EmbeddingProvider, ProviderError};
use crate::types::{BoundingBox, Embedding};
use image::{ImageFormat, Rgb, RgbImage};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;

/// A 2x2 PNG whose pixels all carry `key` in the red channel.
pub fn png_bytes(key: u8) -> Vec<u8> {
    let raster = RgbImage::from_pixel(2, 2, Rgb([key, 0, 0]));
    let mut buf = Vec::new();
    raster
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// Provider that answers from a table keyed by the red channel of pixel (0, 0).
/// Unknown keys yield no faces.
#[derive(Default)]
pub struct ScriptedProvider {
    faces: HashMap<u8, Vec<Vec<f32>>>,
    failing: HashSet<u8>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faces(mut self, key: u8, embeddings: Vec<Vec<f32>>) -> Self {
        self.faces.insert(key, embeddings);
        self
    }

    pub fn failing_on(mut self, key: u8) -> Self {
        self.failing.insert(key);
        self
    }
}

impl EmbeddingProvider for ScriptedProvider {
    fn detect_and_encode(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, ProviderError> {
        let key = image.get_pixel(0, 0).0[0];
        if self.failing.contains(&key) {
            return Err(ProviderError(format!("scripted failure for key {key}")));
        }
        let faces = self.faces.get(&key).cloned().unwrap_or_default();
        Ok(faces
            .into_iter()
            .enumerate()
            .map(|(i, values)| DetectedFace {
                region: BoundingBox {
                    x: i as f32,
                    y: 0.0,
                    width: 1.0,
                    height: 1.0,
                    confidence: 1.0,
                },
                embedding: Embedding::new(values),
            })
            .collect())
    }
}
