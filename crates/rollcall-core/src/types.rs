use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between name and roll in the persisted label form.
pub const LABEL_SEPARATOR: char = '|';

/// Identity of an enrolled person: the `(name, roll)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityLabel {
    pub name: String,
    pub roll: String,
}

impl IdentityLabel {
    pub fn new(name: impl Into<String>, roll: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roll: roll.into(),
        }
    }

    /// Persisted form, `"name|roll"`.
    pub fn encode(&self) -> String {
        format!("{}{LABEL_SEPARATOR}{}", self.name, self.roll)
    }

    /// Parse the persisted form. Returns `None` unless the text splits into
    /// exactly two parts.
    pub fn parse(encoded: &str) -> Option<Self> {
        let mut parts = encoded.split(LABEL_SEPARATOR);
        let name = parts.next()?;
        let roll = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(name, roll))
    }
}

impl fmt::Display for IdentityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Roll: {})", self.name, self.roll)
    }
}

/// Bounding region of a detected face, in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face embedding vector. Dimension is fixed per deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// No NaN or infinite component.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Returns `None` when the dimensions differ.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>();
        Some(sum.sqrt())
    }

    /// Component-wise arithmetic mean.
    ///
    /// Returns `None` for an empty slice or when dimensions disagree.
    pub fn mean(embeddings: &[Embedding]) -> Option<Embedding> {
        let first = embeddings.first()?;
        let dim = first.dimension();
        if embeddings.iter().any(|e| e.dimension() != dim) {
            return None;
        }

        // Accumulate in f64 so long batches don't drift.
        let mut sums = vec![0.0f64; dim];
        for embedding in embeddings {
            for (acc, &v) in sums.iter_mut().zip(embedding.values.iter()) {
                *acc += v as f64;
            }
        }

        let count = embeddings.len() as f64;
        Some(Embedding {
            values: sums.into_iter().map(|s| (s / count) as f32).collect(),
        })
    }
}

/// The stored representative embedding for one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub label: IdentityLabel,
    pub embedding: Embedding,
}

impl Template {
    pub fn new(label: IdentityLabel, embedding: Embedding) -> Self {
        Self { label, embedding }
    }
}
