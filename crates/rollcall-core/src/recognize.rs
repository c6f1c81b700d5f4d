//! Probe-vs-gallery matching.

use crate::decode::{self, DecodeError};
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::store::TemplateStore;
use crate::types::{Embedding, IdentityLabel, Template};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Default maximum Euclidean distance for a match.
pub const DEFAULT_TOLERANCE: f32 = 0.45;

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("bad probe image: {0}")]
    BadImage(#[from] DecodeError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Result of recognizing one probe image.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    NoFaceDetected,
    Unrecognized,
    Recognized { label: IdentityLabel, distance: f32 },
}

/// A gallery entry that satisfied the tolerance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    /// Position in gallery order.
    pub index: usize,
    pub distance: f32,
}

/// Strategy for choosing among the templates within tolerance of a probe.
pub trait Matcher {
    fn find(&self, probe: &Embedding, gallery: &[Template], tolerance: f32) -> Option<Match>;
}

/// Candidates are templates at distance `<= tolerance`. Templates of a
/// different dimension never qualify.
fn candidates<'a>(
    probe: &'a Embedding,
    gallery: &'a [Template],
    tolerance: f32,
) -> impl Iterator<Item = Match> + 'a {
    gallery.iter().enumerate().filter_map(move |(index, template)| {
        let distance = probe.euclidean_distance(&template.embedding)?;
        (distance <= tolerance).then_some(Match { index, distance })
    })
}

/// First candidate in gallery order wins, even when a later one is closer.
pub struct FirstMatch;

impl Matcher for FirstMatch {
    fn find(&self, probe: &Embedding, gallery: &[Template], tolerance: f32) -> Option<Match> {
        candidates(probe, gallery, tolerance).next()
    }
}

/// Nearest candidate wins; ties go to the earlier template.
pub struct BestMatch;

impl Matcher for BestMatch {
    fn find(&self, probe: &Embedding, gallery: &[Template], tolerance: f32) -> Option<Match> {
        candidates(probe, gallery, tolerance).fold(None, |best: Option<Match>, m| match best {
            Some(b) if b.distance <= m.distance => Some(b),
            _ => Some(m),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    First,
    Best,
}

impl MatchMode {
    pub fn matcher(self) -> &'static dyn Matcher {
        match self {
            MatchMode::First => &FirstMatch,
            MatchMode::Best => &BestMatch,
        }
    }
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(Self::First),
            "best" => Ok(Self::Best),
            other => Err(format!("unknown match mode {other:?} (expected first|best)")),
        }
    }
}

/// Matches probe images against the resident gallery.
pub struct RecognitionService<P> {
    provider: Arc<P>,
    store: Arc<TemplateStore>,
    tolerance: f32,
    mode: MatchMode,
}

impl<P: EmbeddingProvider> RecognitionService<P> {
    pub fn new(provider: Arc<P>, store: Arc<TemplateStore>, tolerance: f32, mode: MatchMode) -> Self {
        Self {
            provider,
            store,
            tolerance,
            mode,
        }
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Recognize the first face in an encoded probe image.
    pub fn recognize(&self, probe: &[u8]) -> Result<MatchOutcome, RecognitionError> {
        let raster = decode::decode_image(probe)?;
        let faces = self.provider.detect_and_encode(&raster)?;

        let Some(face) = faces.first() else {
            tracing::debug!("recognize: no face detected");
            return Ok(MatchOutcome::NoFaceDetected);
        };
        if faces.len() > 1 {
            tracing::debug!(faces = faces.len(), "recognize: multiple faces, using the first");
        }

        Ok(self.match_embedding(&face.embedding))
    }

    /// Match an already extracted embedding.
    pub fn match_embedding(&self, probe: &Embedding) -> MatchOutcome {
        let gallery = self.store.snapshot();
        let templates = gallery.templates();

        match self.mode.matcher().find(probe, templates, self.tolerance) {
            Some(m) => {
                let label = templates[m.index].label.clone();
                tracing::info!(
                    name = %label.name,
                    roll = %label.roll,
                    distance = m.distance,
                    index = m.index,
                    "recognized"
                );
                MatchOutcome::Recognized {
                    label,
                    distance: m.distance,
                }
            }
            None => {
                tracing::info!(gallery = templates.len(), tolerance = self.tolerance, "unrecognized");
                MatchOutcome::Unrecognized
            }
        }
    }
}
