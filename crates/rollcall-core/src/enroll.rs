//! Enrollment: a batch of images becomes one averaged template.

use crate::decode::{self, DecodeError};
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::store::{DuplicatePolicy, StoreError, TemplateStore};
use crate::types::{Embedding, IdentityLabel, Template, LABEL_SEPARATOR};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("{0} must not contain '|'")]
    InvalidField(&'static str),
    #[error("image {index} could not be decoded: {source}")]
    BadImage {
        index: usize,
        #[source]
        source: DecodeError,
    },
    #[error("none of the {submitted} submitted images contained exactly one usable face")]
    NoUsableImage { submitted: usize },
    #[error("accepted embeddings disagree on dimension")]
    DimensionMismatch,
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Successful enrollment summary.
#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    pub label: IdentityLabel,
    pub usable_images: usize,
    pub submitted_images: usize,
    /// An existing template for the label was overwritten.
    pub replaced: bool,
}

pub struct EnrollmentService<P> {
    provider: Arc<P>,
    store: Arc<TemplateStore>,
    on_duplicate: DuplicatePolicy,
}

impl<P: EmbeddingProvider> EnrollmentService<P> {
    pub fn new(provider: Arc<P>, store: Arc<TemplateStore>, on_duplicate: DuplicatePolicy) -> Self {
        Self {
            provider,
            store,
            on_duplicate,
        }
    }

    /// Average the single-face images of the batch into a template and
    /// persist it.
    ///
    /// Images with zero or several faces are skipped. Only a batch with no
    /// usable image at all is an error.
    pub fn enroll<B: AsRef<[u8]>>(
        &self,
        label: IdentityLabel,
        images: &[B],
    ) -> Result<Confirmation, EnrollmentError> {
        validate_label(&label)?;

        let mut accepted = Vec::new();
        for (index, bytes) in images.iter().enumerate() {
            let raster = decode::decode_image(bytes.as_ref())
                .map_err(|source| EnrollmentError::BadImage { index, source })?;
            let mut faces = self.provider.detect_and_encode(&raster)?;

            if faces.len() != 1 {
                tracing::debug!(index, faces = faces.len(), "enroll: image skipped");
                continue;
            }
            let embedding = faces.remove(0).embedding;
            if !embedding.is_finite() {
                tracing::warn!(index, "enroll: provider returned a non-finite embedding, image skipped");
                continue;
            }
            accepted.push(embedding);
        }

        if accepted.is_empty() {
            return Err(EnrollmentError::NoUsableImage {
                submitted: images.len(),
            });
        }

        let embedding = Embedding::mean(&accepted).ok_or(EnrollmentError::DimensionMismatch)?;
        let template = Template::new(label.clone(), embedding);
        let policy = self.on_duplicate;
        let replaced = self.store.update(|gallery| gallery.upsert(template, policy))?;

        tracing::info!(
            name = %label.name,
            roll = %label.roll,
            usable = accepted.len(),
            submitted = images.len(),
            replaced,
            "enrolled"
        );

        Ok(Confirmation {
            label,
            usable_images: accepted.len(),
            submitted_images: images.len(),
            replaced,
        })
    }
}

/// Both parts must be non-blank and free of the label separator.
pub fn validate_label(label: &IdentityLabel) -> Result<(), EnrollmentError> {
    validate_field("name", &label.name)?;
    validate_field("roll", &label.roll)
}

fn validate_field(field: &'static str, value: &str) -> Result<(), EnrollmentError> {
    if value.trim().is_empty() {
        return Err(EnrollmentError::MissingField(field));
    }
    if value.contains(LABEL_SEPARATOR) {
        return Err(EnrollmentError::InvalidField(field));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CorruptStorePolicy;
    use crate::testing::{png_bytes, ScriptedProvider};
    use tempfile::TempDir;

    fn setup(
        dir: &TempDir,
        provider: ScriptedProvider,
        policy: DuplicatePolicy,
    ) -> (EnrollmentService<ScriptedProvider>, Arc<TemplateStore>) {
        let store = Arc::new(
            TemplateStore::open(dir.path().join("templates.json"), CorruptStorePolicy::Fail).unwrap(),
        );
        (
            EnrollmentService::new(Arc::new(provider), store.clone(), policy),
            store,
        )
    }

    /// Keys 1-3 have one face each, 4 has two faces, 5 has none.
    fn mixed_provider() -> ScriptedProvider {
        ScriptedProvider::new()
            .with_faces(1, vec![vec![1.0, 0.0, 2.0]])
            .with_faces(2, vec![vec![3.0, 1.0, 2.0]])
            .with_faces(3, vec![vec![2.0, 2.0, 2.0]])
            .with_faces(4, vec![vec![100.0, 100.0, 100.0], vec![-100.0, 0.0, 0.0]])
    }

    #[test]
    fn test_template_is_mean_of_single_face_images() {
        let dir = TempDir::new().unwrap();
        let (svc, store) = setup(&dir, mixed_provider(), DuplicatePolicy::Append);
        let images: Vec<Vec<u8>> = [1, 4, 2, 5, 3].iter().map(|&k| png_bytes(k)).collect();

        let confirmation = svc.enroll(IdentityLabel::new("Asha", "7"), &images).unwrap();
        assert_eq!(confirmation.usable_images, 3);
        assert_eq!(confirmation.submitted_images, 5);
        assert!(!confirmation.replaced);

        let gallery = store.load().unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.templates()[0].label, IdentityLabel::new("Asha", "7"));
        assert_eq!(gallery.templates()[0].embedding.values, vec![2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_no_usable_image_leaves_store_unchanged() {
        let dir = TempDir::new().unwrap();
        let (svc, store) = setup(&dir, mixed_provider(), DuplicatePolicy::Append);

        let err = svc
            .enroll(IdentityLabel::new("Asha", "7"), &[png_bytes(4), png_bytes(5)])
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::NoUsableImage { submitted: 2 }));
        assert!(!store.path().exists());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_empty_batch_is_no_usable_image() {
        let dir = TempDir::new().unwrap();
        let (svc, _) = setup(&dir, mixed_provider(), DuplicatePolicy::Append);
        let images: Vec<Vec<u8>> = Vec::new();
        let err = svc.enroll(IdentityLabel::new("Asha", "7"), &images).unwrap_err();
        assert!(matches!(err, EnrollmentError::NoUsableImage { submitted: 0 }));
    }

    #[test]
    fn test_non_finite_embedding_skipped() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new()
            .with_faces(1, vec![vec![f32::NAN, 0.0]])
            .with_faces(2, vec![vec![1.0, 1.0]])
            .with_faces(3, vec![vec![f32::INFINITY, 0.0]]);
        let (svc, store) = setup(&dir, provider, DuplicatePolicy::Append);

        let confirmation = svc
            .enroll(IdentityLabel::new("Asha", "1"), &[png_bytes(1), png_bytes(2), png_bytes(3)])
            .unwrap();
        assert_eq!(confirmation.usable_images, 1);
        assert_eq!(store.load().unwrap().templates()[0].embedding.values, vec![1.0, 1.0]);

        // The blob still loads, so later enrollments and restarts work.
        svc.enroll(IdentityLabel::new("Ben", "2"), &[png_bytes(2)]).unwrap();
        let reopened =
            TemplateStore::open(store.path().to_path_buf(), CorruptStorePolicy::Fail).unwrap();
        assert_eq!(reopened.snapshot().len(), 2);
    }

    #[test]
    fn test_only_non_finite_embeddings_is_no_usable_image() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new().with_faces(1, vec![vec![f32::NAN, 0.0]]);
        let (svc, store) = setup(&dir, provider, DuplicatePolicy::Append);

        let err = svc.enroll(IdentityLabel::new("Asha", "1"), &[png_bytes(1)]).unwrap_err();
        assert!(matches!(err, EnrollmentError::NoUsableImage { submitted: 1 }));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_missing_fields_checked_before_provider() {
        let dir = TempDir::new().unwrap();
        let (svc, _) = setup(&dir, ScriptedProvider::new().failing_on(1), DuplicatePolicy::Append);

        let err = svc.enroll(IdentityLabel::new("", "7"), &[png_bytes(1)]).unwrap_err();
        assert!(matches!(err, EnrollmentError::MissingField("name")));

        let err = svc.enroll(IdentityLabel::new("Asha", "  "), &[png_bytes(1)]).unwrap_err();
        assert!(matches!(err, EnrollmentError::MissingField("roll")));
    }

    #[test]
    fn test_separator_in_field_rejected() {
        let dir = TempDir::new().unwrap();
        let (svc, _) = setup(&dir, mixed_provider(), DuplicatePolicy::Append);
        let err = svc.enroll(IdentityLabel::new("A|B", "7"), &[png_bytes(1)]).unwrap_err();
        assert!(matches!(err, EnrollmentError::InvalidField("name")));
    }

    #[test]
    fn test_bad_image_reports_position() {
        let dir = TempDir::new().unwrap();
        let (svc, store) = setup(&dir, mixed_provider(), DuplicatePolicy::Append);
        let images = vec![png_bytes(1), b"garbage".to_vec()];
        let err = svc.enroll(IdentityLabel::new("Asha", "7"), &images).unwrap_err();
        assert!(matches!(err, EnrollmentError::BadImage { index: 1, .. }));
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_provider_failure_propagates() {
        let dir = TempDir::new().unwrap();
        let (svc, _) = setup(&dir, ScriptedProvider::new().failing_on(1), DuplicatePolicy::Append);
        let err = svc.enroll(IdentityLabel::new("Asha", "7"), &[png_bytes(1)]).unwrap_err();
        assert!(matches!(err, EnrollmentError::Provider(_)));
    }

    #[test]
    fn test_dimension_mismatch() {
        let dir = TempDir::new().unwrap();
        let provider = ScriptedProvider::new()
            .with_faces(1, vec![vec![1.0]])
            .with_faces(2, vec![vec![1.0, 2.0]]);
        let (svc, _) = setup(&dir, provider, DuplicatePolicy::Append);
        let err = svc
            .enroll(IdentityLabel::new("Asha", "7"), &[png_bytes(1), png_bytes(2)])
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::DimensionMismatch));
    }

    #[test]
    fn test_re_enrollment_appends_by_default() {
        let dir = TempDir::new().unwrap();
        let (svc, store) = setup(&dir, mixed_provider(), DuplicatePolicy::Append);
        let label = IdentityLabel::new("Asha", "7");
        svc.enroll(label.clone(), &[png_bytes(1)]).unwrap();
        svc.enroll(label.clone(), &[png_bytes(2)]).unwrap();

        let gallery = store.load().unwrap();
        assert_eq!(gallery.len(), 2);
        assert!(gallery.labels().all(|l| *l == label));
    }

    #[test]
    fn test_re_enrollment_replace_policy() {
        let dir = TempDir::new().unwrap();
        let (svc, store) = setup(&dir, mixed_provider(), DuplicatePolicy::Replace);
        let label = IdentityLabel::new("Asha", "7");
        svc.enroll(label.clone(), &[png_bytes(1)]).unwrap();
        let second = svc.enroll(label, &[png_bytes(2)]).unwrap();

        assert!(second.replaced);
        let gallery = store.load().unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.templates()[0].embedding.values, vec![3.0, 1.0, 2.0]);
    }

    #[test]
    fn test_enrollments_survive_reopen_in_order() {
        let dir = TempDir::new().unwrap();
        let (svc, _) = setup(&dir, mixed_provider(), DuplicatePolicy::Append);
        for (i, key) in [1u8, 2, 3].iter().enumerate() {
            svc.enroll(IdentityLabel::new(format!("s{i}"), i.to_string()), &[png_bytes(*key)])
                .unwrap();
        }

        let reopened =
            TemplateStore::open(dir.path().join("templates.json"), CorruptStorePolicy::Fail).unwrap();
        let gallery = reopened.snapshot();
        let names: Vec<_> = gallery.labels().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["s0", "s1", "s2"]);
        assert_eq!(gallery.templates()[2].embedding.values, vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_concurrent_enrollments_lose_no_write() {
        let dir = TempDir::new().unwrap();
        let (svc, store) = setup(&dir, mixed_provider(), DuplicatePolicy::Append);
        let svc = Arc::new(svc);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let svc = svc.clone();
                std::thread::spawn(move || {
                    svc.enroll(IdentityLabel::new(format!("student{i}"), i.to_string()), &[png_bytes(1)])
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let gallery = store.load().unwrap();
        assert_eq!(gallery.len(), 8);
        for i in 0..8 {
            let label = IdentityLabel::new(format!("student{i}"), i.to_string());
            assert!(gallery.labels().any(|l| *l == label), "missing {label}");
        }
    }
}
