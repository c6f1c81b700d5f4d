//! Durable template store.
//!
//! The whole gallery is persisted as one JSON blob with two index-aligned
//! sequences, `embeddings` and `labels`. Writes go to a sibling temp file
//! that is renamed over the blob, so readers never observe a partial file.

use crate::types::{Embedding, IdentityLabel, Template};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("template store {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
    #[error("template store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("template store serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("template for {label} has a non-finite component and was not saved")]
    NonFinite { label: String },
}

/// What enrollment does when the label already has a template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Keep the old template and add another one at the end.
    #[default]
    Append,
    /// Overwrite the first template with that label in place.
    Replace,
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(Self::Append),
            "replace" => Ok(Self::Replace),
            other => Err(format!("unknown duplicate policy {other:?} (expected append|replace)")),
        }
    }
}

/// What `TemplateStore::open` does with an unreadable blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptStorePolicy {
    #[default]
    Fail,
    /// Serve an empty resident gallery. The file itself is left alone and
    /// writes keep failing until it is repaired.
    Degrade,
}

impl FromStr for CorruptStorePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "degrade" => Ok(Self::Degrade),
            other => Err(format!("unknown corrupt-store policy {other:?} (expected fail|degrade)")),
        }
    }
}

/// On-disk shape of the blob.
#[derive(Serialize, Deserialize)]
struct StoreFile {
    embeddings: Vec<Vec<f32>>,
    labels: Vec<String>,
}

/// Ordered sequence of templates. Insertion order is match order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    templates: Vec<Template>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_templates(templates: Vec<Template>) -> Self {
        Self { templates }
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &IdentityLabel> {
        self.templates.iter().map(|t| &t.label)
    }

    /// Add a template at the end. Existing templates with the same label
    /// are not inspected.
    pub fn append(mut self, template: Template) -> Self {
        self.templates.push(template);
        self
    }

    /// Insert under `policy`. The flag is true when an existing template
    /// was replaced.
    pub fn upsert(mut self, template: Template, policy: DuplicatePolicy) -> (Self, bool) {
        let existing = match policy {
            DuplicatePolicy::Append => None,
            DuplicatePolicy::Replace => self.templates.iter().position(|t| t.label == template.label),
        };
        let Some(first) = existing else {
            return (self.append(template), false);
        };

        let label = template.label.clone();
        self.templates[first] = template;
        let mut idx = 0;
        self.templates.retain(|t| {
            let keep = idx <= first || t.label != label;
            idx += 1;
            keep
        });
        (self, true)
    }

    fn to_file(&self) -> StoreFile {
        StoreFile {
            embeddings: self.templates.iter().map(|t| t.embedding.values.clone()).collect(),
            labels: self.templates.iter().map(|t| t.label.encode()).collect(),
        }
    }

    fn from_file(file: StoreFile) -> Result<Self, String> {
        if file.embeddings.len() != file.labels.len() {
            return Err(format!(
                "{} embeddings but {} labels",
                file.embeddings.len(),
                file.labels.len()
            ));
        }

        let dimension = file.embeddings.first().map(Vec::len);
        let mut templates = Vec::with_capacity(file.labels.len());
        for (i, (values, raw_label)) in file.embeddings.into_iter().zip(file.labels).enumerate() {
            if Some(values.len()) != dimension {
                return Err(format!(
                    "entry {i} has dimension {}, expected {}",
                    values.len(),
                    dimension.unwrap_or_default()
                ));
            }
            let label = IdentityLabel::parse(&raw_label)
                .ok_or_else(|| format!("entry {i} has malformed label {raw_label:?}"))?;
            templates.push(Template::new(label, Embedding::new(values)));
        }

        Ok(Self { templates })
    }
}

/// Handle to the durable store plus a resident copy for readers.
///
/// All writes are serialized by one writer lock held across the whole
/// load-modify-save cycle.
pub struct TemplateStore {
    path: PathBuf,
    writer: Mutex<()>,
    resident: RwLock<Arc<Gallery>>,
    /// Opened over a corrupt blob; cleared once the blob reads cleanly.
    degraded: AtomicBool,
}

impl TemplateStore {
    /// Open the store at `path`, loading the resident gallery.
    pub fn open(path: impl Into<PathBuf>, on_corrupt: CorruptStorePolicy) -> Result<Self, StoreError> {
        let path = path.into();
        let (gallery, degraded) = match load_from(&path) {
            Ok(gallery) => (gallery, false),
            Err(err @ StoreError::Corrupt { .. }) if on_corrupt == CorruptStorePolicy::Degrade => {
                tracing::error!(error = %err, "serving an empty gallery until the store is repaired");
                (Gallery::new(), true)
            }
            Err(err) => return Err(err),
        };

        tracing::info!(path = %path.display(), templates = gallery.len(), "template store opened");

        Ok(Self {
            path,
            writer: Mutex::new(()),
            resident: RwLock::new(Arc::new(gallery)),
            degraded: AtomicBool::new(degraded),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the durable blob. A missing file is an empty gallery.
    pub fn load(&self) -> Result<Gallery, StoreError> {
        load_from(&self.path)
    }

    /// Replace the durable blob with `gallery` and make it resident.
    ///
    /// A store opened degraded refuses to overwrite the blob until it reads
    /// cleanly again.
    pub fn save(&self, gallery: &Gallery) -> Result<(), StoreError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.degraded.load(Ordering::Acquire) {
            load_from(&self.path)?;
            self.repaired();
        }
        write_atomic(&self.path, gallery)?;
        self.set_resident(gallery.clone());
        Ok(())
    }

    /// Load, apply `f`, save, all under the writer lock.
    ///
    /// On any failure the blob and the resident gallery keep their previous
    /// contents.
    pub fn update<T>(&self, f: impl FnOnce(Gallery) -> (Gallery, T)) -> Result<T, StoreError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = load_from(&self.path)?;
        self.repaired();
        let (next, out) = f(current);
        write_atomic(&self.path, &next)?;
        self.set_resident(next);
        Ok(out)
    }

    /// Current resident gallery. Never blocks on writers for longer than a
    /// pointer swap.
    pub fn snapshot(&self) -> Arc<Gallery> {
        self.resident
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Refresh the resident gallery from disk.
    pub fn reload(&self) -> Result<Arc<Gallery>, StoreError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let gallery = load_from(&self.path)?;
        self.repaired();
        self.set_resident(gallery);
        Ok(self.snapshot())
    }

    /// True while the store was opened over a corrupt blob that has not
    /// been read cleanly since.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn repaired(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            tracing::info!(path = %self.path.display(), "template store repaired");
        }
    }

    fn set_resident(&self, gallery: Gallery) {
        *self.resident.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(gallery);
    }
}

fn load_from(path: &Path) -> Result<Gallery, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Gallery::new()),
        Err(e) => return Err(e.into()),
    };

    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.display().to_string(),
        reason,
    };
    let file: StoreFile = serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
    Gallery::from_file(file).map_err(corrupt)
}

fn write_atomic(path: &Path, gallery: &Gallery) -> Result<(), StoreError> {
    // JSON has no NaN or infinity; such a value would come back unreadable.
    if let Some(bad) = gallery.templates.iter().find(|t| !t.embedding.is_finite()) {
        return Err(StoreError::NonFinite {
            label: bad.label.encode(),
        });
    }

    let bytes = serde_json::to_vec(&gallery.to_file()).map_err(StoreError::Serialize)?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "templates".to_string());
    let tmp = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    let written = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    tracing::debug!(path = %path.display(), templates = gallery.len(), "template store saved");
    Ok(())
}
