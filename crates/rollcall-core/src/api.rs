//! Request/response surfaces for hosts.
//!
//! Every handler returns a response value; failures become
//! `status: "error"` with a message and an error kind.

use crate::decode;
use crate::enroll::{self, EnrollmentError, EnrollmentService};
use crate::ledger::{AttendanceLedger, LedgerError};
use crate::provider::EmbeddingProvider;
use crate::recognize::{MatchMode, MatchOutcome, RecognitionError, RecognitionService, DEFAULT_TOLERANCE};
use crate::roster::RosterService;
use crate::store::{DuplicatePolicy, StoreError, TemplateStore};
use crate::types::IdentityLabel;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Name reported for an unrecognized probe.
pub const UNKNOWN_NAME: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Coarse error classification carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    BadImage,
    NoUsableImage,
    CorruptStore,
    Io,
    Provider,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Corrupt { .. } => ErrorKind::CorruptStore,
            StoreError::Io(_) | StoreError::Serialize(_) => ErrorKind::Io,
            StoreError::NonFinite { .. } => ErrorKind::Provider,
        }
    }
}

impl EnrollmentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EnrollmentError::MissingField(_) | EnrollmentError::InvalidField(_) => ErrorKind::Validation,
            EnrollmentError::BadImage { .. } => ErrorKind::BadImage,
            EnrollmentError::NoUsableImage { .. } | EnrollmentError::DimensionMismatch => {
                ErrorKind::NoUsableImage
            }
            EnrollmentError::Provider(_) => ErrorKind::Provider,
            EnrollmentError::Store(e) => e.kind(),
        }
    }
}

impl RecognitionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecognitionError::BadImage(_) => ErrorKind::BadImage,
            RecognitionError::Provider(_) => ErrorKind::Provider,
        }
    }
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Io
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnrollRequest {
    pub name: String,
    pub roll: String,
    /// Base64 images, data URI prefix allowed.
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RecognizeRequest {
    pub image: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MarkRequest {
    pub name: String,
    pub roll: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusResponse {
    pub status: Status,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl StatusResponse {
    fn ok(message: String) -> Self {
        Self {
            status: Status::Ok,
            message,
            kind: None,
        }
    }

    fn error(kind: ErrorKind, message: String) -> Self {
        Self {
            status: Status::Error,
            message,
            kind: Some(kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizeResponse {
    pub status: Status,
    pub recognized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roll: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl RecognizeResponse {
    fn not_recognized(status: Status, message: String, kind: Option<ErrorKind>) -> Self {
        Self {
            status,
            recognized: false,
            name: None,
            roll: None,
            distance: None,
            message: Some(message),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterResponse {
    pub status: Status,
    pub attended_today: Vec<IdentityLabel>,
    pub not_attended_today: Vec<IdentityLabel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Tunables shared by the services.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    pub tolerance: f32,
    pub match_mode: MatchMode,
    pub on_duplicate: DuplicatePolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            match_mode: MatchMode::default(),
            on_duplicate: DuplicatePolicy::default(),
        }
    }
}

/// The four services behind one host-facing handle.
pub struct Attendance<P> {
    store: Arc<TemplateStore>,
    ledger: Arc<AttendanceLedger>,
    enrollment: EnrollmentService<P>,
    recognition: RecognitionService<P>,
    roster: RosterService,
}

impl<P: EmbeddingProvider> Attendance<P> {
    pub fn new(
        provider: Arc<P>,
        store: Arc<TemplateStore>,
        ledger: Arc<AttendanceLedger>,
        settings: Settings,
    ) -> Self {
        Self {
            enrollment: EnrollmentService::new(provider.clone(), store.clone(), settings.on_duplicate),
            recognition: RecognitionService::new(
                provider,
                store.clone(),
                settings.tolerance,
                settings.match_mode,
            ),
            roster: RosterService::new(store.clone(), ledger.clone()),
            store,
            ledger,
        }
    }

    pub fn store(&self) -> &TemplateStore {
        &self.store
    }

    pub fn ledger(&self) -> &AttendanceLedger {
        &self.ledger
    }

    pub fn recognition(&self) -> &RecognitionService<P> {
        &self.recognition
    }

    pub fn enroll(&self, request: &EnrollRequest) -> StatusResponse {
        match self.try_enroll(request) {
            Ok(confirmation) => StatusResponse::ok(format!(
                "Registered {} (Roll: {})",
                confirmation.label.name, confirmation.label.roll
            )),
            Err(err) => {
                tracing::warn!(name = %request.name, roll = %request.roll, error = %err, "enroll failed");
                StatusResponse::error(err.kind(), err.to_string())
            }
        }
    }

    fn try_enroll(&self, request: &EnrollRequest) -> Result<enroll::Confirmation, EnrollmentError> {
        let label = IdentityLabel::new(request.name.trim(), request.roll.trim());
        enroll::validate_label(&label)?;

        let images = request
            .images
            .iter()
            .enumerate()
            .map(|(index, encoded)| {
                decode::decode_base64(encoded).map_err(|source| EnrollmentError::BadImage { index, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.enrollment.enroll(label, &images)
    }

    pub fn recognize(&self, request: &RecognizeRequest) -> RecognizeResponse {
        if request.image.trim().is_empty() {
            return RecognizeResponse::not_recognized(
                Status::Error,
                "No image provided".to_string(),
                Some(ErrorKind::Validation),
            );
        }

        let outcome = decode::decode_base64(&request.image)
            .map_err(RecognitionError::from)
            .and_then(|bytes| self.recognition.recognize(&bytes));

        match outcome {
            Ok(MatchOutcome::NoFaceDetected) => {
                RecognizeResponse::not_recognized(Status::Ok, "No face detected".to_string(), None)
            }
            Ok(MatchOutcome::Unrecognized) => RecognizeResponse {
                status: Status::Ok,
                recognized: false,
                name: Some(UNKNOWN_NAME.to_string()),
                roll: Some(String::new()),
                distance: None,
                message: None,
                kind: None,
            },
            Ok(MatchOutcome::Recognized { label, distance }) => RecognizeResponse {
                status: Status::Ok,
                recognized: true,
                name: Some(label.name),
                roll: Some(label.roll),
                distance: Some(distance),
                message: None,
                kind: None,
            },
            Err(err) => {
                tracing::warn!(error = %err, "recognize failed");
                RecognizeResponse::not_recognized(Status::Error, err.to_string(), Some(err.kind()))
            }
        }
    }

    pub fn mark_attendance(&self, request: &MarkRequest) -> StatusResponse {
        let (name, roll) = (request.name.trim(), request.roll.trim());
        if name.is_empty() || roll.is_empty() {
            return StatusResponse::error(ErrorKind::Validation, "Name & roll required".to_string());
        }

        let label = IdentityLabel::new(name, roll);
        match self.ledger.mark(&label) {
            Ok(_) => StatusResponse::ok(format!("Attendance marked for {name} ({roll}).")),
            Err(err) => {
                tracing::error!(%name, %roll, error = %err, "mark attendance failed");
                StatusResponse::error(err.kind(), err.to_string())
            }
        }
    }

    pub fn attendance_status(&self) -> RosterResponse {
        match self.roster.today() {
            Ok(roster) => RosterResponse {
                status: Status::Ok,
                attended_today: roster.attended.into_iter().collect(),
                not_attended_today: roster.absent.into_iter().collect(),
                message: None,
            },
            Err(err) => {
                tracing::error!(error = %err, "roster query failed");
                RosterResponse {
                    status: Status::Error,
                    attended_today: Vec::new(),
                    not_attended_today: Vec::new(),
                    message: Some(err.to_string()),
                }
            }
        }
    }
}
