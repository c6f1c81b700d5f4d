//! rollcall-core: Face template enrollment, recognition and attendance.
//!
//! Face detection and encoding are consumed through the
//! [`EmbeddingProvider`] trait; everything else (the durable template store,
//! first-match recognition, the attendance ledger and daily rosters) lives
//! here.

pub mod api;
pub mod decode;
pub mod enroll;
pub mod ledger;
pub mod provider;
pub mod recognize;
pub mod roster;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{Attendance, Settings};
pub use enroll::{Confirmation, EnrollmentError, EnrollmentService};
pub use ledger::{AttendanceLedger, AttendanceRecord, LedgerError};
pub use provider::{DetectedFace, EmbeddingProvider, ProviderError};
pub use recognize::{BestMatch, FirstMatch, MatchMode, MatchOutcome, Matcher, RecognitionError, RecognitionService};
pub use roster::{Roster, RosterService};
pub use store::{CorruptStorePolicy, DuplicatePolicy, Gallery, StoreError, TemplateStore};
pub use types::{BoundingBox, Embedding, IdentityLabel, Template};
