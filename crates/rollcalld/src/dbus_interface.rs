use rollcall_core::api::{EnrollRequest, MarkRequest, RecognizeRequest};
use rollcall_core::{Attendance, EmbeddingProvider};
use rollcall_vision::OnnxProvider;
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon. Every method replies with a
/// JSON document; failures are reported inside it as `"status": "error"`.
pub struct RollcallService {
    attendance: Arc<Attendance<OnnxProvider>>,
}

impl RollcallService {
    pub fn new(attendance: Arc<Attendance<OnnxProvider>>) -> Self {
        Self { attendance }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl RollcallService {
    /// Enroll an identity from base64-encoded images.
    async fn enroll(&self, name: String, roll: String, images: Vec<String>) -> zbus::fdo::Result<String> {
        tracing::info!(%name, %roll, images = images.len(), "enroll requested");
        let request = EnrollRequest { name, roll, images };
        run_json(&self.attendance, move |a| a.enroll(&request)).await
    }

    /// Identify the first face in a base64-encoded image.
    async fn recognize(&self, image: String) -> zbus::fdo::Result<String> {
        tracing::debug!(bytes = image.len(), "recognize requested");
        let request = RecognizeRequest { image };
        run_json(&self.attendance, move |a| a.recognize(&request)).await
    }

    async fn mark_attendance(&self, name: String, roll: String) -> zbus::fdo::Result<String> {
        let request = MarkRequest { name, roll };
        run_json(&self.attendance, move |a| a.mark_attendance(&request)).await
    }

    /// Today's attended / not-attended partition.
    async fn attendance_status(&self) -> zbus::fdo::Result<String> {
        run_json(&self.attendance, |a| a.attendance_status()).await
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        run_json(&self.attendance, status_report).await
    }
}

fn status_report<P: EmbeddingProvider>(attendance: &Attendance<P>) -> serde_json::Value {
    let recognition = attendance.recognition();
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "templates": attendance.store().snapshot().len(),
        "store": attendance.store().path().display().to_string(),
        "ledger": attendance.ledger().path().display().to_string(),
        "tolerance": recognition.tolerance(),
        "match_mode": recognition.mode(),
    })
}

/// Run `f` on the blocking pool and serialize its reply.
async fn run_json<P, F, R>(attendance: &Arc<Attendance<P>>, f: F) -> zbus::fdo::Result<String>
where
    P: EmbeddingProvider + 'static,
    F: FnOnce(&Attendance<P>) -> R + Send + 'static,
    R: Serialize + Send + 'static,
{
    let attendance = Arc::clone(attendance);
    let reply = tokio::task::spawn_blocking(move || f(&attendance))
        .await
        .map_err(|e| zbus::fdo::Error::Failed(format!("worker task failed: {e}")))?;
    serde_json::to_string(&reply).map_err(|e| zbus::fdo::Error::Failed(format!("encoding reply: {e}")))
}
