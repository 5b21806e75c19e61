use crate::capture;
use chrono::NaiveDate;
use image::{Rgb, RgbImage};
use rollcall_core::{
    EngineError, FaceOutcome, FaceStatus, ScanSnapshot, ScannerController, ScannerError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use zbus::{fdo, interface};

const FRAME_JPEG_QUALITY: u8 = 80;
const BOX_THICKNESS: u32 = 2;

/// D-Bus interface for the attendance daemon.
///
/// Bus name: io.rollcall.Attendance1
/// Object path: /io/rollcall/Attendance1
pub struct AttendanceService {
    controller: Arc<ScannerController>,
    default_camera: String,
}

impl AttendanceService {
    pub fn new(controller: Arc<ScannerController>, default_camera: String) -> Self {
        Self {
            controller,
            default_camera,
        }
    }

    /// Session key for `requested`: its device path.
    fn camera_id(&self, requested: &str) -> fdo::Result<String> {
        capture::canonical_camera_id(requested, &self.default_camera).ok_or_else(|| {
            fdo::Error::InvalidArgs(format!(
                "unrecognized camera id {requested:?} (expected /dev/videoN, N or camera_N)"
            ))
        })
    }
}

#[interface(name = "io.rollcall.Attendance1")]
impl AttendanceService {
    /// Enroll (or re-enroll) an identity from one encoded image.
    async fn enroll(&self, identity_id: &str, name: &str, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(identity_id, bytes = image.len(), "enroll requested");
        let controller = Arc::clone(&self.controller);
        let (identity_id, name) = (identity_id.to_string(), name.to_string());
        let receipt = blocking(move || {
            controller
                .engine()
                .enroll_encoded(&identity_id, &name, &image)
                .map_err(engine_err)
        })
        .await?;
        Ok(json!({
            "ok": true,
            "identity_id": receipt.identity_id,
            "replaced": receipt.replaced(),
            "quality_score": receipt.quality_score,
        })
        .to_string())
    }

    async fn start_scanner(&self, camera_id: &str) -> fdo::Result<String> {
        let camera_id = self.camera_id(camera_id)?;
        tracing::info!(camera_id = %camera_id, "scanner start requested");
        let controller = Arc::clone(&self.controller);
        let outcome = blocking(move || controller.start(&camera_id).map_err(scanner_err)).await?;
        Ok(json!({
            "ok": true,
            "already_running": outcome.already_running,
            "session_id": outcome.session_id,
        })
        .to_string())
    }

    async fn stop_scanner(&self, camera_id: &str) -> fdo::Result<String> {
        let camera_id = self.camera_id(camera_id)?;
        tracing::info!(camera_id = %camera_id, "scanner stop requested");
        let controller = Arc::clone(&self.controller);
        blocking(move || controller.stop(&camera_id).map_err(scanner_err)).await?;
        Ok(json!({ "ok": true }).to_string())
    }

    /// Latest frame as JPEG, faces outlined by status, plus its detections.
    /// Empty JPEG before the first published cycle.
    #[zbus(out_args("jpeg", "detection"))]
    async fn scanner_frame(&self, camera_id: &str) -> fdo::Result<(Vec<u8>, String)> {
        let camera_id = self.camera_id(camera_id)?;
        let Some(snapshot) = self.controller.snapshot(&camera_id) else {
            return Ok((Vec::new(), snapshot_json(&ScanSnapshot::default()).to_string()));
        };
        blocking(move || {
            let jpeg = match &snapshot.frame {
                Some(frame) => {
                    let annotated = annotate(frame, &snapshot.faces);
                    rollcall_hw::frame::encode_jpeg(&annotated, FRAME_JPEG_QUALITY)
                        .map_err(|e| fdo::Error::Failed(e.to_string()))?
                }
                None => Vec::new(),
            };
            Ok((jpeg, snapshot_json(&snapshot).to_string()))
        })
        .await
    }

    async fn scanner_status(&self, camera_id: &str) -> fdo::Result<String> {
        let camera_id = self.camera_id(camera_id)?;
        let status = self.controller.status(&camera_id).map_err(scanner_err)?;
        Ok(json!({
            "camera_id": status.camera_id,
            "state": status.state,
            "session_id": status.session_id,
            "started_at": status.started_at,
            "last_error": status.last_error,
            "latest_detection": snapshot_json(&status.latest),
            "enrolled_count": self.controller.engine().gallery().len(),
        })
        .to_string())
    }

    /// Attendance for `date` (YYYY-MM-DD); empty means today.
    async fn attendance_summary(&self, date: &str) -> fdo::Result<String> {
        let date = parse_date(date)?;
        let controller = Arc::clone(&self.controller);
        let summary = blocking(move || {
            let engine = controller.engine();
            match date {
                Some(date) => engine.summary(date),
                None => engine.today(),
            }
            .map_err(engine_err)
        })
        .await?;
        serde_json::to_string(&summary).map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    async fn list_identities(&self) -> fdo::Result<String> {
        serde_json::to_string(&self.controller.engine().identities())
            .map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Remove an identity. Unknown ids succeed with `removed: false`.
    async fn remove_identity(&self, identity_id: &str) -> fdo::Result<String> {
        tracing::info!(identity_id, "remove requested");
        let controller = Arc::clone(&self.controller);
        let identity_id = identity_id.to_string();
        let removed = blocking(move || {
            controller
                .engine()
                .remove_identity(&identity_id)
                .map_err(engine_err)
        })
        .await?;
        Ok(json!({ "ok": true, "removed": removed }).to_string())
    }

    async fn health(&self) -> fdo::Result<String> {
        Ok(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "active_scanners": self.controller.active_count(),
            "enrolled_count": self.controller.engine().gallery().len(),
        })
        .to_string())
    }
}

async fn blocking<T, F>(f: F) -> fdo::Result<T>
where
    F: FnOnce() -> fdo::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| fdo::Error::Failed(format!("worker task failed: {e}")))?
}

fn engine_err(e: EngineError) -> fdo::Error {
    if e.is_caller_error() {
        fdo::Error::InvalidArgs(e.to_string())
    } else {
        tracing::warn!(error = %e, "request failed");
        fdo::Error::Failed(e.to_string())
    }
}

fn scanner_err(e: ScannerError) -> fdo::Error {
    match e {
        ScannerError::InvalidCamera(_) => fdo::Error::InvalidArgs(e.to_string()),
        other => {
            tracing::warn!(error = %other, "scanner request failed");
            fdo::Error::Failed(other.to_string())
        }
    }
}

fn parse_date(raw: &str) -> fdo::Result<Option<NaiveDate>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| fdo::Error::InvalidArgs(format!("invalid date {raw:?}, expected YYYY-MM-DD")))
}

fn status_color(status: FaceStatus) -> Rgb<u8> {
    match status {
        FaceStatus::Marked => Rgb([0, 255, 0]),
        FaceStatus::AlreadyPresent => Rgb([255, 210, 0]),
        FaceStatus::Unknown | FaceStatus::Ambiguous | FaceStatus::Error => Rgb([255, 0, 0]),
    }
}

/// Copy of `frame` with each face's box drawn in its status color.
fn annotate(frame: &RgbImage, faces: &[FaceOutcome]) -> RgbImage {
    let mut out = frame.clone();
    for face in faces {
        let b = &face.detection.bounding_box;
        rollcall_hw::frame::draw_box(
            &mut out,
            (b.x, b.y, b.width, b.height),
            BOX_THICKNESS,
            status_color(face.status()),
        );
    }
    out
}

/// Detection JSON for one published cycle.
fn snapshot_json(snapshot: &ScanSnapshot) -> Value {
    let faces: Vec<Value> = snapshot
        .faces
        .iter()
        .map(|face| {
            json!({
                "status": face.status(),
                "bounding_box": face.detection.bounding_box,
                "quality_score": face.detection.quality_score,
                "result": face.result,
                "mark": face.mark,
                "error": face.error,
            })
        })
        .collect();
    json!({
        "session_id": snapshot.session_id,
        "sequence": snapshot.sequence,
        "captured_at": snapshot.captured_at,
        "face_count": faces.len(),
        "faces": faces,
        "primary": snapshot.primary_result(),
        "error": snapshot.error,
    })
}
