//! Attendance engine: enrollment and per-frame identification.
//!
//! The engine owns the shared face models, the gallery, the matcher and
//! the ledger. It is synchronous; callers on an async runtime run it on a
//! blocking thread.

use crate::error::EngineError;
use crate::gallery::{EmbeddingStore, EnrollOutcome, IdentitySummary};
use crate::ledger::{AttendanceLedger, AttendanceSummary, MarkOutcome};
use crate::matcher::Matcher;
use crate::pipeline::FaceAnalyzer;
use crate::types::{Decision, Detection, MatchResult};
use chrono::{DateTime, NaiveDate, Utc};
use image::RgbImage;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Result of a successful enrollment.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollReceipt {
    pub identity_id: String,
    pub outcome: EnrollOutcome,
    pub quality_score: f32,
}

impl EnrollReceipt {
    pub fn replaced(&self) -> bool {
        self.outcome == EnrollOutcome::Replaced
    }
}

/// Per-face status shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceStatus {
    Marked,
    AlreadyPresent,
    Unknown,
    Ambiguous,
    Error,
}

/// What happened to one detected face in a scanned frame.
#[derive(Debug, Clone, Serialize)]
pub struct FaceOutcome {
    pub detection: Detection,
    /// `None` when the face could not be embedded or matched.
    pub result: Option<MatchResult>,
    /// Set only for accepted matches that reached the ledger.
    pub mark: Option<MarkOutcome>,
    pub error: Option<String>,
}

impl FaceOutcome {
    pub fn status(&self) -> FaceStatus {
        if self.error.is_some() {
            return FaceStatus::Error;
        }
        match (&self.result, self.mark) {
            (_, Some(MarkOutcome::Marked)) => FaceStatus::Marked,
            (_, Some(MarkOutcome::AlreadyPresent)) => FaceStatus::AlreadyPresent,
            (Some(r), None) if r.decision == Decision::Ambiguous => FaceStatus::Ambiguous,
            (Some(_), None) => FaceStatus::Unknown,
            (None, None) => FaceStatus::Error,
        }
    }

    fn failed(detection: Detection, result: Option<MatchResult>, error: impl ToString) -> Self {
        Self {
            detection,
            result,
            mark: None,
            error: Some(error.to_string()),
        }
    }
}

pub struct AttendanceEngine {
    analyzer: Mutex<FaceAnalyzer>,
    gallery: Arc<EmbeddingStore>,
    matcher: Box<dyn Matcher>,
    ledger: AttendanceLedger,
}

impl AttendanceEngine {
    pub fn new(
        analyzer: FaceAnalyzer,
        gallery: Arc<EmbeddingStore>,
        matcher: Box<dyn Matcher>,
        ledger: AttendanceLedger,
    ) -> Result<Self, EngineError> {
        if analyzer.embedding_dimension() != gallery.dimension() {
            return Err(EngineError::InvalidInput(format!(
                "embedder produces {}-dim embeddings, gallery expects {}",
                analyzer.embedding_dimension(),
                gallery.dimension()
            )));
        }
        Ok(Self {
            analyzer: Mutex::new(analyzer),
            gallery,
            matcher,
            ledger,
        })
    }

    pub fn gallery(&self) -> &EmbeddingStore {
        &self.gallery
    }

    pub fn ledger(&self) -> &AttendanceLedger {
        &self.ledger
    }

    /// Enroll from an encoded image (JPEG, PNG, ...).
    pub fn enroll_encoded(
        &self,
        identity_id: &str,
        name: &str,
        bytes: &[u8],
    ) -> Result<EnrollReceipt, EngineError> {
        check_identity(identity_id, name)?;
        if bytes.is_empty() {
            return Err(EngineError::InvalidInput("image is empty".into()));
        }
        let image = image::load_from_memory(bytes)
            .map_err(|e| EngineError::InvalidInput(format!("cannot decode image: {e}")))?
            .to_rgb8();
        self.enroll(identity_id, name, &image)
    }

    /// Enroll or re-enroll `identity_id` from an image holding exactly one face.
    ///
    /// Nothing is written unless detection and embedding both succeed.
    pub fn enroll(
        &self,
        identity_id: &str,
        name: &str,
        image: &RgbImage,
    ) -> Result<EnrollReceipt, EngineError> {
        check_identity(identity_id, name)?;

        let (face, embedding) = self.analyzer().enrollment_embedding(image)?;
        let outcome = self.gallery.enroll(identity_id, name, embedding)?;

        Ok(EnrollReceipt {
            identity_id: identity_id.trim().to_string(),
            outcome,
            quality_score: face.quality_score,
        })
    }

    pub fn remove_identity(&self, identity_id: &str) -> Result<bool, EngineError> {
        Ok(self.gallery.remove(identity_id)?)
    }

    pub fn identities(&self) -> Vec<IdentitySummary> {
        self.gallery.identities()
    }

    pub fn summary(&self, date: NaiveDate) -> Result<AttendanceSummary, EngineError> {
        Ok(self.ledger.summary(date)?)
    }

    pub fn today(&self) -> Result<AttendanceSummary, EngineError> {
        Ok(self.ledger.today()?)
    }

    /// Detect, identify, and mark every face in one frame.
    ///
    /// A detector failure fails the whole frame. Failures after detection
    /// are confined to the face they happened on.
    pub fn process_frame(
        &self,
        camera_id: &str,
        frame: &RgbImage,
        at: DateTime<Utc>,
    ) -> Result<Vec<FaceOutcome>, EngineError> {
        // Models are held only for detection and embedding.
        let embedded: Vec<_> = {
            let mut analyzer = self.analyzer();
            let faces = analyzer.detect_faces(frame)?;
            faces
                .into_iter()
                .map(|d| {
                    let embedding = analyzer.embed(frame, &d);
                    (d, embedding)
                })
                .collect()
        };
        if embedded.is_empty() {
            return Ok(Vec::new());
        }

        let gallery = self.gallery.all();
        let mut outcomes = Vec::with_capacity(embedded.len());
        for (detection, embedding) in embedded {
            let embedding = match embedding {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!(camera_id, error = %e, "face skipped: embedding failed");
                    outcomes.push(FaceOutcome::failed(detection, None, e));
                    continue;
                }
            };

            let result = match self.matcher.identify(&embedding, &gallery) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(camera_id, error = %e, "face skipped: match failed");
                    outcomes.push(FaceOutcome::failed(detection, None, e));
                    continue;
                }
            };

            let accepted = match (&result.identity_id, &result.display_name) {
                (Some(id), Some(name)) if result.is_accepted() => Some((id.clone(), name.clone())),
                _ => None,
            };
            let Some((identity_id, display_name)) = accepted else {
                outcomes.push(FaceOutcome {
                    detection,
                    result: Some(result),
                    mark: None,
                    error: None,
                });
                continue;
            };

            match self.ledger.record_if_new(
                &identity_id,
                &display_name,
                camera_id,
                result.similarity,
                at,
            ) {
                Ok(mark) => outcomes.push(FaceOutcome {
                    detection,
                    result: Some(result),
                    mark: Some(mark),
                    error: None,
                }),
                Err(e) => {
                    tracing::warn!(camera_id, identity_id = %identity_id, error = %e, "attendance write failed");
                    outcomes.push(FaceOutcome::failed(detection, Some(result), e));
                }
            }
        }

        Ok(outcomes)
    }

    fn analyzer(&self) -> MutexGuard<'_, FaceAnalyzer> {
        self.analyzer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_identity(identity_id: &str, name: &str) -> Result<(), EngineError> {
    if identity_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("identity_id is required".into()));
    }
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput("name is required".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{engine_with, face, FakeEmbedder};
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn frame() -> RgbImage {
        RgbImage::new(64, 48)
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_enroll_then_reenroll_keeps_one_entry() {
        let engine = engine_with(
            vec![face(10, 0.95)],
            FakeEmbedder::new(2).with(10, &[1.0, 0.0]),
            &[],
        );
        let first = engine.enroll("u1", "Ada", &frame()).unwrap();
        assert!(!first.replaced());
        let second = engine.enroll(" u1 ", "Ada", &frame()).unwrap();
        assert!(second.replaced());
        assert_eq!(second.identity_id, "u1");
        assert_eq!(engine.gallery().len(), 1);
    }

    #[test]
    fn test_enroll_failures_write_nothing() {
        let none = engine_with(vec![], FakeEmbedder::new(2), &[]);
        assert!(matches!(none.enroll("u1", "Ada", &frame()), Err(EngineError::NoFaceFound)));
        assert!(none.gallery().is_empty());

        let two = engine_with(
            vec![face(10, 0.95), face(40, 0.9)],
            FakeEmbedder::new(2).with(10, &[1.0, 0.0]).with(40, &[0.0, 1.0]),
            &[],
        );
        assert!(matches!(
            two.enroll("u1", "Ada", &frame()),
            Err(EngineError::MultipleFacesFound(2))
        ));
        assert!(two.gallery().is_empty());

        let unaligned = engine_with(vec![face(10, 0.95)], FakeEmbedder::new(2), &[]);
        assert!(matches!(
            unaligned.enroll("u1", "Ada", &frame()),
            Err(EngineError::EmbeddingFailed(_))
        ));
        assert!(unaligned.gallery().is_empty());
    }

    #[test]
    fn test_enroll_requires_identity_and_name() {
        let engine = engine_with(vec![face(10, 0.95)], FakeEmbedder::new(2).with(10, &[1.0, 0.0]), &[]);
        assert!(matches!(engine.enroll("", "Ada", &frame()), Err(EngineError::InvalidInput(_))));
        assert!(matches!(engine.enroll("u1", "  ", &frame()), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn test_enroll_encoded_decodes_png_and_rejects_garbage() {
        let engine = engine_with(vec![face(10, 0.95)], FakeEmbedder::new(2).with(10, &[1.0, 0.0]), &[]);

        let mut png = Vec::new();
        RgbImage::from_pixel(32, 32, Rgb([200, 100, 50]))
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();
        assert!(engine.enroll_encoded("u1", "Ada", &png).is_ok());

        let err = engine.enroll_encoded("u2", "Bob", b"not an image").unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert!(err.is_caller_error());
        assert!(matches!(
            engine.enroll_encoded("u2", "Bob", &[]),
            Err(EngineError::InvalidInput(_))
        ));
        assert_eq!(engine.gallery().len(), 1);
    }

    #[test]
    fn test_process_frame_marks_once_per_window() {
        let engine = engine_with(
            vec![face(10, 0.95)],
            FakeEmbedder::new(2).with(10, &[1.0, 0.0]),
            &[("ada", &[1.0, 0.0])],
        );

        let first = engine.process_frame("cam0", &frame(), at("2026-03-02T09:00:00Z")).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].status(), FaceStatus::Marked);

        let second = engine.process_frame("cam0", &frame(), at("2026-03-02T09:05:00Z")).unwrap();
        assert_eq!(second[0].status(), FaceStatus::AlreadyPresent);

        let summary = engine.summary("2026-03-02".parse().unwrap()).unwrap();
        assert_eq!(summary.total_present, 1);
        assert_eq!(summary.records.len(), 1);
        assert_eq!(summary.records[0].camera_id, "cam0");
        assert_eq!(summary.records[0].display_name, "name-ada");
    }

    #[test]
    fn test_process_frame_unknown_and_ambiguous_do_not_mark() {
        let unknown = engine_with(
            vec![face(10, 0.95)],
            FakeEmbedder::new(2).with(10, &[0.0, 1.0]),
            &[("ada", &[1.0, 0.0])],
        );
        let out = unknown.process_frame("cam0", &frame(), Utc::now()).unwrap();
        assert_eq!(out[0].status(), FaceStatus::Unknown);
        assert_eq!(out[0].mark, None);

        let ambiguous = engine_with(
            vec![face(10, 0.95)],
            FakeEmbedder::new(2).with(10, &[1.0, 0.0]),
            &[("a", &[1.0, 0.0]), ("b", &[0.9, 0.435_89])],
        );
        let out = ambiguous.process_frame("cam0", &frame(), Utc::now()).unwrap();
        assert_eq!(out[0].status(), FaceStatus::Ambiguous);
        assert_eq!(ambiguous.today().unwrap().total_present, 0);
    }

    #[test]
    fn test_process_frame_isolates_face_failures() {
        // Face at x=40 has no embedding: alignment fails for it alone.
        let engine = engine_with(
            vec![face(10, 0.95), face(40, 0.9)],
            FakeEmbedder::new(2).with(10, &[1.0, 0.0]),
            &[("ada", &[1.0, 0.0])],
        );
        let out = engine.process_frame("cam0", &frame(), Utc::now()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].status(), FaceStatus::Marked);
        assert_eq!(out[1].status(), FaceStatus::Error);
        assert!(out[1].error.is_some());
    }

    #[test]
    fn test_process_frame_without_faces() {
        let engine = engine_with(vec![face(10, 0.3)], FakeEmbedder::new(2), &[]);
        assert!(engine.process_frame("cam0", &frame(), Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_mismatch_rejected_at_construction() {
        use crate::gallery::EmbeddingStore;
        use crate::matcher::CosineMatcher;
        use crate::pipeline::{AnalyzerConfig, FaceAnalyzer};
        use crate::testing::FakeDetector;

        let analyzer = FaceAnalyzer::new(
            Box::new(FakeDetector::new(vec![])),
            Box::new(FakeEmbedder::new(3)),
            AnalyzerConfig::default(),
        );
        let result = AttendanceEngine::new(
            analyzer,
            Arc::new(EmbeddingStore::new(2)),
            Box::new(CosineMatcher::default()),
            AttendanceLedger::in_memory(),
        );
        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
    }
}
