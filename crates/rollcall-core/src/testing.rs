//! Scripted detector, embedder and camera doubles for unit tests.

use crate::alignment::{AlignmentError, REFERENCE_LANDMARKS_112};
use crate::detector::{Detector, DetectorError};
use crate::engine::AttendanceEngine;
use crate::gallery::EmbeddingStore;
use crate::ledger::{AttendanceLedger, AttendanceWindow, MemoryLedger};
use crate::matcher::CosineMatcher;
use crate::pipeline::{AnalyzerConfig, FaceAnalyzer};
use crate::recognizer::{Embedder, RecognizerError};
use crate::scanner::{CameraProvider, CaptureError, FrameSource};
use crate::types::{BoundingBox, Detection, Embedding};
use chrono::FixedOffset;
use image::RgbImage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A face whose left edge `x` doubles as its key in [`FakeEmbedder`].
pub fn face(x: u32, quality: f32) -> Detection {
    Detection {
        bounding_box: BoundingBox {
            x: x as f32,
            y: 0.0,
            width: 20.0,
            height: 20.0,
        },
        landmarks: Some(REFERENCE_LANDMARKS_112),
        quality_score: quality,
    }
}

/// Returns the same detections for every frame, or an inference error
/// while its failure switch is on.
pub struct FakeDetector {
    faces: Vec<Detection>,
    failing: Arc<AtomicBool>,
}

impl FakeDetector {
    pub fn new(faces: Vec<Detection>) -> Self {
        Self {
            faces,
            failing: Arc::default(),
        }
    }

    pub fn with_failure_switch(mut self, failing: Arc<AtomicBool>) -> Self {
        self.failing = failing;
        self
    }
}

impl Detector for FakeDetector {
    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DetectorError::InferenceFailed("output tensor missing".into()));
        }
        Ok(self.faces.clone())
    }
}

/// Embeds faces by bounding-box x; unknown faces fail alignment.
pub struct FakeEmbedder {
    dimension: usize,
    by_x: HashMap<u32, Vec<f32>>,
}

impl FakeEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            by_x: HashMap::new(),
        }
    }

    pub fn with(mut self, x: u32, values: &[f32]) -> Self {
        self.by_x.insert(x, values.to_vec());
        self
    }
}

impl Embedder for FakeEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&mut self, _image: &RgbImage, face: &Detection) -> Result<Embedding, RecognizerError> {
        self.by_x
            .get(&(face.bounding_box.x as u32))
            .map(|v| Embedding::new(v.clone()))
            .ok_or(RecognizerError::Alignment(AlignmentError::ExtremePose(20.0)))
    }
}

/// Engine over 2-dim fakes, UTC daily windows and an in-memory ledger.
/// `enrolled` entries are stored as `(id, "name-<id>", embedding)`.
pub fn engine_with(
    faces: Vec<Detection>,
    embedder: FakeEmbedder,
    enrolled: &[(&str, &[f32])],
) -> Arc<AttendanceEngine> {
    engine_with_detector(FakeDetector::new(faces), embedder, enrolled)
}

pub fn engine_with_detector(
    detector: FakeDetector,
    embedder: FakeEmbedder,
    enrolled: &[(&str, &[f32])],
) -> Arc<AttendanceEngine> {
    let gallery = Arc::new(EmbeddingStore::new(embedder.dimension()));
    for (id, values) in enrolled {
        gallery
            .enroll(id, &format!("name-{id}"), Embedding::new(values.to_vec()))
            .unwrap();
    }
    let analyzer = FaceAnalyzer::new(
        Box::new(detector),
        Box::new(embedder),
        AnalyzerConfig::default(),
    );
    let utc = FixedOffset::east_opt(0).unwrap();
    let ledger = AttendanceLedger::new(Arc::new(MemoryLedger::new()), AttendanceWindow::daily(utc));
    Arc::new(
        AttendanceEngine::new(analyzer, gallery, Box::new(CosineMatcher::default()), ledger).unwrap(),
    )
}

#[derive(Default)]
pub struct CameraLog {
    pub opens: AtomicUsize,
    pub releases: AtomicUsize,
}

/// Camera provider that counts opens and releases.
#[derive(Default)]
pub struct FakeCameras {
    pub log: Arc<CameraLog>,
    pub fail_open: AtomicBool,
    pub fail_capture: Arc<AtomicBool>,
    open_delay: Duration,
}

impl FakeCameras {
    pub fn with_open_delay(open_delay: Duration) -> Self {
        Self {
            open_delay,
            ..Self::default()
        }
    }
}

impl CameraProvider for FakeCameras {
    fn open(&self, camera_id: &str) -> Result<Box<dyn FrameSource>, CaptureError> {
        std::thread::sleep(self.open_delay);
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(CaptureError(format!("{camera_id}: device busy")));
        }
        self.log.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSource {
            log: Arc::clone(&self.log),
            fail_capture: Arc::clone(&self.fail_capture),
        }))
    }
}

struct FakeSource {
    log: Arc<CameraLog>,
    fail_capture: Arc<AtomicBool>,
}

impl FrameSource for FakeSource {
    fn capture(&mut self) -> Result<RgbImage, CaptureError> {
        if self.fail_capture.load(Ordering::SeqCst) {
            return Err(CaptureError("VIDIOC_DQBUF: no such device".into()));
        }
        Ok(RgbImage::new(64, 48))
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.log.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
