//! rollcall-core: face-recognition attendance engine.
//!
//! SCRFD detection and ArcFace embeddings (ONNX Runtime, CPU), cosine
//! matching with an ambiguity margin, a once-per-window attendance ledger,
//! and per-camera scanner sessions.

pub mod alignment;
pub mod detector;
pub mod engine;
pub mod error;
pub mod gallery;
pub mod ledger;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod scanner;
pub mod types;

#[cfg(test)]
mod testing;

pub use detector::{Detector, ScrfdDetector};
pub use engine::{AttendanceEngine, EnrollReceipt, FaceOutcome, FaceStatus};
pub use error::EngineError;
pub use gallery::{EmbeddingStore, EnrollOutcome, IdentityRepository, IdentitySummary};
pub use ledger::{
    AttendanceLedger, AttendanceRecord, AttendanceSummary, AttendanceWindow, LedgerBackend,
    MarkOutcome, MemoryLedger,
};
pub use matcher::{CosineMatcher, MatchPolicy, Matcher};
pub use pipeline::{AnalyzerConfig, FaceAnalyzer};
pub use recognizer::{ArcFaceEmbedder, Embedder};
pub use scanner::{
    CameraProvider, CaptureError, FrameSource, ScanSnapshot, ScannerConfig, ScannerController,
    ScannerError, ScannerSession, ScannerState, ScannerStatus, StartOutcome,
};
pub use types::{BoundingBox, Decision, Detection, Embedding, EnrolledIdentity, Landmarks, MatchResult};
