use crate::detector::DetectorError;
use crate::gallery::GalleryError;
use crate::ledger::LedgerError;
use crate::matcher::MatchError;
use crate::recognizer::RecognizerError;
use thiserror::Error;

/// Errors surfaced by enrollment and frame processing.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("no face found above the quality floor")]
    NoFaceFound,
    #[error("multiple faces found ({0}); enrollment needs exactly one")]
    MultipleFacesFound(usize),
    #[error("embedding failed: {0}")]
    EmbeddingFailed(#[from] RecognizerError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
}

impl EngineError {
    /// True when the caller sent something unusable; retrying cannot help.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidInput(_)
                | EngineError::NoFaceFound
                | EngineError::MultipleFacesFound(_)
        )
    }
}

impl From<GalleryError> for EngineError {
    fn from(err: GalleryError) -> Self {
        match err {
            GalleryError::Repository(msg) => EngineError::Storage(msg),
            other => EngineError::InvalidInput(other.to_string()),
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<MatchError> for EngineError {
    fn from(err: MatchError) -> Self {
        EngineError::InvalidInput(err.to_string())
    }
}
