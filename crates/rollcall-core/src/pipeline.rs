//! Detector + embedder pairing with the quality and per-frame policies
//! shared by enrollment and scanning.

use crate::detector::{sort_by_quality, Detector, ScrfdDetector};
use crate::error::EngineError;
use crate::recognizer::{ArcFaceEmbedder, Embedder};
use crate::types::{Detection, Embedding};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Detections scoring below this are ignored.
    pub quality_floor: f32,
    /// Faces processed per scanned frame; the highest-quality ones win.
    pub max_faces_per_frame: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            quality_floor: 0.85,
            max_faces_per_frame: 5,
        }
    }
}

pub struct FaceAnalyzer {
    detector: Box<dyn Detector>,
    embedder: Box<dyn Embedder>,
    config: AnalyzerConfig,
}

impl FaceAnalyzer {
    pub fn new(
        detector: Box<dyn Detector>,
        embedder: Box<dyn Embedder>,
        config: AnalyzerConfig,
    ) -> Self {
        Self {
            detector,
            embedder,
            config,
        }
    }

    /// Load SCRFD and ArcFace from `model_dir`.
    pub fn load(model_dir: &Path, config: AnalyzerConfig) -> Result<Self, EngineError> {
        let scrfd = model_dir.join(SCRFD_MODEL_FILE);
        let arcface = model_dir.join(ARCFACE_MODEL_FILE);

        let detector = ScrfdDetector::load(&scrfd.to_string_lossy())?;
        let embedder = ArcFaceEmbedder::load(&arcface.to_string_lossy())?;

        Ok(Self::new(Box::new(detector), Box::new(embedder), config))
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn embedding_dimension(&self) -> usize {
        self.embedder.dimension()
    }

    /// Faces above the quality floor, best first, capped at `max_faces_per_frame`.
    pub fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<Detection>, EngineError> {
        let mut faces = self.faces_above_floor(image)?;
        if faces.len() > self.config.max_faces_per_frame {
            tracing::debug!(
                found = faces.len(),
                cap = self.config.max_faces_per_frame,
                "dropping lowest-quality faces over the per-frame cap"
            );
            faces.truncate(self.config.max_faces_per_frame);
        }
        Ok(faces)
    }

    pub fn embed(&mut self, image: &RgbImage, face: &Detection) -> Result<Embedding, EngineError> {
        Ok(self.embedder.embed(image, face)?)
    }

    /// The single face of an enrollment image and its embedding.
    pub fn enrollment_embedding(
        &mut self,
        image: &RgbImage,
    ) -> Result<(Detection, Embedding), EngineError> {
        let mut faces = self.faces_above_floor(image)?;
        match faces.len() {
            0 => return Err(EngineError::NoFaceFound),
            1 => {}
            n => return Err(EngineError::MultipleFacesFound(n)),
        }
        let Some(face) = faces.pop() else {
            return Err(EngineError::NoFaceFound);
        };

        let embedding = self.embed(image, &face)?;
        tracing::debug!(quality = face.quality_score, "enrollment face embedded");
        Ok((face, embedding))
    }

    fn faces_above_floor(&mut self, image: &RgbImage) -> Result<Vec<Detection>, EngineError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(EngineError::InvalidInput("image has no pixels".into()));
        }
        let floor = self.config.quality_floor;
        let mut faces: Vec<Detection> = self
            .detector
            .detect(image)?
            .into_iter()
            .filter(|d| d.quality_score >= floor)
            .collect();
        sort_by_quality(&mut faces);
        Ok(faces)
    }
}
