//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional face embeddings from aligned face crops,
//! using the w600k_r50 ArcFace model.

use crate::alignment::{self, AlignmentError, ALIGNED_SIZE};
use crate::types::{Detection, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// Different from SCRFD: ArcFace uses symmetric normalization.
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("alignment failed: {0}")]
    Alignment(#[from] AlignmentError),
    #[error("embedding is degenerate (zero or non-finite)")]
    Degenerate,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces an identity embedding for one detected face.
pub trait Embedder: Send {
    /// Length of every embedding this embedder returns.
    fn dimension(&self) -> usize;

    fn embed(&mut self, image: &RgbImage, face: &Detection) -> Result<Embedding, RecognizerError>;
}

/// ArcFace-based face recognizer.
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Convert a 112x112 aligned RGB crop into a NCHW float tensor.
    fn preprocess(aligned: &RgbImage) -> Array4<f32> {
        let size = ALIGNED_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in aligned.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }
        tensor
    }
}

impl Embedder for ArcFaceEmbedder {
    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }

    /// The face must carry landmarks; it is aligned to the canonical
    /// 112x112 template before inference.
    fn embed(&mut self, image: &RgbImage, face: &Detection) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(AlignmentError::NoLandmarks)?;
        let aligned = alignment::align_face(image, landmarks)?;
        let input = Self::preprocess(&aligned);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        finish_embedding(raw.to_vec())
    }
}

/// Validate the raw model output and L2-normalize it.
fn finish_embedding(raw: Vec<f32>) -> Result<Embedding, RecognizerError> {
    if raw.len() != ARCFACE_EMBEDDING_DIM {
        return Err(RecognizerError::InferenceFailed(format!(
            "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
            raw.len()
        )));
    }

    let embedding = Embedding {
        values: raw,
        model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
    };
    if !embedding.is_usable() {
        return Err(RecognizerError::Degenerate);
    }
    Ok(embedding.normalized())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([128, 128, 128]));
        let tensor = ArcFaceEmbedder::preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_keeps_channel_order() {
        let aligned = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([255, 128, 0]));
        let tensor = ArcFaceEmbedder::preprocess(&aligned);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] - (128.0 - 127.5) / 127.5).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 5]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_finish_embedding_normalizes() {
        let mut raw = vec![0.0f32; ARCFACE_EMBEDDING_DIM];
        raw[0] = 3.0;
        raw[1] = 4.0;
        let emb = finish_embedding(raw).unwrap();
        assert!((emb.values[0] - 0.6).abs() < 1e-6);
        assert!((emb.values[1] - 0.8).abs() < 1e-6);
        assert_eq!(emb.model_version.as_deref(), Some("w600k_r50"));
    }

    #[test]
    fn test_finish_embedding_rejects_wrong_length() {
        assert!(matches!(
            finish_embedding(vec![1.0; 128]),
            Err(RecognizerError::InferenceFailed(_))
        ));
    }

    #[test]
    fn test_finish_embedding_rejects_zero_and_nan() {
        assert!(matches!(
            finish_embedding(vec![0.0; ARCFACE_EMBEDDING_DIM]),
            Err(RecognizerError::Degenerate)
        ));
        let mut raw = vec![0.1; ARCFACE_EMBEDDING_DIM];
        raw[7] = f32::NAN;
        assert!(matches!(finish_embedding(raw), Err(RecognizerError::Degenerate)));
    }
}
