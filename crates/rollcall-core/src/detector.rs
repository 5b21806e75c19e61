//! Face detection: the [`Detector`] seam and the SCRFD implementation.
//!
//! SCRFD runs through ONNX Runtime with 3-stride anchor decoding and NMS
//! post-processing on a 640×640 letterboxed RGB input.

use crate::types::{BoundingBox, Detection, Landmarks};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty frame")]
    EmptyFrame,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates faces in a frame.
///
/// Implementations return detections ordered by descending `quality_score`.
pub trait Detector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError>;
}

/// Mapping from letterboxed model space back to frame space.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((target as f32 - new_w) / 2.0).floor(),
            pad_y: ((target as f32 - new_h) / 2.0).floor(),
        }
    }

    fn to_frame(&self, (x, y): (f32, f32)) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    /// Per-stride output indices for strides [8, 16, 32], discovered at load.
    stride_outputs: [StrideOutputs; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(path = model_path, outputs = ?output_names, "loaded SCRFD model");

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_outputs = discover_outputs(&output_names);
        tracing::debug!(?stride_outputs, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_outputs,
        })
    }

    /// Letterbox `image` into a normalized 1×3×640×640 RGB tensor.
    fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
        let size = SCRFD_INPUT_SIZE;
        let letterbox = Letterbox::fit(image.width(), image.height(), size);
        let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).clamp(1, size);
        let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).clamp(1, size);
        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

        // Padding stays at 0.0, i.e. SCRFD_MEAN after normalization.
        let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
        let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = (ox + x as usize, oy + y as usize);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, letterbox)
    }
}

impl Detector for ScrfdDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectorError::EmptyFrame);
        }

        let (input, letterbox) = Self::preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };

            candidates.extend(decode_stride(
                StrideTensors {
                    scores: extract(score_idx, "scores")?,
                    bboxes: extract(bbox_idx, "bboxes")?,
                    kps: extract(kps_idx, "kps")?,
                },
                stride,
                &letterbox,
                SCRFD_SCORE_THRESHOLD,
            ));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Map SCRFD outputs to stride slots by name (`score_8`, `bbox_16`, ...),
/// falling back to positional order [scores 8/16/32, bboxes, kps].
fn discover_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };
    let lookup = |stride: usize| -> Option<StrideOutputs> {
        Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?))
    };

    match (lookup(8), lookup(16), lookup(32)) {
        (Some(s8), Some(s16), Some(s32)) => [s8, s16, s32],
        _ => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

struct StrideTensors<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// Decode the anchors of one stride level into frame-space detections.
fn decode_stride(
    tensors: StrideTensors<'_>,
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<Detection> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = tensors.scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let Some(b) = tensors.bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor = ((cell % grid) as f32 * s, (cell / grid) as f32 * s);

        let (x1, y1) = letterbox.to_frame((anchor.0 - b[0] * s, anchor.1 - b[1] * s));
        let (x2, y2) = letterbox.to_frame((anchor.0 + b[2] * s, anchor.1 + b[3] * s));

        let landmarks = tensors.kps.get(idx * 10..idx * 10 + 10).map(|k| {
            let mut lms: Landmarks = [(0.0, 0.0); 5];
            for (i, lm) in lms.iter_mut().enumerate() {
                *lm = letterbox.to_frame((anchor.0 + k[i * 2] * s, anchor.1 + k[i * 2 + 1] * s));
            }
            lms
        });

        detections.push(Detection {
            bounding_box: BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
            },
            landmarks,
            quality_score: score,
        });
    }

    detections
}

/// Sort by descending quality.
pub(crate) fn sort_by_quality(detections: &mut [Detection]) {
    detections.sort_by(|a, b| b.quality_score.total_cmp(&a.quality_score));
}

/// Non-Maximum Suppression; the result is ordered by descending quality.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    sort_by_quality(&mut detections);

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep
            .iter()
            .all(|kept| kept.bounding_box.iou(&det.bounding_box) <= iou_threshold)
        {
            keep.push(det);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn det(x: f32, y: f32, w: f32, h: f32, q: f32) -> Detection {
        Detection {
            bounding_box: BoundingBox { x, y, width: w, height: h },
            landmarks: None,
            quality_score: q,
        }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let result = nms(
            vec![
                det(5.0, 5.0, 100.0, 100.0, 0.8),
                det(0.0, 0.0, 100.0, 100.0, 0.9),
                det(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(result.len(), 2);
        assert!((result[0].quality_score - 0.9).abs() < 1e-6);
        assert!((result[1].quality_score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_disjoint_sorted() {
        let result = nms(
            vec![det(0.0, 0.0, 10.0, 10.0, 0.6), det(50.0, 50.0, 10.0, 10.0, 0.8)],
            0.4,
        );
        let scores: Vec<f32> = result.iter().map(|d| d.quality_score).collect();
        assert_eq!(scores, vec![0.8, 0.6]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_roundtrip() {
        let lb = Letterbox::fit(320, 240, SCRFD_INPUT_SIZE);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 80.0);

        let (x, y) = lb.to_frame((100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y));
        assert!((x - 100.0).abs() < 0.1 && (y - 50.0).abs() < 0.1);
    }

    #[test]
    fn test_preprocess_pads_with_zero_and_normalizes() {
        let image = RgbImage::from_pixel(320, 240, Rgb([255, 127, 0]));
        let (tensor, lb) = ScrfdDetector::preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);

        // Top padding band.
        assert_eq!(tensor[[0, 0, 10, 320]], 0.0);
        // Image interior keeps channel order.
        let y = lb.pad_y as usize + 100;
        assert!((tensor[[0, 0, y, 320]] - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-3);
        assert!((tensor[[0, 2, y, 320]] - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-3);
    }

    #[test]
    fn test_decode_stride_maps_to_frame_space() {
        let lb = Letterbox { scale: 2.0, pad_x: 0.0, pad_y: 80.0 };
        let stride = 32usize;
        let grid = 640 / stride;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;

        // One confident anchor in cell (x=5, y=4), first anchor of the cell.
        let cell = 4 * grid + 5;
        let idx = cell * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        scores[idx] = 0.9;
        let mut bboxes = vec![0.0f32; anchors * 4];
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);
        let kps = vec![0.0f32; anchors * 10];

        let dets = decode_stride(
            StrideTensors { scores: &scores, bboxes: &bboxes, kps: &kps },
            stride,
            &lb,
            0.5,
        );
        assert_eq!(dets.len(), 1);
        let b = dets[0].bounding_box;
        // Anchor at (160, 128) in model space; box spans ±32.
        assert!((b.x - 64.0).abs() < 1e-4, "x = {}", b.x);
        assert!((b.y - 8.0).abs() < 1e-4, "y = {}", b.y);
        assert!((b.width - 32.0).abs() < 1e-4);
        assert!((b.height - 32.0).abs() < 1e-4);
        assert_eq!(dets[0].landmarks.unwrap()[0], (80.0, 24.0));
    }

    #[test]
    fn test_discover_outputs_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(discover_outputs(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_discover_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| (428 + i).to_string()).collect();
        assert_eq!(discover_outputs(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }
}
