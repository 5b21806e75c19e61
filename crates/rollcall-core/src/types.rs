use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// Axis-aligned face region in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// A face located in a single frame. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bounding_box: BoundingBox,
    pub landmarks: Option<Landmarks>,
    /// Detector confidence in [0, 1].
    pub quality_score: f32,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// True when every component is finite and at least one is non-zero.
    pub fn is_usable(&self) -> bool {
        self.values.iter().all(|v| v.is_finite()) && self.values.iter().any(|v| *v != 0.0)
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Always processes all dimensions; a zero-norm side yields 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }

    /// Scale to unit L2 norm. A zero vector is returned unchanged.
    pub fn normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut self.values {
                *v /= norm;
            }
        }
        self
    }
}

/// An enrolled person: exactly one active embedding per `identity_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    pub identity_id: String,
    pub display_name: String,
    pub embedding: Embedding,
    pub enrolled_at: DateTime<Utc>,
}

/// Outcome of comparing one query embedding against the gallery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    Rejected,
    /// No usable face: embedding extraction failed for this detection.
    NoFace,
    /// Best candidate cleared the threshold but a runner-up is too close.
    Ambiguous,
}

/// Result of matching a query embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Set only when `decision` is `Accepted`.
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
    /// Cosine similarity of the best candidate [-1, 1].
    pub similarity: f32,
    /// Cosine distance of the best candidate, `1 - similarity`.
    pub distance: f32,
    /// Similarity of the second-best candidate, if the gallery had one.
    pub runner_up_similarity: Option<f32>,
    pub decision: Decision,
}

impl MatchResult {
    pub fn rejected(similarity: f32, runner_up_similarity: Option<f32>) -> Self {
        Self {
            identity_id: None,
            display_name: None,
            similarity,
            distance: 1.0 - similarity,
            runner_up_similarity,
            decision: Decision::Rejected,
        }
    }

    pub fn no_face() -> Self {
        Self {
            identity_id: None,
            display_name: None,
            similarity: 0.0,
            distance: 1.0,
            runner_up_similarity: None,
            decision: Decision::NoFace,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.decision == Decision::Accepted
    }
}
