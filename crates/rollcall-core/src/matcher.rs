//! Gallery matching and the accept / ambiguous / reject decision policy.

use crate::gallery::GallerySnapshot;
use crate::types::{Decision, Embedding, EnrolledIdentity, MatchResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_ACCEPT_THRESHOLD: f32 = 0.6;
pub const DEFAULT_AMBIGUITY_MARGIN: f32 = 0.15;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("query embedding has {actual} dimensions, gallery expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("query embedding contains non-finite values or is all zeros")]
    DegenerateQuery,
}

/// Thresholds applied to the best and second-best cosine similarities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    /// Minimum cosine similarity for the best candidate.
    pub accept_threshold: f32,
    /// Minimum gap between the best and second-best candidates.
    pub ambiguity_margin: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
            ambiguity_margin: DEFAULT_AMBIGUITY_MARGIN,
        }
    }
}

/// Strategy for identifying a query embedding against the enrolled gallery.
pub trait Matcher: Send + Sync {
    fn identify(
        &self,
        query: &Embedding,
        gallery: &GallerySnapshot,
    ) -> Result<MatchResult, MatchError>;
}

/// Cosine similarity matcher over a linear gallery scan.
///
/// Every entry is compared, with no early exit, so the result never
/// depends on gallery ordering beyond exact ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher {
    pub policy: MatchPolicy,
}

impl CosineMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }
}

impl Matcher for CosineMatcher {
    fn identify(
        &self,
        query: &Embedding,
        gallery: &GallerySnapshot,
    ) -> Result<MatchResult, MatchError> {
        if query.dimension() != gallery.dimension() {
            return Err(MatchError::DimensionMismatch {
                expected: gallery.dimension(),
                actual: query.dimension(),
            });
        }
        if !query.is_usable() {
            return Err(MatchError::DegenerateQuery);
        }

        let mut best: Option<(&EnrolledIdentity, f32)> = None;
        let mut runner_up: Option<f32> = None;

        for identity in gallery.entries() {
            let sim = query.similarity(&identity.embedding);
            match best {
                Some((_, best_sim)) if sim <= best_sim => {
                    if runner_up.map_or(true, |r| sim > r) {
                        runner_up = Some(sim);
                    }
                }
                Some((_, best_sim)) => {
                    runner_up = Some(best_sim);
                    best = Some((identity, sim));
                }
                None => best = Some((identity, sim)),
            }
        }

        let Some((identity, best_sim)) = best else {
            // Empty gallery: nothing to compare against.
            return Ok(MatchResult::rejected(0.0, None));
        };

        if best_sim < self.policy.accept_threshold {
            return Ok(MatchResult::rejected(best_sim, runner_up));
        }

        let clear = runner_up.map_or(true, |r| best_sim - r >= self.policy.ambiguity_margin);
        if !clear {
            tracing::debug!(
                best = best_sim,
                runner_up = ?runner_up,
                margin = self.policy.ambiguity_margin,
                "ambiguous match"
            );
            return Ok(MatchResult {
                identity_id: None,
                display_name: None,
                similarity: best_sim,
                distance: 1.0 - best_sim,
                runner_up_similarity: runner_up,
                decision: Decision::Ambiguous,
            });
        }

        Ok(MatchResult {
            identity_id: Some(identity.identity_id.clone()),
            display_name: Some(identity.display_name.clone()),
            similarity: best_sim,
            distance: 1.0 - best_sim,
            runner_up_similarity: runner_up,
            decision: Decision::Accepted,
        })
    }
}
