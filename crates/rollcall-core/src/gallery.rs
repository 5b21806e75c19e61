//! Enrolled-identity gallery.
//!
//! The gallery lives in memory as an immutable map behind an `Arc`. Readers
//! take a [`GallerySnapshot`] (an `Arc` clone) and never observe a partial
//! write; writers copy the map, modify the copy, and swap it in. An optional
//! [`IdentityRepository`] makes writes durable before the swap.

use crate::types::{Embedding, EnrolledIdentity};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("invalid embedding: expected {expected} dimensions, got {actual}")]
    InvalidEmbedding { expected: usize, actual: usize },
    #[error("invalid embedding: contains non-finite values or is all zeros")]
    DegenerateEmbedding,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("identity repository: {0}")]
    Repository(String),
}

/// Durable backing for enrolled identities.
pub trait IdentityRepository: Send + Sync {
    /// Insert or replace the identity keyed by `identity_id`.
    fn upsert(&self, identity: &EnrolledIdentity) -> Result<(), GalleryError>;
    /// Delete the identity; absent ids are not an error.
    fn remove(&self, identity_id: &str) -> Result<(), GalleryError>;
    fn load_all(&self) -> Result<Vec<EnrolledIdentity>, GalleryError>;
}

/// Whether an enrollment created a new identity or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollOutcome {
    Created,
    Replaced,
}

/// Listing entry for registered faces (no embedding payload).
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub identity_id: String,
    pub display_name: String,
    pub enrolled_at: DateTime<Utc>,
}

type Entries = BTreeMap<String, EnrolledIdentity>;

/// Point-in-time view of the gallery. Cheap to clone, iterable any number
/// of times, and unaffected by later enrollments or removals.
#[derive(Debug, Clone)]
pub struct GallerySnapshot {
    dimension: usize,
    entries: Arc<Entries>,
}

impl GallerySnapshot {
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(identity_id, embedding)` pairs in identity order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Embedding)> + '_ {
        self.entries
            .values()
            .map(|identity| (identity.identity_id.as_str(), &identity.embedding))
    }

    pub fn entries(&self) -> impl Iterator<Item = &EnrolledIdentity> + '_ {
        self.entries.values()
    }

    pub fn get(&self, identity_id: &str) -> Option<&EnrolledIdentity> {
        self.entries.get(identity_id)
    }
}

/// The embedding store: identity → embedding, one embedding per identity.
pub struct EmbeddingStore {
    dimension: usize,
    entries: RwLock<Arc<Entries>>,
    repository: Option<Arc<dyn IdentityRepository>>,
    /// Serializes writers so the durable write and the swap stay in order.
    write_lock: Mutex<()>,
}

impl EmbeddingStore {
    /// In-memory store for embeddings of `dimension` components.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: RwLock::new(Arc::new(Entries::new())),
            repository: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Store backed by `repository`, seeded with every persisted identity.
    ///
    /// Rows whose embedding does not match `dimension` are skipped.
    pub fn open(
        dimension: usize,
        repository: Arc<dyn IdentityRepository>,
    ) -> Result<Self, GalleryError> {
        let mut entries = Entries::new();
        for identity in repository.load_all()? {
            if identity.embedding.dimension() != dimension {
                tracing::warn!(
                    identity_id = %identity.identity_id,
                    expected = dimension,
                    actual = identity.embedding.dimension(),
                    "skipping stored identity with mismatched embedding dimension"
                );
                continue;
            }
            entries.insert(identity.identity_id.clone(), identity);
        }
        tracing::info!(count = entries.len(), dimension, "gallery loaded");

        Ok(Self {
            dimension,
            entries: RwLock::new(Arc::new(entries)),
            repository: Some(repository),
            write_lock: Mutex::new(()),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Enroll or re-enroll an identity, replacing any prior embedding.
    pub fn enroll(
        &self,
        identity_id: &str,
        display_name: &str,
        embedding: Embedding,
    ) -> Result<EnrollOutcome, GalleryError> {
        let identity_id = identity_id.trim();
        let display_name = display_name.trim();
        if identity_id.is_empty() {
            return Err(GalleryError::InvalidInput("identity_id is required".into()));
        }
        if display_name.is_empty() {
            return Err(GalleryError::InvalidInput("name is required".into()));
        }
        if embedding.dimension() != self.dimension {
            return Err(GalleryError::InvalidEmbedding {
                expected: self.dimension,
                actual: embedding.dimension(),
            });
        }
        if !embedding.is_usable() {
            return Err(GalleryError::DegenerateEmbedding);
        }

        let identity = EnrolledIdentity {
            identity_id: identity_id.to_string(),
            display_name: display_name.to_string(),
            embedding,
            enrolled_at: Utc::now(),
        };

        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(repo) = &self.repository {
            repo.upsert(&identity)?;
        }

        let mut next = (*self.current()).clone();
        let outcome = match next.insert(identity.identity_id.clone(), identity) {
            Some(_) => EnrollOutcome::Replaced,
            None => EnrollOutcome::Created,
        };
        self.swap(next);

        tracing::info!(identity_id, ?outcome, "identity enrolled");
        Ok(outcome)
    }

    /// Remove an identity. Returns whether it was present; absent ids are not an error.
    pub fn remove(&self, identity_id: &str) -> Result<bool, GalleryError> {
        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(repo) = &self.repository {
            repo.remove(identity_id)?;
        }

        let current = self.current();
        if !current.contains_key(identity_id) {
            return Ok(false);
        }
        let mut next = (*current).clone();
        next.remove(identity_id);
        self.swap(next);

        tracing::info!(identity_id, "identity removed");
        Ok(true)
    }

    /// Snapshot of the whole gallery as of this call.
    pub fn all(&self) -> GallerySnapshot {
        GallerySnapshot {
            dimension: self.dimension,
            entries: self.current(),
        }
    }

    pub fn get(&self, identity_id: &str) -> Option<EnrolledIdentity> {
        self.current().get(identity_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }

    pub fn identities(&self) -> Vec<IdentitySummary> {
        self.current()
            .values()
            .map(|identity| IdentitySummary {
                identity_id: identity.identity_id.clone(),
                display_name: identity.display_name.clone(),
                enrolled_at: identity.enrolled_at,
            })
            .collect()
    }

    fn current(&self) -> Arc<Entries> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn swap(&self, next: Entries) {
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }
}
