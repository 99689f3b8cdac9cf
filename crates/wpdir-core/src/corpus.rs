//! The corpus capability shared by the plugin and theme directories.
//!
//! Both directories behave identically; only their [`CorpusKind`] differs.
//! Consumers (pollers, the fan-out executor, tests) depend on this trait
//! rather than on a concrete registry.

use crate::engine::IndexHandle;
use crate::error::Result;
use crate::package::PackageRecord;
use crate::types::{CorpusKind, PackageStatus, Revision};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Counts reported by [`Corpus::summary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusSummary {
    pub corpus: CorpusKind,
    pub revision: Revision,
    pub updated: Option<DateTime<Utc>>,
    pub total: usize,
    pub closed: usize,
    /// Update requests waiting in the shared queue
    pub queued: usize,
}

/// Records and revision captured for one search sweep.
#[derive(Debug, Clone)]
pub struct CorpusSnapshot {
    pub corpus: CorpusKind,
    pub revision: Revision,
    pub records: Vec<Arc<PackageRecord>>,
}

impl CorpusSnapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub trait Corpus: Send + Sync {
    fn kind(&self) -> CorpusKind;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn exists(&self, slug: &str) -> bool;

    fn get(&self, slug: &str) -> Option<Arc<PackageRecord>>;

    /// Register a slug as a Closed record. Adding a known slug returns the
    /// existing record.
    fn add(&self, slug: &str) -> Result<Arc<PackageRecord>>;

    fn revision(&self) -> Revision;

    /// Advance the revision. Returns false (and changes nothing) unless
    /// `revision` is ahead of the current one.
    fn set_revision(&self, revision: Revision) -> bool;

    fn set_status(&self, slug: &str, status: PackageStatus) -> Result<()>;

    /// Enqueue an update, blocking while the update queue is full.
    fn queue_update(&self, slug: &str, revision: Revision) -> Result<()>;

    /// Attach a freshly built generation to its record.
    fn update_index(&self, handle: Box<dyn IndexHandle>) -> Result<()>;

    fn summary(&self) -> CorpusSummary;

    fn snapshot(&self) -> CorpusSnapshot;
}
