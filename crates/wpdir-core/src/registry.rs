//! The registry of one corpus.
//!
//! A `Registry` owns every [`PackageRecord`] of a corpus, the corpus
//! revision and a handle to the shared [`UpdateQueue`]. It is created once
//! per corpus, rehydrated from the store at startup and lives for the whole
//! process.
//!
//! ## Locking
//!
//! The package map and the revision each sit behind their own `RwLock`;
//! every record carries another. The map lock is never held while a record
//! lock is taken for writing, so searches, updates and summaries do not
//! deadlock each other.

use crate::corpus::{Corpus, CorpusSnapshot, CorpusSummary};
use crate::engine::{IndexEngine, IndexHandle};
use crate::error::{Result, WpdirError};
use crate::package::PackageRecord;
use crate::store::ResultStore;
use crate::types::{CorpusKind, PackageStatus, Revision, UpdateRequest};
use crate::update_queue::UpdateQueue;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default)]
struct RevisionStamp {
    revision: Revision,
    updated: Option<DateTime<Utc>>,
}

/// Outcome of [`Registry::load_existing`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub records: usize,
    pub indexes_found: usize,
    pub indexes_opened: usize,
    pub indexes_discarded: usize,
}

pub struct Registry {
    kind: CorpusKind,
    packages: RwLock<HashMap<String, Arc<PackageRecord>>>,
    revision: RwLock<RevisionStamp>,
    queue: Arc<UpdateQueue>,
    store: ResultStore,
    engine: Arc<dyn IndexEngine>,
    /// `<data>/index/<corpus>`
    index_root: PathBuf,
}

impl Registry {
    /// Create an empty registry whose generations live under
    /// `index_base/<corpus>`.
    pub fn new(
        kind: CorpusKind,
        queue: Arc<UpdateQueue>,
        store: ResultStore,
        engine: Arc<dyn IndexEngine>,
        index_base: impl AsRef<Path>,
    ) -> Self {
        Registry {
            kind,
            packages: RwLock::new(HashMap::new()),
            revision: RwLock::new(RevisionStamp::default()),
            queue,
            store,
            engine,
            index_root: index_base.as_ref().join(kind.as_str()),
        }
    }

    pub fn engine(&self) -> &Arc<dyn IndexEngine> {
        &self.engine
    }

    pub fn queue(&self) -> &Arc<UpdateQueue> {
        &self.queue
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn index_root(&self) -> &Path {
        &self.index_root
    }

    /// A directory no generation has used yet.
    pub fn generation_dir(&self) -> PathBuf {
        self.index_root.join(Uuid::now_v7().to_string())
    }

    /// When the revision last advanced.
    pub fn updated(&self) -> Option<DateTime<Utc>> {
        self.revision.read().updated
    }

    /// Unregister a slug, closing its searcher and forgetting its record.
    pub fn remove(&self, slug: &str) -> Option<Arc<PackageRecord>> {
        let record = self.packages.write().remove(slug)?;
        if let Err(e) = record.close() {
            warn!(corpus = %self.kind, slug, error = %e, "Failed to close removed package");
        }
        if let Err(e) = self.store.delete_package(self.kind, slug) {
            warn!(corpus = %self.kind, slug, error = %e, "Failed to delete stored package");
        }
        Some(record)
    }

    /// Persist the current revision.
    ///
    /// The write happens under the revision lock, so a stale value can never
    /// overwrite a newer one.
    pub fn save_revision(&self) -> Result<()> {
        let stamp = self.revision.write();
        self.store.save_revision(self.kind, stamp.revision)
    }

    /// Raise the revision and persist it in one step.
    ///
    /// Returns `Ok(false)` without writing when `revision` is not ahead.
    pub fn advance_revision(&self, revision: Revision) -> Result<bool> {
        let mut stamp = self.revision.write();
        if revision <= stamp.revision {
            return Ok(false);
        }
        stamp.revision = revision;
        stamp.updated = Some(Utc::now());
        self.store.save_revision(self.kind, revision)?;
        Ok(true)
    }

    /// Persist one record.
    pub fn save_package(&self, slug: &str) -> Result<()> {
        let record = self.require(slug)?;
        self.store.save_package(self.kind, &record.to_stored())
    }

    /// Live generation directory of an Open package.
    pub fn index_dir(&self, slug: &str) -> Result<PathBuf> {
        self.require(slug)?.index_dir()
    }

    /// Location of `file` inside the live generation of `slug`.
    ///
    /// Absolute paths and parent components are rejected.
    pub fn file_path(&self, slug: &str, file: &str) -> Result<PathBuf> {
        let relative = Path::new(file);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if file.is_empty() || escapes {
            return Err(WpdirError::NotIndexed {
                slug: format!("{}/{}", slug, file),
            });
        }
        Ok(self.index_dir(slug)?.join(relative))
    }

    /// Rehydrate from persisted state and reopen generations left on disk.
    ///
    /// Records load Closed. Each on-disk generation is read and opened in
    /// parallel; the newest generation of a slug is attached and its record
    /// turns Open. Directories that fail to read, open or attach, and
    /// superseded generations, are removed.
    #[instrument(skip(self), fields(corpus = %self.kind))]
    pub fn load_existing(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        match self.store.load_revision(self.kind) {
            Ok(Some(revision)) => {
                self.revision.write().revision = revision;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Ignoring unreadable revision"),
        }

        let stored = self.store.load_packages(self.kind)?;
        {
            let mut packages = self.packages.write();
            for package in stored {
                packages.insert(
                    package.slug.clone(),
                    Arc::new(PackageRecord::from_stored(package)),
                );
            }
            report.records = packages.len();
        }

        fs::create_dir_all(&self.index_root)?;
        let dirs: Vec<PathBuf> = fs::read_dir(&self.index_root)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        report.indexes_found = dirs.len();

        // Read every generation, keeping the newest per slug. Generation
        // directories are v7 uuids, so name order is creation order.
        let refs: Vec<_> = dirs
            .par_iter()
            .filter_map(|dir| match self.engine.read(dir) {
                Ok(index) => Some(index),
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "Discarding unreadable index");
                    discard_dir(dir);
                    None
                }
            })
            .collect();
        let mut newest: HashMap<String, crate::engine::IndexRef> = HashMap::new();
        let mut superseded = Vec::new();
        for index in refs {
            match newest.get(&index.slug) {
                Some(current) if current.dir >= index.dir => superseded.push(index),
                _ => {
                    if let Some(old) = newest.insert(index.slug.clone(), index) {
                        superseded.push(old);
                    }
                }
            }
        }
        for index in &superseded {
            discard_dir(&index.dir);
        }

        let opened = newest
            .into_par_iter()
            .filter(|(_, index)| match self.engine.open(index) {
                Ok(handle) => match self.update_index(handle) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(dir = %index.dir.display(), error = %e, "Discarding orphan index");
                        // rejected handles are destroyed by update_index
                        discard_dir(&index.dir);
                        false
                    }
                },
                Err(e) => {
                    debug!(dir = %index.dir.display(), error = %e, "Discarding unopenable index");
                    discard_dir(&index.dir);
                    false
                }
            })
            .count();

        report.indexes_opened = opened;
        report.indexes_discarded = report.indexes_found - opened;
        info!(
            records = report.records,
            found = report.indexes_found,
            opened = report.indexes_opened,
            revision = self.revision(),
            "Loaded existing corpus"
        );
        Ok(report)
    }

    fn require(&self, slug: &str) -> Result<Arc<PackageRecord>> {
        self.get(slug).ok_or_else(|| WpdirError::UnknownPackage {
            corpus: self.kind.to_string(),
            slug: slug.to_string(),
        })
    }
}

fn discard_dir(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "Failed to remove index directory");
        }
    }
}

impl Corpus for Registry {
    fn kind(&self) -> CorpusKind {
        self.kind
    }

    fn len(&self) -> usize {
        self.packages.read().len()
    }

    fn exists(&self, slug: &str) -> bool {
        self.packages.read().contains_key(slug)
    }

    fn get(&self, slug: &str) -> Option<Arc<PackageRecord>> {
        self.packages.read().get(slug).cloned()
    }

    fn add(&self, slug: &str) -> Result<Arc<PackageRecord>> {
        if slug.trim().is_empty() {
            return Err(WpdirError::EmptySlug);
        }
        if let Some(record) = self.get(slug) {
            return Ok(record);
        }
        let mut packages = self.packages.write();
        let record = packages
            .entry(slug.to_string())
            .or_insert_with(|| Arc::new(PackageRecord::new(slug)));
        Ok(Arc::clone(record))
    }

    fn revision(&self) -> Revision {
        self.revision.read().revision
    }

    fn set_revision(&self, revision: Revision) -> bool {
        let mut stamp = self.revision.write();
        if revision <= stamp.revision {
            return false;
        }
        stamp.revision = revision;
        stamp.updated = Some(Utc::now());
        true
    }

    fn set_status(&self, slug: &str, status: PackageStatus) -> Result<()> {
        self.require(slug)?.set_status(status);
        Ok(())
    }

    fn queue_update(&self, slug: &str, revision: Revision) -> Result<()> {
        self.queue.push(UpdateRequest::new(slug, self.kind, revision))
    }

    fn update_index(&self, handle: Box<dyn IndexHandle>) -> Result<()> {
        let slug = handle.slug().to_string();
        if slug.is_empty() {
            if let Err(e) = handle.destroy() {
                warn!(corpus = %self.kind, error = %e, "Failed to discard index without slug");
            }
            return Err(WpdirError::EmptySlug);
        }

        let Some(record) = self.get(&slug) else {
            if let Err(e) = handle.destroy() {
                warn!(corpus = %self.kind, slug = %slug, error = %e, "Failed to discard orphan index");
            }
            return Err(WpdirError::UnknownPackage {
                corpus: self.kind.to_string(),
                slug,
            });
        };

        record.install(handle)
    }

    fn summary(&self) -> CorpusSummary {
        let stamp = *self.revision.read();
        let packages = self.packages.read();
        let closed = packages
            .values()
            .filter(|record| record.status() == PackageStatus::Closed)
            .count();
        CorpusSummary {
            corpus: self.kind,
            revision: stamp.revision,
            updated: stamp.updated,
            total: packages.len(),
            closed,
            queued: self.queue.len(),
        }
    }

    fn snapshot(&self) -> CorpusSnapshot {
        let revision = self.revision();
        let records = self.packages.read().values().cloned().collect();
        CorpusSnapshot {
            corpus: self.kind,
            revision,
            records,
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("packages", &self.len())
            .field("revision", &self.revision())
            .field("engine", &self.engine.name())
            .finish()
    }
}
