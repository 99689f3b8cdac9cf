//! One member of a corpus: metadata, status and live searcher.
//!
//! All mutable state sits behind a per-record `RwLock`, independent of the
//! registry map lock, so searches over different packages never contend.

use crate::engine::{IndexHandle, IndexSearchOptions, SearchResponse};
use crate::error::{Result, WpdirError};
use crate::searcher::Searcher;
use crate::types::{FileStats, PackageMeta, PackageStatus, Revision};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Mutable part of a record.
#[derive(Debug, Default)]
pub struct PackageState {
    pub meta: PackageMeta,
    pub status: PackageStatus,
    /// Revision the live index was built at
    pub revision: Revision,
    pub stats: Option<FileStats>,
    searcher: Option<Searcher>,
}

impl PackageState {
    pub fn searcher(&self) -> Option<&Searcher> {
        self.searcher.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.status == PackageStatus::Open
    }
}

pub struct PackageRecord {
    slug: String,
    state: RwLock<PackageState>,
}

/// Persisted form of a record. The searcher is rebuilt from disk on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPackage {
    pub slug: String,
    #[serde(default)]
    pub meta: PackageMeta,
    #[serde(default)]
    pub revision: Revision,
    #[serde(default)]
    pub stats: Option<FileStats>,
}

impl PackageRecord {
    /// A fresh, Closed record without a searcher.
    pub fn new(slug: impl Into<String>) -> Self {
        PackageRecord {
            slug: slug.into(),
            state: RwLock::new(PackageState::default()),
        }
    }

    /// Rehydrate from the store. Loaded records start Closed until their
    /// index is reopened.
    pub fn from_stored(stored: StoredPackage) -> Self {
        PackageRecord {
            slug: stored.slug,
            state: RwLock::new(PackageState {
                meta: stored.meta,
                status: PackageStatus::Closed,
                revision: stored.revision,
                stats: stored.stats,
                searcher: None,
            }),
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PackageState> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, PackageState> {
        self.state.write()
    }

    pub fn status(&self) -> PackageStatus {
        self.state.read().status
    }

    pub fn is_open(&self) -> bool {
        self.state.read().is_open()
    }

    pub fn set_status(&self, status: PackageStatus) {
        self.state.write().status = status;
    }

    pub fn set_meta(&self, meta: PackageMeta) {
        self.state.write().meta = meta;
    }

    pub fn meta(&self) -> PackageMeta {
        self.state.read().meta.clone()
    }

    /// Attach a new generation: build the searcher on first use, swap after.
    ///
    /// The record is Open on success and Closed on failure; the previous
    /// generation survives a failed swap.
    pub fn install(&self, handle: Box<dyn IndexHandle>) -> Result<()> {
        if handle.slug() != self.slug {
            let found = handle.slug().to_string();
            if let Err(e) = handle.destroy() {
                warn!(slug = %self.slug, error = %e, "Failed to discard foreign generation");
            }
            self.set_status(PackageStatus::Closed);
            return Err(WpdirError::Swap {
                slug: self.slug.clone(),
                reason: format!("handle belongs to {:?}", found),
            });
        }

        // Fast path: swap through the read lock so searches keep flowing.
        {
            let state = self.state.read();
            if let Some(searcher) = state.searcher() {
                let swapped = searcher.swap(handle);
                drop(state);
                let status = if swapped.is_ok() {
                    PackageStatus::Open
                } else {
                    PackageStatus::Closed
                };
                self.set_status(status);
                return swapped;
            }
        }

        let mut state = self.state.write();
        match state.searcher.as_ref() {
            // another worker attached a searcher in between
            Some(searcher) => {
                let swapped = searcher.swap(handle);
                state.status = if swapped.is_ok() {
                    PackageStatus::Open
                } else {
                    PackageStatus::Closed
                };
                swapped
            }
            None => {
                state.searcher = Some(Searcher::new(handle));
                state.status = PackageStatus::Open;
                Ok(())
            }
        }
    }

    /// Search the live generation under the record's read lock.
    ///
    /// Closed records report `NotIndexed`.
    pub fn search(&self, pattern: &str, opts: &IndexSearchOptions) -> Result<SearchResponse> {
        let state = self.state.read();
        match state.searcher() {
            Some(searcher) if state.is_open() => searcher
                .search(pattern, opts)
                .map_err(|e| WpdirError::upstream("index search", e)),
            _ => Err(WpdirError::NotIndexed {
                slug: self.slug.clone(),
            }),
        }
    }

    /// Directory of the live generation, for file-content lookups.
    pub fn index_dir(&self) -> Result<PathBuf> {
        let state = self.state.read();
        match state.searcher() {
            Some(searcher) if state.is_open() => Ok(searcher.dir()),
            _ => Err(WpdirError::NotIndexed {
                slug: self.slug.clone(),
            }),
        }
    }

    /// Detach and destroy the searcher, leaving the record Closed.
    pub fn close(&self) -> Result<()> {
        let searcher = {
            let mut state = self.state.write();
            state.status = PackageStatus::Closed;
            state.searcher.take()
        };
        match searcher {
            Some(searcher) => searcher.close(),
            None => Ok(()),
        }
    }

    /// Snapshot for persistence.
    pub fn to_stored(&self) -> StoredPackage {
        let state = self.state.read();
        StoredPackage {
            slug: self.slug.clone(),
            meta: state.meta.clone(),
            revision: state.revision,
            stats: state.stats.clone(),
        }
    }
}

impl std::fmt::Debug for PackageRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("PackageRecord")
            .field("slug", &self.slug)
            .field("status", &state.status)
            .field("revision", &state.revision)
            .field("searcher", &state.searcher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::searcher::tests::{DestroyLog, FakeHandle};

    #[test]
    fn test_new_record_is_closed() {
        let record = PackageRecord::new("akismet");
        assert_eq!(record.status(), PackageStatus::Closed);
        assert!(record.read().searcher().is_none());
        assert!(matches!(
            record.index_dir(),
            Err(WpdirError::NotIndexed { .. })
        ));
        assert!(matches!(
            record.search("x", &IndexSearchOptions::default()),
            Err(WpdirError::NotIndexed { .. })
        ));
    }

    #[test]
    fn test_install_then_swap() {
        let log = DestroyLog::default();
        let record = PackageRecord::new("akismet");

        record.install(FakeHandle::boxed("akismet", "/idx/a", 1, &log)).unwrap();
        assert!(record.is_open());
        assert_eq!(record.index_dir().unwrap(), PathBuf::from("/idx/a"));

        record.install(FakeHandle::boxed("akismet", "/idx/b", 2, &log)).unwrap();
        assert!(record.is_open());
        assert_eq!(log.count("/idx/a"), 1);
        let resp = record.search("needle", &IndexSearchOptions::default()).unwrap();
        assert_eq!(resp.line_count(), 2);
    }

    #[test]
    fn test_failed_swap_closes_but_keeps_generation() {
        let log = DestroyLog::default();
        let record = PackageRecord::new("akismet");
        record.install(FakeHandle::boxed("akismet", "/idx/a", 1, &log)).unwrap();

        let err = record.install(FakeHandle::boxed("akismet", "/idx/a", 1, &log));
        assert!(err.is_err());
        assert_eq!(record.status(), PackageStatus::Closed);
        assert_eq!(log.count("/idx/a"), 0);
        assert!(record.read().searcher().is_some());
    }

    /// Handle whose directory cannot be removed.
    struct StuckHandle(PathBuf);

    impl IndexHandle for StuckHandle {
        fn slug(&self) -> &str {
            "other"
        }
        fn dir(&self) -> &std::path::Path {
            &self.0
        }
        fn search(&self, _pattern: &str, _opts: &IndexSearchOptions) -> anyhow::Result<SearchResponse> {
            anyhow::bail!("not searchable")
        }
        fn destroy(self: Box<Self>) -> anyhow::Result<()> {
            anyhow::bail!("permission denied")
        }
    }

    #[test]
    fn test_foreign_handle_is_discarded() {
        let log = DestroyLog::default();
        let record = PackageRecord::new("akismet");
        record.install(FakeHandle::boxed("akismet", "/idx/a", 1, &log)).unwrap();

        let err = record.install(FakeHandle::boxed("hello-dolly", "/idx/h", 1, &log));
        assert!(matches!(err, Err(WpdirError::Swap { .. })));
        assert_eq!(log.count("/idx/h"), 1);
        assert_eq!(log.count("/idx/a"), 0);
        assert_eq!(record.status(), PackageStatus::Closed);

        let err = record.install(Box::new(StuckHandle(PathBuf::from("/idx/stuck"))));
        assert!(matches!(err, Err(WpdirError::Swap { .. })));
        assert_eq!(record.index_dir().ok(), None);
        assert!(record.read().searcher().is_some());
    }

    #[test]
    fn test_close_releases_searcher() {
        let log = DestroyLog::default();
        let record = PackageRecord::new("akismet");
        record.install(FakeHandle::boxed("akismet", "/idx/a", 1, &log)).unwrap();

        record.close().unwrap();
        assert_eq!(record.status(), PackageStatus::Closed);
        assert_eq!(log.count("/idx/a"), 1);
        assert!(record.read().searcher().is_none());
    }

    #[test]
    fn test_stored_roundtrip_starts_closed() {
        let log = DestroyLog::default();
        let record = PackageRecord::new("akismet");
        record.set_meta(PackageMeta {
            name: "Akismet".to_string(),
            ..Default::default()
        });
        record.install(FakeHandle::boxed("akismet", "/idx/a", 1, &log)).unwrap();
        record.write().revision = 42;

        let loaded = PackageRecord::from_stored(record.to_stored());
        assert_eq!(loaded.status(), PackageStatus::Closed);
        assert_eq!(loaded.meta().name, "Akismet");
        assert_eq!(loaded.read().revision, 42);
    }
}
