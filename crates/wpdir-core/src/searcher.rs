//! Hot-swappable wrapper around one package's live index generation.
//!
//! A `Searcher` always owns exactly one opened generation. [`Searcher::swap`]
//! is the only way to replace it: the new handle is installed under the
//! write lock and the previous one is destroyed right after the lock is
//! released, before `swap` returns. Searches hold the read lock, so no search
//! ever sees a half-swapped state and no handle is used after destruction.

use crate::engine::{IndexHandle, IndexSearchOptions, SearchResponse};
use crate::error::{Result, WpdirError};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

pub struct Searcher {
    slug: String,
    handle: RwLock<Box<dyn IndexHandle>>,
    /// Number of generations installed so far
    generation: AtomicU64,
}

impl Searcher {
    /// Wrap the first generation of a package.
    pub fn new(handle: Box<dyn IndexHandle>) -> Self {
        Searcher {
            slug: handle.slug().to_string(),
            handle: RwLock::new(handle),
            generation: AtomicU64::new(1),
        }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// Current generation number (starts at 1).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Directory of the live generation.
    pub fn dir(&self) -> PathBuf {
        self.handle.read().dir().to_path_buf()
    }

    /// Search the live generation.
    pub fn search(&self, pattern: &str, opts: &IndexSearchOptions) -> anyhow::Result<SearchResponse> {
        self.handle.read().search(pattern, opts)
    }

    /// Install `next` as the live generation and destroy the previous one.
    ///
    /// Fails without touching the live generation if `next` belongs to another
    /// package or reuses the live directory; `next` is destroyed in that case.
    pub fn swap(&self, next: Box<dyn IndexHandle>) -> Result<()> {
        if next.slug() != self.slug {
            let reason = format!("handle belongs to {:?}", next.slug());
            if let Err(e) = next.destroy() {
                warn!(slug = %self.slug, error = %e, "Failed to discard rejected generation");
            }
            return Err(WpdirError::Swap {
                slug: self.slug.clone(),
                reason,
            });
        }

        let old = {
            let mut live = self.handle.write();
            if next.dir() == live.dir() {
                // dropping `next` without destroy keeps the shared directory
                return Err(WpdirError::Swap {
                    slug: self.slug.clone(),
                    reason: format!("handle reuses live directory {}", next.dir().display()),
                });
            }
            std::mem::replace(&mut *live, next)
        };
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let old_dir = old.dir().to_path_buf();
        if let Err(e) = old.destroy() {
            warn!(
                slug = %self.slug,
                dir = %old_dir.display(),
                error = %e,
                "Failed to release previous index generation"
            );
        }
        debug!(slug = %self.slug, generation, "Index generation swapped");
        Ok(())
    }

    /// Destroy the live generation, consuming the searcher.
    pub fn close(self) -> Result<()> {
        let slug = self.slug;
        self.handle
            .into_inner()
            .destroy()
            .map_err(|e| WpdirError::Swap {
                slug,
                reason: format!("closing generation: {}", e),
            })
    }
}

impl std::fmt::Debug for Searcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Searcher")
            .field("slug", &self.slug)
            .field("generation", &self.generation())
            .finish()
    }
}
