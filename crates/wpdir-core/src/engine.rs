//! Index engine traits.
//!
//! The text index itself (trigram build, regex evaluation) is an external
//! capability. The core only needs to build a generation from archive bytes,
//! rediscover generations on disk, open them, search them and destroy them.
//! Everything engine-specific stays behind these traits.
//!
//! ## Implementing an Engine
//!
//! 1. `build` writes a complete generation into a fresh directory and reports
//!    the file statistics it saw along the way
//! 2. `read` recognises a directory produced by `build` after a restart
//! 3. `open` turns a reference into a searchable handle
//! 4. `IndexHandle::destroy` releases the handle and its directory

use crate::types::FileStats;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod bundle;

pub use bundle::BundleEngine;

/// Locates one on-disk index generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRef {
    /// Package the generation was built for (may be empty if the engine could
    /// not recover it)
    pub slug: String,

    /// Directory holding the generation
    pub dir: PathBuf,
}

impl IndexRef {
    pub fn new(slug: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        IndexRef {
            slug: slug.into(),
            dir: dir.into(),
        }
    }
}

/// Options passed through to the engine for a single package search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSearchOptions {
    pub ignore_case: bool,
    pub lines_of_context: u32,
    /// Files to skip before collecting
    pub offset: u32,
    /// Maximum files to return (0 = unlimited)
    pub limit: u32,
}

/// One matching line inside a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMatch {
    pub line: String,
    pub line_number: u32,
    pub before: Vec<String>,
    pub after: Vec<String>,
}

/// All matching lines of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMatch {
    pub filename: String,
    pub matches: Vec<LineMatch>,
}

/// Engine response for one package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResponse {
    pub matches: Vec<FileMatch>,
    pub files_with_match: usize,
    pub files_opened: usize,
}

impl SearchResponse {
    /// Total matching lines across all files.
    pub fn line_count(&self) -> usize {
        self.matches.iter().map(|f| f.matches.len()).sum()
    }
}

/// A live, opened index generation.
///
/// `destroy` consumes the handle, so a generation cannot be searched or
/// destroyed again once released.
pub trait IndexHandle: Send + Sync {
    /// Package this generation belongs to
    fn slug(&self) -> &str;

    /// Directory holding the generation
    fn dir(&self) -> &Path;

    /// Run a pattern search over the generation.
    fn search(&self, pattern: &str, opts: &IndexSearchOptions) -> anyhow::Result<SearchResponse>;

    /// Close the generation and remove its on-disk artifacts.
    fn destroy(self: Box<Self>) -> anyhow::Result<()>;
}

/// Builds and opens index generations.
pub trait IndexEngine: Send + Sync {
    /// Build a generation from archive bytes into `dst`.
    ///
    /// `dst` does not exist yet. On error the caller removes whatever was
    /// left behind.
    fn build(&self, archive: &[u8], dst: &Path, slug: &str) -> anyhow::Result<(IndexRef, FileStats)>;

    /// Recognise a generation directory left by a previous process.
    fn read(&self, dir: &Path) -> anyhow::Result<IndexRef>;

    /// Open a generation for searching.
    fn open(&self, index: &IndexRef) -> anyhow::Result<Box<dyn IndexHandle>>;

    /// Engine name for logs
    fn name(&self) -> &'static str;
}
