//! # wpdir Core Library
//!
//! This crate mirrors the plugin and theme directories, keeps a searchable
//! index per package fresh as upstream changes, and runs regex searches
//! across a whole corpus at once. The index engine and every upstream
//! service sit behind traits so the core stays transport-agnostic.
//!
//! ## Architecture
//!
//! - **Engine** (`engine`): Index engine and handle traits, plus a bundle engine
//! - **Upstream** (`upstream`): Changelog, metadata and archive collaborators
//! - **Registry** (`registry`, `package`, `searcher`): Per-corpus package state
//!   and hot-swappable index generations
//! - **Updates** (`update_queue`, `updater`, `poller`): Change detection and
//!   the rebuild worker pool
//! - **Search** (`queue`, `manager`, `fanout`, `search`): Search intake,
//!   execution and results
//! - **Persistence** (`store`): Bucketed key-value store and result framing
//! - **Config** (`config`): Configuration management
//!
//! ## Example
//!
//! ```rust,ignore
//! use wpdir_core::{Collaborators, Config, CorpusKind, Pipeline, SearchRequest};
//!
//! let pipeline = Pipeline::open(Config::load()?, collaborators)?;
//! pipeline.load_existing()?;
//! pipeline.start(false)?;
//!
//! let id = pipeline
//!     .search()
//!     .new_search(SearchRequest::new("add_action\\(", CorpusKind::Plugins))?;
//! let view = pipeline.search().status(&id)?;
//! ```

pub mod config;
pub mod corpus;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod manager;
pub mod metrics;
pub mod package;
pub mod pipeline;
pub mod poller;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod search;
pub mod searcher;
pub mod store;
pub mod types;
pub mod update_queue;
pub mod updater;
pub mod upstream;

// Re-export commonly used types
pub use config::Config;
pub use corpus::{Corpus, CorpusSnapshot, CorpusSummary};
pub use engine::{BundleEngine, IndexEngine, IndexHandle, IndexRef, IndexSearchOptions, SearchResponse};
pub use error::{Result, WpdirError};
pub use fanout::{FanOutExecutor, SweepOutcome};
pub use manager::SearchManager;
pub use metrics::{Metrics, MetricsSnapshot};
pub use package::PackageRecord;
pub use pipeline::{Collaborators, Pipeline};
pub use poller::ChangelogPoller;
pub use queue::SearchQueue;
pub use registry::Registry;
pub use search::{Match, Matches, PackageResult, Search, SearchOptions, SearchRequest, SearchStatus, SearchView, Summary};
pub use searcher::Searcher;
pub use store::{DirStore, KvStore, MemoryStore, ResultStore};
pub use types::{ChangelogEntry, CorpusKind, FileStats, PackageMeta, PackageStatus, Revision, UpdateRequest};
pub use update_queue::UpdateQueue;
pub use updater::{UpdateOutcome, UpdateWorkerPool, Updater};
pub use upstream::{ArchiveResponse, ArchiveSource, MetadataSource, Upstream};
