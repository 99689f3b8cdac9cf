//! Search intake, execution and history.
//!
//! [`SearchManager::new_search`] validates a request, records it as Queued
//! and pushes its id onto the [`SearchQueue`]. A single worker thread
//! ([`SearchManager::start`]) runs searches one at a time through the
//! [`FanOutExecutor`]. Completed searches are persisted and dropped from
//! memory; status reads fall back to the store.
//!
//! Every search accepted before [`SearchManager::shutdown`] runs to
//! completion: the worker drains the queue before it exits.

use crate::config::SearchConfig;
use crate::corpus::Corpus;
use crate::error::{Result, WpdirError};
use crate::fanout::FanOutExecutor;
use crate::metrics::Metrics;
use crate::queue::SearchQueue;
use crate::search::{Match, Matches, Search, SearchRequest, SearchView, Summary};
use crate::store::ResultStore;
use crate::types::CorpusKind;
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub struct SearchManager {
    corpora: HashMap<CorpusKind, Arc<dyn Corpus>>,
    queue: SearchQueue,
    /// Queued and running searches
    active: RwLock<HashMap<String, Search>>,
    store: ResultStore,
    executor: FanOutExecutor,
    metrics: Arc<Metrics>,
    max_context: u32,
    accepting: AtomicBool,
    /// Held shared while a search is being queued, exclusively by `shutdown`
    intake: RwLock<()>,
}

impl SearchManager {
    pub fn new(
        corpora: impl IntoIterator<Item = Arc<dyn Corpus>>,
        store: ResultStore,
        config: &SearchConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        SearchManager {
            corpora: corpora.into_iter().map(|c| (c.kind(), c)).collect(),
            queue: SearchQueue::new(config.queue_capacity),
            active: RwLock::new(HashMap::new()),
            store,
            executor: FanOutExecutor::from_config(config),
            metrics,
            max_context: config.max_lines_of_context,
            accepting: AtomicBool::new(true),
            intake: RwLock::new(()),
        }
    }

    /// Validate and enqueue a search. Blocks while the queue is full.
    pub fn new_search(&self, request: SearchRequest) -> Result<String> {
        let _intake = self.intake.read();
        if !self.accepting.load(Ordering::Acquire) {
            return Err(WpdirError::ShuttingDown);
        }
        request.validate()?;
        self.corpus(request.target)?;

        let id = Uuid::now_v7().to_string();
        let target = request.target;
        self.active
            .write()
            .insert(id.clone(), Search::new(id.clone(), request));
        if let Err(e) = self.queue.add(&id) {
            self.active.write().remove(&id);
            return Err(e);
        }
        self.metrics.set_search_queue(self.queue.len());
        info!(id = %id, corpus = %target, position = self.queue.pos(&id), "Search queued");
        Ok(id)
    }

    /// Run one queued search to completion.
    ///
    /// Per-package failures never fail the search. Persistence failures
    /// are returned after the search has been completed and released.
    #[instrument(skip(self))]
    pub fn process_search(&self, id: &str) -> Result<()> {
        let started = Instant::now();
        let (target, input, mut opts) = {
            let active = self.active.read();
            let search = active.get(id).ok_or_else(|| WpdirError::SearchNotFound {
                id: id.to_string(),
            })?;
            (search.target, search.input.clone(), search.options.clone())
        };
        opts.lines_of_context = opts.lines_of_context.min(self.max_context);

        let snapshot = self.corpus(target)?.snapshot();
        if let Some(search) = self.active.write().get_mut(id) {
            search.start(snapshot.revision);
        }
        debug!(packages = snapshot.len(), revision = snapshot.revision, "Search started");

        let outcome = self.executor.sweep(&snapshot, &input, &opts, |progress, matches| {
            if let Some(search) = self.active.write().get_mut(id) {
                search.advance(progress, matches);
            }
        });

        let mut first_err = None;
        if let Err(e) = self.store.save_summary(id, &outcome.summary) {
            warn!(error = %e, "Failed to save search summary");
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.store.save_matches(id, &outcome.matches) {
            warn!(error = %e, "Failed to save search matches");
            first_err.get_or_insert(e);
        }

        let completed = {
            let mut active = self.active.write();
            active.get_mut(id).map(|search| {
                search.complete(outcome.total_matches);
                search.clone()
            })
        };
        if let Some(search) = completed {
            if let Err(e) = self.store.save_search(&search) {
                warn!(error = %e, "Failed to save search");
                first_err.get_or_insert(e);
            }
        }
        self.active.write().remove(id);

        let elapsed = started.elapsed();
        self.metrics.record_search(elapsed);
        self.metrics.set_search_queue(self.queue.len());
        info!(
            packages = outcome.summary.total,
            matches = outcome.total_matches,
            capped = outcome.capped,
            elapsed_ms = elapsed.as_millis() as u64,
            "Search completed"
        );

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Live view of an active search, or the persisted one once completed.
    pub fn status(&self, id: &str) -> Result<SearchView> {
        if let Some(search) = self.active.read().get(id) {
            return Ok(search.view(self.queue.pos(id)));
        }
        self.store
            .load_search(id)?
            .map(|search| search.view(-1))
            .ok_or_else(|| WpdirError::SearchNotFound { id: id.to_string() })
    }

    /// Summary of a completed search; empty while it is still running.
    pub fn summary(&self, id: &str) -> Result<Summary> {
        if let Some(summary) = self.store.load_summary(id)? {
            return Ok(summary);
        }
        if self.active.read().contains_key(id) {
            return Ok(Summary::default());
        }
        Err(WpdirError::SearchNotFound { id: id.to_string() })
    }

    /// Matches of a completed search; empty while it is still running.
    pub fn matches(&self, id: &str) -> Result<Matches> {
        if let Some(matches) = self.store.load_matches(id)? {
            return Ok(matches);
        }
        if self.active.read().contains_key(id) {
            return Ok(Matches::default());
        }
        Err(WpdirError::SearchNotFound { id: id.to_string() })
    }

    /// Matches of one package within a completed search.
    pub fn package_matches(&self, id: &str, slug: &str) -> Result<Vec<Match>> {
        Ok(self.matches(id)?.for_slug(slug).to_vec())
    }

    /// Latest public searches, newest first.
    pub fn latest_public(&self, limit: usize) -> Result<Vec<SearchView>> {
        Ok(self
            .store
            .latest_public(limit)?
            .into_iter()
            .map(|search| search.view(-1))
            .collect())
    }

    /// Delete every persisted search.
    pub fn clear_history(&self) -> Result<()> {
        self.store.clear_searches()?;
        info!("Search history cleared");
        Ok(())
    }

    /// Number of queued and running searches.
    pub fn len(&self) -> usize {
        self.active.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queue_position(&self, id: &str) -> i64 {
        self.queue.pos(id)
    }

    /// Spawn the search worker.
    pub fn start(self: &Arc<Self>) -> Result<SearchWorker> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let manager = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("wpdir-search".to_string())
            .spawn(move || {
                while let Some(id) = manager.queue.get_until(&shutdown_rx) {
                    manager.run_search(&id);
                }
                let mut drained = 0;
                while let Some(id) = manager.queue.try_get() {
                    manager.run_search(&id);
                    drained += 1;
                }
                debug!(drained, "Search worker stopped");
            })?;
        Ok(SearchWorker {
            thread: Some(thread),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Refuse new searches. Searches already accepted still run.
    ///
    /// Returns once no caller is between the acceptance check and the
    /// queue, so the worker's final drain sees every accepted id.
    pub fn shutdown(&self) {
        let _intake = self.intake.write();
        self.accepting.store(false, Ordering::Release);
    }

    fn run_search(&self, id: &str) {
        if let Err(e) = self.process_search(id) {
            warn!(id = %id, error = %e, "Search failed");
        }
    }

    fn corpus(&self, kind: CorpusKind) -> Result<&Arc<dyn Corpus>> {
        self.corpora
            .get(&kind)
            .ok_or_else(|| WpdirError::UnknownCorpus {
                name: kind.to_string(),
            })
    }
}

/// Handle of the search worker thread. Dropping it stops the worker.
pub struct SearchWorker {
    thread: Option<JoinHandle<()>>,
    shutdown_tx: Option<Sender<()>>,
}

impl SearchWorker {
    /// Finish the running search and everything still queued, then join.
    pub fn stop(&mut self) {
        self.shutdown_tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SearchWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{CorpusSnapshot, CorpusSummary};
    use crate::engine::IndexHandle;
    use crate::package::PackageRecord;
    use crate::search::{SearchOptions, SearchStatus};
    use crate::searcher::tests::{DestroyLog, FakeHandle};
    use crate::types::{PackageStatus, Revision};
    use std::time::Duration;

    /// Fixed set of records behind the corpus capability.
    struct FixedCorpus {
        records: Vec<Arc<PackageRecord>>,
    }

    impl Corpus for FixedCorpus {
        fn kind(&self) -> CorpusKind {
            CorpusKind::Plugins
        }
        fn len(&self) -> usize {
            self.records.len()
        }
        fn exists(&self, slug: &str) -> bool {
            self.get(slug).is_some()
        }
        fn get(&self, slug: &str) -> Option<Arc<PackageRecord>> {
            self.records.iter().find(|r| r.slug() == slug).cloned()
        }
        fn add(&self, _slug: &str) -> Result<Arc<PackageRecord>> {
            unimplemented!()
        }
        fn revision(&self) -> Revision {
            9
        }
        fn set_revision(&self, _revision: Revision) -> bool {
            false
        }
        fn set_status(&self, _slug: &str, _status: PackageStatus) -> Result<()> {
            Ok(())
        }
        fn queue_update(&self, _slug: &str, _revision: Revision) -> Result<()> {
            Ok(())
        }
        fn update_index(&self, _handle: Box<dyn IndexHandle>) -> Result<()> {
            Ok(())
        }
        fn summary(&self) -> CorpusSummary {
            unimplemented!()
        }
        fn snapshot(&self) -> CorpusSnapshot {
            CorpusSnapshot {
                corpus: CorpusKind::Plugins,
                revision: 9,
                records: self.records.clone(),
            }
        }
    }

    fn manager(hits: &[(&str, usize)]) -> (Arc<SearchManager>, DestroyLog) {
        let log = DestroyLog::default();
        let records = hits
            .iter()
            .map(|(slug, n)| {
                let record = Arc::new(PackageRecord::new(*slug));
                record
                    .install(FakeHandle::boxed(slug, &format!("/idx/{}", slug), *n, &log))
                    .unwrap();
                record
            })
            .collect();
        let corpus: Arc<dyn Corpus> = Arc::new(FixedCorpus { records });
        let manager = SearchManager::new(
            [corpus],
            ResultStore::in_memory(),
            &SearchConfig::default(),
            Arc::new(Metrics::new()),
        );
        (Arc::new(manager), log)
    }

    #[test]
    fn test_new_search_validates() {
        let (manager, _log) = manager(&[]);
        assert!(matches!(
            manager.new_search(SearchRequest::new("", CorpusKind::Plugins)),
            Err(WpdirError::InvalidPattern { .. })
        ));
        assert!(matches!(
            manager.new_search(SearchRequest::new("ok", CorpusKind::Themes)),
            Err(WpdirError::UnknownCorpus { .. })
        ));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_queued_search_reports_position() {
        let (manager, _log) = manager(&[("a", 1)]);
        let first = manager.new_search(SearchRequest::new("x", CorpusKind::Plugins)).unwrap();
        let second = manager.new_search(SearchRequest::new("y", CorpusKind::Plugins)).unwrap();
        assert_ne!(first, second);

        let view = manager.status(&second).unwrap();
        assert_eq!(view.status, SearchStatus::Queued);
        assert_eq!(view.queue_position, 2);
        assert_eq!(manager.len(), 2);
        assert!(manager.summary(&first).unwrap().list.is_empty());
    }

    #[test]
    fn test_process_search_persists_and_releases() {
        let (manager, _log) = manager(&[("a", 0), ("b", 2)]);
        let options = SearchOptions {
            lines_of_context: 50,
            ..Default::default()
        };
        let id = manager
            .new_search(SearchRequest::new("needle", CorpusKind::Plugins).with_options(options))
            .unwrap();
        let queued = manager.queue.get().unwrap();
        assert_eq!(queued, id);

        manager.process_search(&id).unwrap();
        assert!(manager.is_empty());

        let view = manager.status(&id).unwrap();
        assert_eq!(view.status, SearchStatus::Completed);
        assert_eq!(view.matches, 2);
        assert_eq!(view.progress, 100);
        assert_eq!(view.queue_position, -1);

        let summary = manager.summary(&id).unwrap();
        assert_eq!(summary.total, 1);
        assert!(summary.get("b").is_some());
        assert_eq!(manager.package_matches(&id, "b").unwrap().len(), 2);
        assert!(manager.package_matches(&id, "a").unwrap().is_empty());

        let latest = manager.latest_public(5).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, id);
        assert_eq!(manager.metrics.snapshot().searches, 1);

        manager.clear_history().unwrap();
        assert!(matches!(
            manager.status(&id),
            Err(WpdirError::SearchNotFound { .. })
        ));
    }

    #[test]
    fn test_private_search_not_listed() {
        let (manager, _log) = manager(&[("a", 1)]);
        let id = manager
            .new_search(SearchRequest::new("needle", CorpusKind::Plugins).private(true))
            .unwrap();
        manager.queue.get();
        manager.process_search(&id).unwrap();
        assert!(manager.latest_public(5).unwrap().is_empty());
        assert_eq!(manager.status(&id).unwrap().status, SearchStatus::Completed);
    }

    #[test]
    fn test_worker_runs_queued_searches() {
        let (manager, _log) = manager(&[("a", 1), ("b", 1)]);
        let mut worker = manager.start().unwrap();
        let id = manager
            .new_search(SearchRequest::new("needle", CorpusKind::Plugins))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if matches!(manager.status(&id), Ok(v) if v.status == SearchStatus::Completed) {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        manager.shutdown();
        worker.stop();

        assert_eq!(manager.summary(&id).unwrap().total, 2);
        assert!(matches!(
            manager.new_search(SearchRequest::new("again", CorpusKind::Plugins)),
            Err(WpdirError::ShuttingDown)
        ));
    }

    #[test]
    fn test_stop_drains_accepted_searches() {
        let (manager, _log) = manager(&[("a", 1)]);
        let ids: Vec<String> = (0..5)
            .map(|i| {
                manager
                    .new_search(SearchRequest::new(format!("needle{}", i), CorpusKind::Plugins))
                    .unwrap()
            })
            .collect();
        manager.shutdown();

        let mut worker = manager.start().unwrap();
        worker.stop();

        assert!(manager.is_empty());
        assert_eq!(manager.queue_position(&ids[4]), -1);
        for id in &ids {
            assert_eq!(manager.status(id).unwrap().status, SearchStatus::Completed);
        }
        assert_eq!(manager.metrics.snapshot().searches, 5);
    }

    #[test]
    fn test_unknown_search() {
        let (manager, _log) = manager(&[]);
        assert!(matches!(
            manager.process_search("nope"),
            Err(WpdirError::SearchNotFound { .. })
        ));
        assert!(manager.status("nope").is_err());
        assert!(manager.matches("nope").is_err());
    }
}
