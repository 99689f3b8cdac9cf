//! Upstream change detection for one corpus.
//!
//! Two periodic tasks run per corpus: the changelog check turns upstream
//! commits into update requests, and the much slower metadata refresh
//! walks the full listing. [`ChangelogPoller::initial_sweep`] seeds an empty
//! or fresh mirror at startup.

use crate::corpus::Corpus;
use crate::error::{Result, WpdirError};
use crate::registry::Registry;
use crate::types::{ChangelogEntry, Revision};
use crate::updater::Updater;
use crate::upstream::Upstream;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TryRecvError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Counts from a listing walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListingReport {
    pub listed: usize,
    pub skipped: usize,
    pub added: usize,
    pub queued: usize,
    pub failed: usize,
}

pub struct ChangelogPoller {
    registry: Arc<Registry>,
    upstream: Arc<dyn Upstream>,
    updater: Arc<Updater>,
}

impl ChangelogPoller {
    pub fn new(registry: Arc<Registry>, upstream: Arc<dyn Upstream>, updater: Arc<Updater>) -> Self {
        ChangelogPoller {
            registry,
            upstream,
            updater,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Enqueue one update per slug changed since the registry revision.
    ///
    /// Skipped while the update queue still holds work. Returns the number
    /// of requests enqueued.
    #[instrument(skip(self), fields(corpus = %self.registry.kind()))]
    pub fn check_changelog(&self) -> Result<usize> {
        let kind = self.registry.kind();
        if !self.registry.queue().is_empty() {
            debug!(queued = self.registry.queue().len(), "Update queue busy, skipping changelog");
            return Ok(0);
        }

        let latest = self
            .upstream
            .latest_revision(kind)
            .map_err(|e| WpdirError::upstream("latest revision", format!("{:#}", e)))?;
        let current = self.registry.revision();
        if latest <= current {
            debug!(current, latest, "No new revisions");
            return Ok(0);
        }

        let entries = self
            .upstream
            .changelog(kind, current, latest)
            .map_err(|e| WpdirError::upstream("changelog", format!("{:#}", e)))?;
        if entries.is_empty() {
            // nothing touched the corpus in (current, latest]
            self.registry.advance_revision(latest)?;
            debug!(current, latest, "Empty changelog");
            return Ok(0);
        }

        let updates = dedupe_changelog(entries);
        let mut queued = 0;
        for entry in &updates {
            if !is_valid_slug(&entry.slug) {
                warn!(slug = ?entry.slug, "Skipping invalid slug in changelog");
                continue;
            }
            self.registry.queue_update(&entry.slug, entry.revision)?;
            queued += 1;
        }
        info!(queued, from = current, to = latest, "Changelog updates queued");
        Ok(queued)
    }

    /// Refresh metadata of every listed package, adding unseen ones.
    pub fn refresh_all(&self) -> Result<ListingReport> {
        self.refresh_listing(None)
    }

    /// Register the full listing and, for a fresh mirror, queue everything.
    ///
    /// A full load happens when `fresh` is set or the registry has never
    /// recorded a revision; every slug is queued at the latest upstream
    /// revision.
    #[instrument(skip(self), fields(corpus = %self.registry.kind()))]
    pub fn initial_sweep(&self, fresh: bool) -> Result<ListingReport> {
        let kind = self.registry.kind();
        let slugs = self
            .upstream
            .list(kind)
            .map_err(|e| WpdirError::upstream("listing", format!("{:#}", e)))?;
        let latest = self
            .upstream
            .latest_revision(kind)
            .map_err(|e| WpdirError::upstream("latest revision", format!("{:#}", e)))?;
        let full_load = fresh || self.registry.revision() == 0;

        let mut report = ListingReport {
            listed: slugs.len(),
            ..Default::default()
        };
        for slug in &slugs {
            if !is_valid_slug(slug) {
                warn!(slug = ?slug, "Skipping invalid slug in listing");
                report.skipped += 1;
                continue;
            }
            if !self.registry.exists(slug) {
                self.registry.add(slug)?;
                report.added += 1;
            }
            if full_load {
                self.registry.queue_update(slug, latest)?;
                report.queued += 1;
            }
        }
        info!(
            listed = report.listed,
            added = report.added,
            queued = report.queued,
            full_load,
            "Initial sweep done"
        );
        Ok(report)
    }

    fn refresh_listing(&self, cancel: Option<&Receiver<()>>) -> Result<ListingReport> {
        let kind = self.registry.kind();
        let slugs = self
            .upstream
            .list(kind)
            .map_err(|e| WpdirError::upstream("listing", format!("{:#}", e)))?;

        let mut report = ListingReport {
            listed: slugs.len(),
            ..Default::default()
        };
        for slug in &slugs {
            if cancel.is_some_and(is_cancelled) {
                info!(corpus = %kind, "Metadata refresh interrupted");
                break;
            }
            if !is_valid_slug(slug) {
                report.skipped += 1;
                continue;
            }
            if !self.registry.exists(slug) {
                report.added += 1;
            }
            if let Err(e) = self.updater.refresh_metadata(kind, slug) {
                debug!(corpus = %kind, slug = %slug, error = %e, "Metadata refresh failed");
                report.failed += 1;
            }
        }
        info!(
            corpus = %kind,
            listed = report.listed,
            added = report.added,
            failed = report.failed,
            "Metadata refresh done"
        );
        Ok(report)
    }

    /// Start the changelog and metadata refresh tickers.
    pub fn spawn(
        self: &Arc<Self>,
        changelog_every: Duration,
        refresh_every: Duration,
    ) -> Result<PollerHandle> {
        let kind = self.registry.kind();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let changelog = {
            let poller = Arc::clone(self);
            let shutdown_rx = shutdown_rx.clone();
            thread::Builder::new()
                .name(format!("wpdir-changelog-{}", kind))
                .spawn(move || {
                    let ticker = tick(changelog_every);
                    loop {
                        select! {
                            recv(shutdown_rx) -> _ => break,
                            recv(ticker) -> _ => {
                                if let Err(e) = poller.check_changelog() {
                                    warn!(corpus = %kind, error = %e, "Changelog check failed");
                                }
                            }
                        }
                    }
                })?
        };

        let refresh = {
            let poller = Arc::clone(self);
            thread::Builder::new()
                .name(format!("wpdir-refresh-{}", kind))
                .spawn(move || {
                    let ticker = tick(refresh_every);
                    loop {
                        select! {
                            recv(shutdown_rx) -> _ => break,
                            recv(ticker) -> _ => {
                                if let Err(e) = poller.refresh_listing(Some(&shutdown_rx)) {
                                    warn!(corpus = %kind, error = %e, "Metadata refresh failed");
                                }
                            }
                        }
                    }
                })?
        };

        debug!(corpus = %kind, ?changelog_every, ?refresh_every, "Pollers started");
        Ok(PollerHandle {
            threads: vec![changelog, refresh],
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

/// Running poller threads. Dropping the handle stops them.
pub struct PollerHandle {
    threads: Vec<JoinHandle<()>>,
    shutdown_tx: Option<Sender<()>>,
}

impl PollerHandle {
    /// Signal both tickers and wait for the current pass to finish.
    pub fn stop(&mut self) {
        self.shutdown_tx.take();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_cancelled(rx: &Receiver<()>) -> bool {
    !matches!(rx.try_recv(), Err(TryRecvError::Empty))
}

/// Slugs must be non-blank and free of control characters.
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.trim().is_empty() && !slug.chars().any(char::is_control)
}

/// One entry per slug, carrying the most recent revision, in slug order.
pub fn dedupe_changelog(entries: impl IntoIterator<Item = ChangelogEntry>) -> Vec<ChangelogEntry> {
    let mut latest: BTreeMap<String, Revision> = BTreeMap::new();
    for entry in entries {
        let revision = latest.entry(entry.slug).or_insert(entry.revision);
        *revision = (*revision).max(entry.revision);
    }
    latest
        .into_iter()
        .map(|(slug, revision)| ChangelogEntry::new(slug, revision))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::BundleEngine;
    use crate::metrics::Metrics;
    use crate::retry::RetryPolicy;
    use crate::store::ResultStore;
    use crate::types::{CorpusKind, PackageStatus};
    use crate::update_queue::UpdateQueue;
    use crate::updater::tests::{ScriptedArchives, ScriptedMetadata};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Upstream with a fixed latest revision, changelog and listing.
    #[derive(Default)]
    pub(crate) struct ScriptedUpstream {
        pub latest: Mutex<Revision>,
        pub log: Mutex<Vec<ChangelogEntry>>,
        pub listing: Mutex<Vec<String>>,
        pub changelog_calls: Mutex<Vec<(Revision, Revision)>>,
    }

    impl Upstream for ScriptedUpstream {
        fn latest_revision(&self, _corpus: CorpusKind) -> anyhow::Result<Revision> {
            Ok(*self.latest.lock())
        }

        fn changelog(&self, _corpus: CorpusKind, from: Revision, to: Revision) -> anyhow::Result<Vec<ChangelogEntry>> {
            self.changelog_calls.lock().push((from, to));
            Ok(self
                .log
                .lock()
                .iter()
                .filter(|e| e.revision > from && e.revision <= to)
                .cloned()
                .collect())
        }

        fn list(&self, _corpus: CorpusKind) -> anyhow::Result<Vec<String>> {
            Ok(self.listing.lock().clone())
        }
    }

    struct Fixture {
        _temp: TempDir,
        registry: Arc<Registry>,
        queue: Arc<UpdateQueue>,
        upstream: Arc<ScriptedUpstream>,
        metadata: Arc<ScriptedMetadata>,
        poller: Arc<ChangelogPoller>,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let queue = Arc::new(UpdateQueue::new(64));
        let registry = Arc::new(Registry::new(
            CorpusKind::Plugins,
            Arc::clone(&queue),
            ResultStore::in_memory(),
            Arc::new(BundleEngine::new()),
            temp.path().join("index"),
        ));
        let metadata = Arc::new(ScriptedMetadata::default());
        let updater = Arc::new(Updater::new(
            [Arc::clone(&registry)],
            metadata.clone(),
            Arc::new(ScriptedArchives::default()),
            RetryPolicy::new(1, Duration::ZERO, Duration::from_secs(1)),
            Arc::new(Metrics::new()),
        ));
        let upstream = Arc::new(ScriptedUpstream::default());
        let poller = Arc::new(ChangelogPoller::new(
            Arc::clone(&registry),
            upstream.clone(),
            updater,
        ));
        Fixture {
            _temp: temp,
            registry,
            queue,
            upstream,
            metadata,
            poller,
        }
    }

    fn drain(queue: &UpdateQueue) -> Vec<(String, Revision)> {
        std::iter::from_fn(|| queue.try_recv())
            .map(|r| (r.slug, r.revision))
            .collect()
    }

    #[test]
    fn test_dedupe_keeps_latest_revision() {
        let deduped = dedupe_changelog(vec![
            ChangelogEntry::new("x", 101),
            ChangelogEntry::new("y", 102),
            ChangelogEntry::new("x", 104),
            ChangelogEntry::new("x", 103),
        ]);
        assert_eq!(
            deduped,
            vec![ChangelogEntry::new("x", 104), ChangelogEntry::new("y", 102)]
        );
    }

    #[test]
    fn test_changelog_queues_one_request_per_slug() {
        let fx = fixture();
        fx.registry.set_revision(100);
        *fx.upstream.latest.lock() = 105;
        *fx.upstream.log.lock() = vec![
            ChangelogEntry::new("x", 101),
            ChangelogEntry::new("x", 104),
            ChangelogEntry::new("  ", 102),
            ChangelogEntry::new("old", 99),
        ];

        assert_eq!(fx.poller.check_changelog().unwrap(), 1);
        assert_eq!(*fx.upstream.changelog_calls.lock(), vec![(100, 105)]);
        assert_eq!(drain(&fx.queue), vec![("x".to_string(), 104)]);
        // the worker advances the revision, not the poller
        assert_eq!(fx.registry.revision(), 100);
    }

    #[test]
    fn test_changelog_skips_when_busy_or_current() {
        let fx = fixture();
        fx.registry.set_revision(100);
        *fx.upstream.latest.lock() = 100;
        assert_eq!(fx.poller.check_changelog().unwrap(), 0);
        assert!(fx.upstream.changelog_calls.lock().is_empty());

        *fx.upstream.latest.lock() = 110;
        fx.registry.queue_update("pending", 1).unwrap();
        assert_eq!(fx.poller.check_changelog().unwrap(), 0);
        assert!(fx.upstream.changelog_calls.lock().is_empty());
    }

    #[test]
    fn test_empty_changelog_advances_revision() {
        let fx = fixture();
        fx.registry.set_revision(100);
        *fx.upstream.latest.lock() = 103;
        assert_eq!(fx.poller.check_changelog().unwrap(), 0);
        assert_eq!(fx.registry.revision(), 103);
        assert_eq!(
            fx.registry.store().load_revision(CorpusKind::Plugins).unwrap(),
            Some(103)
        );
    }

    #[test]
    fn test_initial_sweep() {
        let fx = fixture();
        *fx.upstream.latest.lock() = 500;
        *fx.upstream.listing.lock() = vec!["a".to_string(), "b".to_string(), "".to_string()];

        let report = fx.poller.initial_sweep(false).unwrap();
        assert_eq!(report.listed, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.added, 2);
        assert_eq!(report.queued, 2);
        assert_eq!(
            drain(&fx.queue),
            vec![("a".to_string(), 500), ("b".to_string(), 500)]
        );

        // a mirror with history only registers new slugs
        fx.registry.set_revision(400);
        fx.upstream.listing.lock().push("c".to_string());
        let report = fx.poller.initial_sweep(false).unwrap();
        assert_eq!(report.added, 1);
        assert_eq!(report.queued, 0);
        assert!(fx.queue.is_empty());

        let report = fx.poller.initial_sweep(true).unwrap();
        assert_eq!(report.queued, 3);
    }

    #[test]
    fn test_refresh_all_closes_failures() {
        let fx = fixture();
        *fx.upstream.listing.lock() = vec!["good".to_string(), "bad".to_string()];
        fx.metadata.failing.lock().push("bad".to_string());

        let report = fx.poller.refresh_all().unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(fx.registry.get("good").unwrap().meta().name, "GOOD");
        assert_eq!(fx.registry.get("bad").unwrap().status(), PackageStatus::Closed);
        assert!(fx.queue.is_empty());
    }

    #[test]
    fn test_spawned_poller_ticks_and_stops() {
        let fx = fixture();
        fx.registry.set_revision(1);
        *fx.upstream.latest.lock() = 2;
        *fx.upstream.log.lock() = vec![ChangelogEntry::new("ticked", 2)];

        let mut handle = fx
            .poller
            .spawn(Duration::from_millis(10), Duration::from_secs(3600))
            .unwrap();
        let request = fx.queue.recv_timeout(Duration::from_secs(5));
        handle.stop();
        assert_eq!(request.map(|r| r.slug), Some("ticked".to_string()));
    }
}
