//! Runs one search across every Open package of a corpus snapshot.
//!
//! Dispatch walks the snapshot on the calling thread. Each Open package is
//! searched on its own scoped thread once a slot is free; slots come from a
//! bounded channel used as a counting semaphore. Results land in concurrent
//! maps and are returned as a [`SweepOutcome`] after the scope joins.
//!
//! The match total is reserved atomically before a package's lines are
//! kept, so the total never exceeds the cap. Once the cap is hit no further
//! package is dispatched.

use crate::config::SearchConfig;
use crate::corpus::CorpusSnapshot;
use crate::engine::IndexSearchOptions;
use crate::package::PackageRecord;
use crate::search::{progress_percent, truncate_line, Match, Matches, PackageResult, Summary};
use crate::types::Revision;
use crossbeam_channel::{bounded, Receiver};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use tracing::{debug, trace};

/// Aggregated result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub summary: Summary,
    pub matches: Matches,
    /// Matching lines kept, never above the cap
    pub total_matches: u64,
    pub revision: Revision,
    /// Packages visited by dispatch, Open or not
    pub processed: usize,
    /// Packages actually searched
    pub searched: usize,
    /// Searches that returned an error
    pub failed: usize,
    /// Dispatch stopped because the cap was reached
    pub capped: bool,
}

#[derive(Debug, Clone)]
pub struct FanOutExecutor {
    workers: usize,
    match_cap: u64,
    line_display_len: usize,
}

/// Shared state of the tasks of one sweep.
struct SweepState<'a> {
    pattern: &'a str,
    opts: &'a IndexSearchOptions,
    match_cap: u64,
    line_display_len: usize,
    total: AtomicU64,
    searched: AtomicUsize,
    failed: AtomicUsize,
    summary: DashMap<String, PackageResult>,
    matches: DashMap<String, Vec<Match>>,
}

/// Returns its slot to the semaphore when dropped.
struct Slot<'a>(&'a Receiver<()>);

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        let _ = self.0.recv();
    }
}

impl FanOutExecutor {
    pub fn new(workers: usize, match_cap: u64, line_display_len: usize) -> Self {
        FanOutExecutor {
            workers: workers.max(1),
            match_cap,
            line_display_len,
        }
    }

    pub fn from_config(config: &SearchConfig) -> Self {
        Self::new(config.workers, config.match_cap, config.line_display_len)
    }

    pub fn match_cap(&self) -> u64 {
        self.match_cap
    }

    /// Search every Open record of `snapshot`.
    ///
    /// `progress` is called on the dispatch thread after each visited record
    /// with the percentage visited and the running match total.
    pub fn sweep<F>(
        &self,
        snapshot: &CorpusSnapshot,
        pattern: &str,
        opts: &IndexSearchOptions,
        mut progress: F,
    ) -> SweepOutcome
    where
        F: FnMut(u8, u64),
    {
        let state = SweepState {
            pattern,
            opts,
            match_cap: self.match_cap,
            line_display_len: self.line_display_len,
            total: AtomicU64::new(0),
            searched: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            summary: DashMap::new(),
            matches: DashMap::new(),
        };
        let (slot_tx, slot_rx) = bounded::<()>(self.workers);
        let count = snapshot.len() as u64;
        let mut processed = 0usize;
        let mut capped = false;

        thread::scope(|scope| {
            let state = &state;
            let slot_rx = &slot_rx;
            for record in &snapshot.records {
                if state.total.load(Ordering::Acquire) >= state.match_cap {
                    capped = true;
                    break;
                }
                processed += 1;
                progress(
                    progress_percent(processed as u64, count),
                    state.total.load(Ordering::Acquire),
                );
                if !record.is_open() {
                    continue;
                }
                // blocks while every slot is taken
                if slot_tx.send(()).is_err() {
                    break;
                }
                scope.spawn(move || {
                    let _slot = Slot(slot_rx);
                    state.search_package(record);
                });
            }
        });

        let total_matches = state.total.load(Ordering::Acquire);
        let summary = Summary {
            total: state.summary.len() as u64,
            list: state.summary.into_iter().collect(),
        };
        let matches = Matches {
            list: state.matches.into_iter().collect(),
        };
        debug!(
            corpus = %snapshot.corpus,
            processed,
            packages = summary.total,
            total_matches,
            capped,
            "Sweep finished"
        );
        SweepOutcome {
            summary,
            matches,
            total_matches,
            revision: snapshot.revision,
            processed,
            searched: state.searched.into_inner(),
            failed: state.failed.into_inner(),
            capped,
        }
    }
}

impl SweepState<'_> {
    fn search_package(&self, record: &PackageRecord) {
        // held for the whole task so the generation cannot be swapped out
        let package = record.read();
        let Some(searcher) = package.searcher().filter(|_| package.is_open()) else {
            return;
        };
        self.searched.fetch_add(1, Ordering::Relaxed);

        let response = match searcher.search(self.pattern, self.opts) {
            Ok(response) => response,
            Err(e) => {
                trace!(slug = %record.slug(), error = %e, "Package search failed");
                self.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let mut lines: Vec<Match> = response
            .matches
            .iter()
            .flat_map(|file| {
                file.matches.iter().map(|line| Match {
                    slug: record.slug().to_string(),
                    file: file.filename.clone(),
                    line_num: line.line_number,
                    line_text: truncate_line(&line.line, self.line_display_len),
                })
            })
            .collect();
        if lines.is_empty() {
            return;
        }

        let Some(granted) = self.reserve(lines.len() as u64) else {
            return;
        };
        lines.truncate(granted as usize);

        let slug = record.slug().to_string();
        self.summary.insert(
            slug.clone(),
            PackageResult {
                slug: slug.clone(),
                name: package.meta.name.clone(),
                version: package.meta.version.clone(),
                homepage: package.meta.homepage.clone(),
                installs: package.meta.active_installs,
                matches: granted,
            },
        );
        self.matches.insert(slug, lines);
    }

    /// Claim up to `want` matches from what is left under the cap.
    fn reserve(&self, want: u64) -> Option<u64> {
        let cap = self.match_cap;
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < cap).then(|| current + want.min(cap - current))
            })
            .ok()
            .map(|previous| want.min(cap - previous))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::searcher::tests::{DestroyLog, FakeHandle};
    use crate::types::{CorpusKind, PackageMeta};
    use std::sync::Arc;

    fn record(slug: &str, hits: usize, log: &DestroyLog) -> Arc<PackageRecord> {
        let record = Arc::new(PackageRecord::new(slug));
        record.set_meta(PackageMeta {
            name: slug.to_uppercase(),
            version: "2.0".to_string(),
            active_installs: 1000,
            ..Default::default()
        });
        record
            .install(FakeHandle::boxed(slug, &format!("/idx/{}", slug), hits, log))
            .unwrap();
        record
    }

    fn snapshot(records: Vec<Arc<PackageRecord>>) -> CorpusSnapshot {
        CorpusSnapshot {
            corpus: CorpusKind::Plugins,
            revision: 42,
            records,
        }
    }

    #[test]
    fn test_only_matching_packages_are_reported() {
        let log = DestroyLog::default();
        let closed = Arc::new(PackageRecord::new("closed"));
        let snap = snapshot(vec![
            record("a", 0, &log),
            record("b", 3, &log),
            record("c", 0, &log),
            closed,
        ]);

        let executor = FanOutExecutor::new(2, 100, 100);
        let mut updates = Vec::new();
        let outcome = executor.sweep(&snap, "needle", &IndexSearchOptions::default(), |p, m| {
            updates.push((p, m))
        });

        assert_eq!(outcome.summary.total, 1);
        assert_eq!(outcome.summary.get("b").unwrap().matches, 3);
        assert_eq!(outcome.summary.get("b").unwrap().name, "B");
        assert_eq!(outcome.matches.list.len(), 1);
        assert_eq!(outcome.matches.for_slug("b").len(), 3);
        assert_eq!(outcome.total_matches, 3);
        assert_eq!(outcome.revision, 42);
        assert_eq!(outcome.processed, 4);
        assert_eq!(outcome.searched, 3);
        assert!(!outcome.capped);
        assert_eq!(updates.len(), 4);
        assert_eq!(updates.last().unwrap().0, 100);
    }

    #[test]
    fn test_match_cap_is_never_exceeded() {
        let log = DestroyLog::default();
        let records = (0..20).map(|i| record(&format!("p{}", i), 7, &log)).collect();
        let snap = snapshot(records);

        let executor = FanOutExecutor::new(4, 30, 100);
        let outcome = executor.sweep(&snap, "needle", &IndexSearchOptions::default(), |_, m| {
            assert!(m <= 30)
        });

        assert_eq!(outcome.total_matches, 30);
        assert_eq!(outcome.matches.total(), 30);
        let reported: u64 = outcome.summary.list.values().map(|r| r.matches).sum();
        assert_eq!(reported, 30);
        for lines in outcome.matches.list.values() {
            assert!(!lines.is_empty() && lines.len() <= 7);
        }
    }

    #[test]
    fn test_line_text_is_truncated() {
        let log = DestroyLog::default();
        let snap = snapshot(vec![record("long", 1, &log)]);

        let executor = FanOutExecutor::new(1, 100, 3);
        let outcome = executor.sweep(&snap, "needle", &IndexSearchOptions::default(), |_, _| {});
        assert_eq!(outcome.matches.for_slug("long")[0].line_text, "nee");
    }

    #[test]
    fn test_empty_snapshot() {
        let executor = FanOutExecutor::new(3, 10, 100);
        let outcome = executor.sweep(&snapshot(vec![]), "x", &IndexSearchOptions::default(), |_, _| {
            panic!("no records to report")
        });
        assert_eq!(outcome.summary.total, 0);
        assert_eq!(outcome.processed, 0);
    }
}
