//! Package update pipeline.
//!
//! [`Updater::process_update`] turns one [`UpdateRequest`] into a fresh,
//! swapped-in index generation. [`UpdateWorkerPool`] runs a fixed number of
//! threads draining the shared [`UpdateQueue`] into it.
//!
//! Every failure is confined to the package it concerns: the record turns
//! Closed, the error is logged with the slug and the request is dropped.

use crate::corpus::Corpus;
use crate::error::{Result, WpdirError};
use crate::metrics::Metrics;
use crate::package::PackageRecord;
use crate::registry::Registry;
use crate::retry::RetryPolicy;
use crate::types::{CorpusKind, PackageMeta, PackageStatus, Revision, UpdateRequest};
use crate::update_queue::UpdateQueue;
use crate::upstream::{ArchiveResponse, ArchiveSource, MetadataSource};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, instrument, warn};

/// What a successful update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A new generation is live at this revision
    Indexed { revision: Revision },
    /// The archive host reported 404; the package is Closed
    Unpublished,
}

pub struct Updater {
    registries: HashMap<CorpusKind, Arc<Registry>>,
    metadata: Arc<dyn MetadataSource>,
    archives: Arc<dyn ArchiveSource>,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl Updater {
    pub fn new(
        registries: impl IntoIterator<Item = Arc<Registry>>,
        metadata: Arc<dyn MetadataSource>,
        archives: Arc<dyn ArchiveSource>,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        let registries = registries
            .into_iter()
            .map(|registry| (registry.kind(), registry))
            .collect();
        Updater {
            registries,
            metadata,
            archives,
            retry,
            metrics,
        }
    }

    pub fn registry(&self, corpus: CorpusKind) -> Result<&Arc<Registry>> {
        self.registries
            .get(&corpus)
            .ok_or_else(|| WpdirError::UnknownCorpus {
                name: corpus.to_string(),
            })
    }

    /// Run one request and record the outcome in the metrics.
    pub fn handle(&self, request: &UpdateRequest) {
        match self.process_update(request) {
            Ok(UpdateOutcome::Indexed { revision }) => {
                self.metrics.record_update_ok();
                info!(corpus = %request.corpus, slug = %request.slug, revision, "Package updated");
            }
            Ok(UpdateOutcome::Unpublished) => {
                self.metrics.record_unpublished();
                info!(corpus = %request.corpus, slug = %request.slug, "Package no longer published");
            }
            Err(e) => {
                self.metrics.record_update_failed();
                warn!(corpus = %request.corpus, slug = %request.slug, error = %e, "Update failed");
            }
        }
    }

    /// Refresh metadata, download, rebuild and swap one package.
    #[instrument(skip(self, request), fields(corpus = %request.corpus, slug = %request.slug))]
    pub fn process_update(&self, request: &UpdateRequest) -> Result<UpdateOutcome> {
        let registry = self.registry(request.corpus)?;
        let slug = request.slug.as_str();
        let record = registry.add(slug)?;

        self.refresh_record(registry, &record)?;

        let archive = match self.archives.fetch_archive(request.corpus, slug) {
            Ok(ArchiveResponse::Found(bytes)) => bytes,
            Ok(ArchiveResponse::NotFound) => {
                // drop the live generation so a restart cannot reopen it
                if let Err(e) = record.close() {
                    warn!(error = %e, "Failed to release unpublished generation");
                }
                self.persist(registry, &record);
                return Ok(UpdateOutcome::Unpublished);
            }
            Ok(ArchiveResponse::Status(status)) => {
                record.set_status(PackageStatus::Closed);
                return Err(WpdirError::ArchiveStatus {
                    slug: slug.to_string(),
                    status,
                });
            }
            Err(e) => {
                record.set_status(PackageStatus::Closed);
                return Err(WpdirError::upstream("archive download", format!("{:#}", e)));
            }
        };

        let dst = registry.generation_dir();
        let engine = registry.engine();
        let built = engine
            .build(&archive, &dst, slug)
            .and_then(|(index, stats)| Ok((engine.open(&index)?, stats)));
        let (handle, stats) = match built {
            Ok(built) => built,
            Err(e) => {
                remove_partial(&dst);
                record.set_status(PackageStatus::Closed);
                return Err(WpdirError::index_build(slug, e));
            }
        };
        debug!(dir = %dst.display(), files = stats.total_files, "Generation built");

        // install() leaves the record Closed on failure
        registry.update_index(handle)?;

        {
            let mut state = record.write();
            state.revision = state.revision.max(request.revision);
            state.stats = Some(stats);
        }
        self.persist(registry, &record);
        if let Err(e) = registry.advance_revision(request.revision) {
            warn!(error = %e, "Failed to persist revision");
        }

        Ok(UpdateOutcome::Indexed {
            revision: request.revision,
        })
    }

    /// Refresh only the metadata of a package, adding it if unseen.
    pub fn refresh_metadata(&self, corpus: CorpusKind, slug: &str) -> Result<()> {
        let registry = self.registry(corpus)?;
        let record = registry.add(slug)?;
        self.refresh_record(registry, &record)?;
        self.persist(registry, &record);
        Ok(())
    }

    fn refresh_record(&self, registry: &Registry, record: &PackageRecord) -> Result<()> {
        let corpus = registry.kind();
        let slug = record.slug();
        let fetched = self.retry.run(|| {
            let bytes = self.metadata.fetch_info(corpus, slug)?;
            Ok(PackageMeta::from_api_json(&bytes)?)
        });
        match fetched {
            Ok(meta) => {
                record.set_meta(meta);
                Ok(())
            }
            Err(e) => {
                record.set_status(PackageStatus::Closed);
                Err(WpdirError::MetadataUnavailable {
                    slug: slug.to_string(),
                    attempts: e.attempts,
                    reason: format!("{:#}", e.last),
                })
            }
        }
    }

    fn persist(&self, registry: &Registry, record: &PackageRecord) {
        if let Err(e) = registry
            .store()
            .save_package(registry.kind(), &record.to_stored())
        {
            warn!(slug = %record.slug(), error = %e, "Failed to persist package");
        }
    }
}

fn remove_partial(dir: &Path) {
    if !dir.exists() {
        return;
    }
    if let Err(e) = fs::remove_dir_all(dir) {
        warn!(dir = %dir.display(), error = %e, "Failed to remove partial index");
    }
}

/// Fixed-size pool of update threads.
///
/// Dropping the pool shuts it down.
pub struct UpdateWorkerPool {
    threads: Vec<JoinHandle<()>>,
    shutdown_tx: Option<Sender<()>>,
    queue: Arc<UpdateQueue>,
}

impl UpdateWorkerPool {
    /// Spawn `workers` threads draining `queue` into `updater`.
    pub fn start(workers: usize, queue: Arc<UpdateQueue>, updater: Arc<Updater>) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let mut threads = Vec::with_capacity(workers);
        for id in 0..workers.max(1) {
            let queue = Arc::clone(&queue);
            let updater = Arc::clone(&updater);
            let shutdown_rx = shutdown_rx.clone();
            let thread = thread::Builder::new()
                .name(format!("wpdir-update-{}", id))
                .spawn(move || worker_loop(id, &queue, &updater, &shutdown_rx))?;
            threads.push(thread);
        }
        info!(workers = threads.len(), "Update workers started");
        Ok(UpdateWorkerPool {
            threads,
            shutdown_tx: Some(shutdown_tx),
            queue,
        })
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Stop accepting requests, let in-flight updates finish and join.
    ///
    /// Requests still queued are left unprocessed.
    pub fn shutdown(&mut self) {
        self.queue.close();
        // dropping the sender wakes every worker
        self.shutdown_tx.take();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        let pending = self.queue.len();
        if pending > 0 {
            info!(pending, "Update workers stopped with queued requests");
        }
    }
}

impl Drop for UpdateWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, queue: &UpdateQueue, updater: &Updater, shutdown_rx: &Receiver<()>) {
    debug!(worker = id, "Update worker running");
    loop {
        select! {
            recv(shutdown_rx) -> _ => break,
            recv(queue.receiver()) -> msg => match msg {
                Ok(request) => updater.handle(&request),
                Err(_) => break,
            },
        }
    }
    debug!(worker = id, "Update worker stopped");
}
