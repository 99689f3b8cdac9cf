//! Wiring of the full mirror: both corpora, the shared update queue, the
//! worker pool, the pollers and the search manager.

use crate::config::Config;
use crate::corpus::Corpus;
use crate::engine::IndexEngine;
use crate::error::{Result, WpdirError};
use crate::manager::{SearchManager, SearchWorker};
use crate::metrics::Metrics;
use crate::poller::{ChangelogPoller, PollerHandle};
use crate::registry::{LoadReport, Registry};
use crate::store::ResultStore;
use crate::types::CorpusKind;
use crate::update_queue::UpdateQueue;
use crate::updater::{UpdateWorkerPool, Updater};
use crate::upstream::{ArchiveSource, MetadataSource, Upstream};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// External services the pipeline runs against.
#[derive(Clone)]
pub struct Collaborators {
    pub engine: Arc<dyn IndexEngine>,
    pub upstream: Arc<dyn Upstream>,
    pub metadata: Arc<dyn MetadataSource>,
    pub archives: Arc<dyn ArchiveSource>,
}

#[derive(Default)]
struct Running {
    pool: Option<UpdateWorkerPool>,
    pollers: Vec<PollerHandle>,
    sweeps: Vec<JoinHandle<()>>,
    search_worker: Option<SearchWorker>,
}

pub struct Pipeline {
    config: Config,
    store: ResultStore,
    queue: Arc<UpdateQueue>,
    registries: Vec<Arc<Registry>>,
    updater: Arc<Updater>,
    pollers: Vec<Arc<ChangelogPoller>>,
    search: Arc<SearchManager>,
    metrics: Arc<Metrics>,
    running: Mutex<Running>,
}

impl Pipeline {
    /// Build the pipeline over the directory store in `config`'s data dir.
    ///
    /// Failing to open the store is the only fatal startup error.
    pub fn open(config: Config, collaborators: Collaborators) -> Result<Self> {
        let store = ResultStore::open_dir(config.db_dir()?)?;
        Self::new(config, collaborators, store)
    }

    pub fn new(config: Config, collaborators: Collaborators, store: ResultStore) -> Result<Self> {
        config.validate()?;
        let index_dir = config.index_dir()?;
        let metrics = Arc::new(Metrics::new());
        let queue = Arc::new(UpdateQueue::new(config.update.queue_capacity));

        let registries: Vec<Arc<Registry>> = CorpusKind::ALL
            .iter()
            .map(|&kind| {
                Arc::new(Registry::new(
                    kind,
                    Arc::clone(&queue),
                    store.clone(),
                    Arc::clone(&collaborators.engine),
                    &index_dir,
                ))
            })
            .collect();

        let updater = Arc::new(Updater::new(
            registries.iter().cloned(),
            Arc::clone(&collaborators.metadata),
            Arc::clone(&collaborators.archives),
            config.update.metadata_retry(),
            Arc::clone(&metrics),
        ));

        let pollers = registries
            .iter()
            .map(|registry| {
                Arc::new(ChangelogPoller::new(
                    Arc::clone(registry),
                    Arc::clone(&collaborators.upstream),
                    Arc::clone(&updater),
                ))
            })
            .collect();

        let corpora = registries
            .iter()
            .map(|registry| Arc::clone(registry) as Arc<dyn Corpus>);
        let search = Arc::new(SearchManager::new(
            corpora,
            store.clone(),
            &config.search,
            Arc::clone(&metrics),
        ));

        Ok(Pipeline {
            config,
            store,
            queue,
            registries,
            updater,
            pollers,
            search,
            metrics,
            running: Mutex::new(Running::default()),
        })
    }

    /// Rehydrate both corpora from the store and the index directory.
    pub fn load_existing(&self) -> Result<Vec<LoadReport>> {
        self.registries
            .iter()
            .map(|registry| registry.load_existing())
            .collect()
    }

    /// Start update workers, the initial sweeps, pollers and the search
    /// worker. `fresh` forces every listed package to be rebuilt.
    pub fn start(&self, fresh: bool) -> Result<()> {
        let mut running = self.running.lock();
        if running.pool.is_some() {
            return Ok(());
        }

        running.pool = Some(UpdateWorkerPool::start(
            self.config.update.workers,
            Arc::clone(&self.queue),
            Arc::clone(&self.updater),
        )?);

        for poller in &self.pollers {
            let kind = poller.registry().kind();
            let sweeper = Arc::clone(poller);
            let sweep = thread::Builder::new()
                .name(format!("wpdir-sweep-{}", kind))
                .spawn(move || {
                    if let Err(e) = sweeper.initial_sweep(fresh) {
                        warn!(corpus = %kind, error = %e, "Initial sweep failed");
                    }
                })?;
            running.sweeps.push(sweep);
            running.pollers.push(poller.spawn(
                self.config.update.changelog_interval(),
                self.config.update.refresh_interval(),
            )?);
        }

        running.search_worker = Some(self.search.start()?);
        info!(
            update_workers = self.config.update.workers,
            search_workers = self.config.search.workers,
            fresh,
            "Pipeline started"
        );
        Ok(())
    }

    /// Stop accepting work and let in-flight work drain.
    pub fn shutdown(&self) {
        let mut running = self.running.lock();
        self.search.shutdown();
        self.queue.close();

        for mut poller in running.pollers.drain(..) {
            poller.stop();
        }
        for sweep in running.sweeps.drain(..) {
            let _ = sweep.join();
        }
        if let Some(mut pool) = running.pool.take() {
            pool.shutdown();
        }
        if let Some(mut worker) = running.search_worker.take() {
            worker.stop();
        }
        info!("Pipeline stopped");
    }

    pub fn registry(&self, kind: CorpusKind) -> Result<&Arc<Registry>> {
        self.registries
            .iter()
            .find(|registry| registry.kind() == kind)
            .ok_or_else(|| WpdirError::UnknownCorpus {
                name: kind.to_string(),
            })
    }

    pub fn search(&self) -> &Arc<SearchManager> {
        &self.search
    }

    pub fn updater(&self) -> &Arc<Updater> {
        &self.updater
    }

    pub fn poller(&self, kind: CorpusKind) -> Option<&Arc<ChangelogPoller>> {
        self.pollers
            .iter()
            .find(|poller| poller.registry().kind() == kind)
    }

    pub fn queue(&self) -> &Arc<UpdateQueue> {
        &self.queue
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.running.get_mut().pool.is_some() {
            self.shutdown();
        }
    }
}
