//! Work Cache Engine
//!
//! Ties the store, the resolver, the pregeneration pool and housekeeping
//! together behind [`WorkCache`].
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                             WorkCache                               │
//! │  generate ──────────────┐          pregenerate_by_hash / _account   │
//! │                         ▼                        │                  │
//! │                   WorkResolver ◀── workers ◀── PregenQueue          │
//! │                   │          │                                      │
//! │          DifficultyOracle   WorkStore ◀── Housekeeper ──▶ file      │
//! │                   │          │                                      │
//! │                   └──▶ WorkUpstream (node) ◀──┘                     │
//! └────────────────────────────────────────────────────────────────────┘
//! ```

mod difficulty;
mod housekeeping;
mod pregen;
mod resolver;

pub use difficulty::{DifficultyConfig, DifficultyOracle, DEFAULT_DIFFICULTY};
pub use housekeeping::{save_blocking, Housekeeper, HousekeepingConfig, TickOutcome};
pub use pregen::{PregenConfig, PregenQueue};
pub use resolver::{
    AdmissionLimiter, AdmissionPermit, FailurePolicy, ResolverConfig, WorkResolver, WorkResponse,
    WorkSource,
};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{CachePersistence, StatusSnapshot, WorkMetrics, WorkStore};
use crate::domain::{Difficulty, WorkRequest, WorkUpstream};
use crate::error::{Error, Result};

/// Configuration for the whole engine
#[derive(Debug, Clone, Default)]
pub struct WorkCacheConfig {
    /// Cache file; `None` disables persistence
    pub persist_path: Option<PathBuf>,

    /// Resolution settings
    pub resolver: ResolverConfig,

    /// Pregeneration settings
    pub pregen: PregenConfig,

    /// Sweep and save settings
    pub housekeeping: HousekeepingConfig,

    /// Network difficulty cache settings
    pub difficulty: DifficultyConfig,
}

impl WorkCacheConfig {
    pub fn new(worker_count: usize, max_outstanding: usize, max_cache_age_days: u64) -> Self {
        let mut config = Self::default();
        config.pregen.worker_count = worker_count;
        config.resolver.max_outstanding = max_outstanding;
        config.housekeeping.max_cache_age_days = max_cache_age_days;
        config
    }

    pub fn with_persist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.resolver.max_outstanding == 0 {
            return Err(Error::Config("max outstanding must be at least 1".to_string()));
        }
        if self.resolver.wait_max_attempts == 0 {
            return Err(Error::Config("wait attempts must be at least 1".to_string()));
        }
        if self.pregen.capacity == 0 {
            return Err(Error::Config("queue capacity must be at least 1".to_string()));
        }
        if self.housekeeping.interval.is_zero() {
            return Err(Error::Config("housekeeping interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// The work cache service
pub struct WorkCache {
    config: WorkCacheConfig,
    store: Arc<WorkStore>,
    metrics: Arc<WorkMetrics>,
    persistence: CachePersistence,
    oracle: Arc<DifficultyOracle>,
    resolver: Arc<WorkResolver>,
    upstream: Arc<dyn WorkUpstream>,
    queue: PregenQueue,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl WorkCache {
    /// Build the engine without loading state or starting background tasks
    pub fn new(config: WorkCacheConfig, upstream: Arc<dyn WorkUpstream>) -> Result<Arc<Self>> {
        config.validate()?;

        let store = Arc::new(WorkStore::new());
        let metrics = Arc::new(WorkMetrics::new());
        let oracle = Arc::new(DifficultyOracle::new(
            config.difficulty.clone(),
            upstream.clone(),
        ));
        let resolver = Arc::new(WorkResolver::new(
            config.resolver.clone(),
            store.clone(),
            upstream.clone(),
            oracle.clone(),
            metrics.clone(),
        ));
        let queue = PregenQueue::new(config.pregen.capacity, metrics.clone())?;

        Ok(Arc::new(Self {
            persistence: CachePersistence::new(config.persist_path.clone()),
            config,
            store,
            metrics,
            oracle,
            resolver,
            upstream,
            queue,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        }))
    }

    /// Build, load the cache file, and start workers and housekeeping
    pub async fn start(
        config: WorkCacheConfig,
        upstream: Arc<dyn WorkUpstream>,
    ) -> Result<Arc<Self>> {
        let cache = Self::new(config, upstream)?;

        if cache.persistence.is_enabled() {
            let persistence = cache.persistence.clone();
            let store = cache.store.clone();
            let loaded = tokio::task::spawn_blocking(move || persistence.load(&store))
                .await
                .map_err(|e| Error::Internal(format!("load task failed: {}", e)))?;
            match loaded {
                Ok(count) => info!(count, "Work cache loaded"),
                Err(e) => warn!("Starting with an empty work cache: {}", e),
            }
        }

        cache.spawn_background();
        info!(
            workers = cache.config.pregen.worker_count,
            max_outstanding = cache.config.resolver.max_outstanding,
            max_cache_age_days = cache.config.housekeeping.max_cache_age_days,
            "Work cache started"
        );
        Ok(cache)
    }

    fn spawn_background(&self) {
        let mut tasks = self.tasks.lock();
        tasks.extend(self.queue.spawn_workers(
            &self.config.pregen,
            self.resolver.clone(),
            self.shutdown.clone(),
        ));

        let housekeeper = Housekeeper::new(
            self.config.housekeeping.clone(),
            self.store.clone(),
            self.persistence.clone(),
        );
        tasks.push(tokio::spawn(housekeeper.run(self.shutdown.clone())));
    }

    /// Foreground work request
    pub async fn generate(
        &self,
        hash: &str,
        difficulty: Difficulty,
        account: Option<&str>,
    ) -> Result<WorkResponse> {
        self.resolver.generate(hash, difficulty, account).await
    }

    /// Queue background work for `hash` unless it is already cached or
    /// being computed. Returns whether a request was enqueued.
    #[instrument(skip(self, account))]
    pub fn pregenerate_by_hash(&self, hash: &str, account: Option<&str>) -> bool {
        if hash.is_empty() {
            return false;
        }
        if self.resolver.is_resolved_or_pending(hash) {
            debug!(hash, "Already cached, not queueing");
            return false;
        }
        self.queue.push(WorkRequest::by_hash(
            hash,
            Difficulty::UNSPECIFIED,
            account.map(str::to_string),
        ))
    }

    /// Queue background work for the frontier of `account`.
    ///
    /// If the frontier cannot be looked up now, the unresolved account request
    /// is queued and a worker retries the lookup.
    #[instrument(skip(self))]
    pub async fn pregenerate_by_account(&self, account: &str) -> bool {
        if account.is_empty() {
            return false;
        }
        match self.resolver.frontier(account).await {
            Ok(hash) => self.pregenerate_by_hash(&hash, Some(account)),
            Err(e) => {
                debug!("Queueing account request unresolved: {}", e);
                self.queue.push(WorkRequest::by_account(account))
            }
        }
    }

    /// Resolve a request the way a worker would, without queueing it
    pub async fn get_cached_work_by_account_or_hash(
        &self,
        request: &WorkRequest,
    ) -> Result<WorkResponse> {
        self.resolver.get_cached_work_by_account_or_hash(request).await
    }

    /// Relay a raw request body to the node
    pub async fn passthrough(&self, body: &str) -> Result<String> {
        self.upstream.passthrough(body).await
    }

    /// Current counters and gauges
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            cache_size: self.store.len(),
            active_work_out_req_count: self.resolver.outstanding(),
            pregen_queue_size: self.queue.len(),
            difficulty: self.oracle.cached().to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            ..self.metrics.snapshot()
        }
    }

    pub fn store(&self) -> &Arc<WorkStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<WorkMetrics> {
        &self.metrics
    }

    pub fn queue(&self) -> &PregenQueue {
        &self.queue
    }

    pub fn config(&self) -> &WorkCacheConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop background tasks and write a final save
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down work cache");
        self.shutdown.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Background task failed: {}", e);
            }
        }

        if self.persistence.is_enabled() {
            let written = save_blocking(self.persistence.clone(), self.store.clone()).await?;
            info!(written, "Final work cache save");
        }
        Ok(())
    }
}

impl std::fmt::Debug for WorkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkCache")
            .field("config", &self.config)
            .field("entries", &self.store.len())
            .field("queue", &self.queue)
            .finish()
    }
}
