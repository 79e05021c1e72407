//! Pregeneration Queue and Worker Pool
//!
//! Bounded FIFO of speculative work requests. Producers never block: a full
//! queue drops the request. A fixed set of workers share the receiving end
//! and resolve each request through the same path as foreground traffic.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::resolver::WorkResolver;
use crate::cache::WorkMetrics;
use crate::domain::WorkRequest;
use crate::error::{Error, Result};

/// Configuration for the pregeneration pool
#[derive(Debug, Clone)]
pub struct PregenConfig {
    /// Queue capacity; requests beyond it are dropped
    pub capacity: usize,

    /// Number of workers
    pub worker_count: usize,

    /// How long a worker waits for a request before re-checking shutdown
    pub idle_timeout: Duration,
}

impl Default for PregenConfig {
    fn default() -> Self {
        Self {
            capacity: 5000,
            worker_count: 4,
            idle_timeout: Duration::from_secs(20),
        }
    }
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<WorkRequest>>>;

/// Non-blocking producer side plus the shared consumer end
pub struct PregenQueue {
    sender: mpsc::Sender<WorkRequest>,
    receiver: SharedReceiver,
    metrics: Arc<WorkMetrics>,
}

impl PregenQueue {
    pub fn new(capacity: usize, metrics: Arc<WorkMetrics>) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config(
                "pregeneration queue capacity must be at least 1".to_string(),
            ));
        }
        let (sender, receiver) = mpsc::channel(capacity);
        Ok(Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            metrics,
        })
    }

    /// Enqueue without waiting; returns `false` if the request was dropped
    pub fn push(&self, request: WorkRequest) -> bool {
        match self.sender.try_send(request) {
            Ok(()) => {
                self.metrics.record_pregen_enqueued();
                true
            }
            Err(TrySendError::Full(request)) => {
                warn!(
                    hash = ?request.hash,
                    account = ?request.account,
                    capacity = self.capacity(),
                    "Pregeneration queue full, dropping request"
                );
                self.metrics.record_pregen_dropped();
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Pregeneration queue closed, dropping request");
                self.metrics.record_pregen_dropped();
                false
            }
        }
    }

    /// Requests currently waiting
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    /// Start `config.worker_count` workers draining this queue
    pub fn spawn_workers(
        &self,
        config: &PregenConfig,
        resolver: Arc<WorkResolver>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        info!(workers = config.worker_count, "Starting pregeneration workers");
        (0..config.worker_count)
            .map(|id| {
                let worker = PregenWorker {
                    id,
                    receiver: self.receiver.clone(),
                    resolver: resolver.clone(),
                    metrics: self.metrics.clone(),
                    idle_timeout: config.idle_timeout,
                };
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect()
    }
}

impl std::fmt::Debug for PregenQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PregenQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

struct PregenWorker {
    id: usize,
    receiver: SharedReceiver,
    resolver: Arc<WorkResolver>,
    metrics: Arc<WorkMetrics>,
    idle_timeout: Duration,
}

impl PregenWorker {
    async fn run(self, shutdown: CancellationToken) {
        debug!(worker = self.id, "Pregeneration worker started");

        loop {
            let next = {
                let mut receiver = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    receiver = self.receiver.lock() => receiver,
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = timeout(self.idle_timeout, receiver.recv()) => next,
                }
            };

            let request = match next {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(_) => {
                    trace!(worker = self.id, "Pregeneration worker idle");
                    continue;
                }
            };

            // A job in flight runs to completion even during shutdown
            let result = self.resolver.get_cached_work_by_account_or_hash(&request).await;
            self.metrics.record_pregen_processed();
            match result {
                Ok(response) => debug!(
                    worker = self.id,
                    hash = %response.hash,
                    source = %response.source,
                    "Pregenerated work"
                ),
                Err(e) => warn!(worker = self.id, "Pregeneration failed: {}", e),
            }
        }

        debug!(worker = self.id, "Pregeneration worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryUpstream;
    use crate::cache::WorkStore;
    use crate::domain::Difficulty;
    use crate::engine::difficulty::{DifficultyConfig, DifficultyOracle};
    use crate::engine::resolver::ResolverConfig;

    fn resolver(store: Arc<WorkStore>, upstream: Arc<InMemoryUpstream>) -> Arc<WorkResolver> {
        let oracle = Arc::new(DifficultyOracle::new(
            DifficultyConfig::default(),
            upstream.clone(),
        ));
        Arc::new(WorkResolver::new(
            ResolverConfig::default(),
            store,
            upstream,
            oracle,
            Arc::new(WorkMetrics::new()),
        ))
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(PregenQueue::new(0, Arc::new(WorkMetrics::new())).is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let metrics = Arc::new(WorkMetrics::new());
        let queue = PregenQueue::new(2, metrics.clone()).unwrap();

        assert!(queue.push(WorkRequest::by_hash("A", Difficulty::UNSPECIFIED, None)));
        assert!(queue.push(WorkRequest::by_hash("B", Difficulty::UNSPECIFIED, None)));
        assert!(!queue.push(WorkRequest::by_hash("C", Difficulty::UNSPECIFIED, None)));

        assert_eq!(queue.len(), 2);
        assert_eq!(metrics.pregen_enqueued(), 2);
        assert_eq!(metrics.pregen_dropped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_drain_queue() {
        let metrics = Arc::new(WorkMetrics::new());
        let queue = PregenQueue::new(16, metrics.clone()).unwrap();
        let store = Arc::new(WorkStore::new());
        let upstream = Arc::new(InMemoryUpstream::new());
        let shutdown = CancellationToken::new();

        for hash in ["A", "B", "C"] {
            queue.push(WorkRequest::by_hash(hash, Difficulty::UNSPECIFIED, None));
        }
        let config = PregenConfig {
            worker_count: 2,
            ..Default::default()
        };
        let handles = queue.spawn_workers(
            &config,
            resolver(store.clone(), upstream.clone()),
            shutdown.clone(),
        );

        while metrics.pregen_processed() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queue.is_empty());
        assert_eq!(upstream.work_calls(), 3);
        assert!(store.get("B").unwrap().is_valid());

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_workers_stop_on_shutdown() {
        let queue = PregenQueue::new(4, Arc::new(WorkMetrics::new())).unwrap();
        let shutdown = CancellationToken::new();
        let handles = queue.spawn_workers(
            &PregenConfig::default(),
            resolver(Arc::new(WorkStore::new()), Arc::new(InMemoryUpstream::new())),
            shutdown.clone(),
        );

        // Past a few idle timeouts
        tokio::time::sleep(Duration::from_secs(45)).await;
        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
