//! Work Resolver
//!
//! Decides, per request, whether to answer from cache, wait for another
//! request already computing the same hash, or call the node.
//!
//! # Decision Flow
//!
//! ```text
//!            ┌────────────── probe store ──────────────┐
//!            │             │              │            │
//!          miss       computing     valid, stale    valid, ok
//!       corrupt work       │        (too easy)         │
//!            │        poll ≤ N×T          │         FromCache
//!            │        ok ─▶ FromCache     │
//!            │        timeout ─▶ Err      │
//!            ▼                            ▼
//!    admission (outstanding < max) ── else ─▶ Overloaded
//!            │
//!    claim placeholder ─▶ node.compute_work ─▶ store valid ─▶ Fresh
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use super::difficulty::DifficultyOracle;
use crate::cache::{is_valid_work_value, unix_now, CacheEntry, WorkMetrics, WorkStore};
use crate::domain::{Difficulty, RequestInput, WorkRequest, WorkUpstream};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// What to do with the `computing` placeholder when the node call fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Keep the placeholder; the hash stays in progress until evicted
    #[default]
    LeaveComputing,
    /// Remove the placeholder so a later request can retry
    Rollback,
}

/// Configuration for the resolver
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Maximum concurrent work calls to the node
    pub max_outstanding: usize,

    /// Interval between store polls while another request computes
    pub wait_poll_interval: Duration,

    /// Number of polls before giving up
    pub wait_max_attempts: u32,

    /// Placeholder handling on node failure
    pub failure_policy: FailurePolicy,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 8,
            wait_poll_interval: Duration::from_millis(250),
            wait_max_attempts: 100,
            failure_policy: FailurePolicy::LeaveComputing,
        }
    }
}

impl ResolverConfig {
    /// Upper bound on the in-progress wait
    pub fn max_wait(&self) -> Duration {
        self.wait_poll_interval * self.wait_max_attempts
    }
}

// =============================================================================
// Response
// =============================================================================

/// Where a work response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkSource {
    Fresh,
    FromCache,
}

impl std::fmt::Display for WorkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkSource::Fresh => write!(f, "fresh"),
            WorkSource::FromCache => write!(f, "fromcache"),
        }
    }
}

/// Result of a resolution
#[derive(Debug, Clone, PartialEq)]
pub struct WorkResponse {
    pub hash: String,
    pub work: String,
    pub difficulty: Difficulty,
    pub multiplier: f64,
    pub source: WorkSource,
}

impl WorkResponse {
    fn from_entry(entry: &CacheEntry, source: WorkSource) -> Self {
        Self {
            hash: entry.hash.clone(),
            work: entry.work.clone(),
            difficulty: entry.difficulty,
            multiplier: entry.multiplier,
            source,
        }
    }

    pub fn is_from_cache(&self) -> bool {
        self.source == WorkSource::FromCache
    }
}

// =============================================================================
// Admission
// =============================================================================

/// Counts concurrent holders and rejects past the cap
#[derive(Debug)]
pub struct AdmissionLimiter {
    current: AtomicUsize,
    max: usize,
}

/// Released on drop, whatever way the call ends
#[derive(Debug)]
pub struct AdmissionPermit<'a> {
    limiter: &'a AdmissionLimiter,
}

impl AdmissionLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            max,
        }
    }

    pub fn try_acquire(&self) -> Option<AdmissionPermit<'_>> {
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .ok()
            .map(|_| AdmissionPermit { limiter: self })
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.limiter.current.fetch_sub(1, Ordering::AcqRel);
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Outcome of looking a hash up in the store
#[derive(Debug)]
enum Probe {
    Miss,
    InProgress,
    Corrupt,
    Stale(Difficulty),
    Hit(CacheEntry),
}

/// Outcome of an attempt to compute
enum Computed {
    Done(WorkResponse),
    /// Someone else claimed the hash between probe and claim
    Claimed,
}

/// Get-or-compute over the shared store
pub struct WorkResolver {
    config: ResolverConfig,
    store: Arc<WorkStore>,
    upstream: Arc<dyn WorkUpstream>,
    oracle: Arc<DifficultyOracle>,
    metrics: Arc<WorkMetrics>,
    outbound: AdmissionLimiter,
}

impl WorkResolver {
    pub fn new(
        config: ResolverConfig,
        store: Arc<WorkStore>,
        upstream: Arc<dyn WorkUpstream>,
        oracle: Arc<DifficultyOracle>,
        metrics: Arc<WorkMetrics>,
    ) -> Self {
        let outbound = AdmissionLimiter::new(config.max_outstanding);
        Self {
            config,
            store,
            upstream,
            oracle,
            metrics,
            outbound,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Current number of node work calls in flight
    pub fn outstanding(&self) -> usize {
        self.outbound.current()
    }

    /// Foreground resolution; updates inbound counters
    #[instrument(skip(self, account))]
    pub async fn generate(
        &self,
        hash: &str,
        difficulty: Difficulty,
        account: Option<&str>,
    ) -> Result<WorkResponse> {
        self.metrics.record_in_request();
        let result = self.resolve(hash, difficulty, account).await;
        match &result {
            Ok(response) if response.is_from_cache() => self.metrics.record_in_from_cache(),
            Ok(_) => {}
            Err(e) => {
                warn!("Work request for {} failed: {}", hash, e);
                self.metrics.record_in_error();
            }
        }
        result
    }

    /// Resolve a queued request, looking up the frontier for account input
    pub async fn get_cached_work_by_account_or_hash(
        &self,
        request: &WorkRequest,
    ) -> Result<WorkResponse> {
        let hash = match (request.input, request.hash.as_deref()) {
            (_, Some(hash)) => hash.to_string(),
            (RequestInput::ByAccount, None) => {
                let account = request.account.as_deref().ok_or_else(|| {
                    Error::InvalidRequest("account request without account".to_string())
                })?;
                self.frontier(account).await?
            }
            (RequestInput::ByHash, None) => {
                return Err(Error::InvalidRequest("hash request without hash".to_string()))
            }
        };
        self.resolve(&hash, request.difficulty, request.account.as_deref())
            .await
    }

    /// Latest block hash of `account`
    pub async fn frontier(&self, account: &str) -> Result<String> {
        let hash = self
            .upstream
            .get_frontier(account)
            .await
            .map_err(|e| Error::FrontierUnavailable {
                account: account.to_string(),
                reason: e.to_string(),
            })?;
        debug!(account, frontier = %hash, "Frontier resolved");
        Ok(hash)
    }

    /// Whether `hash` already has, or is getting, work good enough for the
    /// current network difficulty
    pub fn is_resolved_or_pending(&self, hash: &str) -> bool {
        match self.probe(hash, self.oracle.cached()) {
            Probe::Hit(_) | Probe::InProgress => true,
            Probe::Miss | Probe::Corrupt | Probe::Stale(_) => false,
        }
    }

    /// Core get-or-compute
    pub async fn resolve(
        &self,
        hash: &str,
        difficulty: Difficulty,
        account: Option<&str>,
    ) -> Result<WorkResponse> {
        if hash.is_empty() {
            return Err(Error::InvalidRequest("missing hash".to_string()));
        }
        let difficulty = if difficulty.is_unspecified() {
            self.oracle.current().await
        } else {
            difficulty
        };

        loop {
            match self.probe(hash, difficulty) {
                Probe::Hit(entry) => {
                    debug!(hash, "Work served from cache");
                    return Ok(WorkResponse::from_entry(&entry, WorkSource::FromCache));
                }
                Probe::InProgress => {
                    if let Some(response) = self.wait_for_completion(hash, difficulty).await? {
                        return Ok(response);
                    }
                }
                Probe::Corrupt => {
                    warn!(hash, "Cached work value is invalid, recomputing");
                }
                Probe::Stale(cached) => {
                    warn!(
                        hash,
                        cached = %cached,
                        requested = %difficulty,
                        "Cached work is below requested difficulty, recomputing"
                    );
                }
                Probe::Miss => {}
            }

            match self.compute_fresh(hash, difficulty, account).await? {
                Computed::Done(response) => return Ok(response),
                Computed::Claimed => continue,
            }
        }
    }

    fn probe(&self, hash: &str, difficulty: Difficulty) -> Probe {
        match self.store.get(hash) {
            None => Probe::Miss,
            Some(entry) if entry.is_computing() => Probe::InProgress,
            Some(entry) if !is_valid_work_value(&entry.work) => Probe::Corrupt,
            Some(entry) if !entry.is_acceptable(difficulty) => Probe::Stale(entry.difficulty),
            Some(entry) => Probe::Hit(entry),
        }
    }

    /// Poll the store until the in-flight computation lands.
    ///
    /// `Ok(None)` means the entry left the computing state without becoming
    /// usable (rolled back, evicted, or too easy) and the caller should
    /// compute itself.
    async fn wait_for_completion(
        &self,
        hash: &str,
        difficulty: Difficulty,
    ) -> Result<Option<WorkResponse>> {
        debug!(hash, "Work in progress, waiting");
        for _ in 0..self.config.wait_max_attempts {
            sleep(self.config.wait_poll_interval).await;
            match self.probe(hash, difficulty) {
                Probe::InProgress => continue,
                Probe::Hit(entry) => {
                    return Ok(Some(WorkResponse::from_entry(&entry, WorkSource::FromCache)))
                }
                Probe::Miss | Probe::Corrupt | Probe::Stale(_) => return Ok(None),
            }
        }
        Err(Error::InProgressTimeout {
            hash: hash.to_string(),
            waited: self.config.max_wait(),
        })
    }

    async fn compute_fresh(
        &self,
        hash: &str,
        difficulty: Difficulty,
        account: Option<&str>,
    ) -> Result<Computed> {
        let Some(_permit) = self.outbound.try_acquire() else {
            self.metrics.record_out_rejected();
            return Err(Error::Overloaded {
                outstanding: self.outbound.current(),
                max: self.outbound.max(),
            });
        };

        let started = unix_now();
        let account = account.map(str::to_string);
        if !self
            .store
            .begin_computing(CacheEntry::computing(hash, account.clone(), started))
        {
            return Ok(Computed::Claimed);
        }

        self.metrics.record_out_request();
        info!(hash, difficulty = %difficulty, "Requesting work from node");
        let timer = Instant::now();

        let mut work = match self.upstream.compute_work(hash, difficulty).await {
            Ok(work) => work,
            Err(e) => {
                self.on_failure(hash);
                return Err(e);
            }
        };
        if work.hash.is_empty() {
            work.hash = hash.to_string();
        }
        if !is_valid_work_value(&work.work) {
            self.on_failure(hash);
            return Err(Error::InvalidWork {
                hash: hash.to_string(),
                work: work.work,
            });
        }

        let elapsed = timer.elapsed();
        self.metrics.record_out_response(elapsed);
        let entry = CacheEntry::valid(work, account, started, unix_now());
        self.store.put(entry.clone());
        info!(
            hash,
            work = %entry.work,
            difficulty = %entry.difficulty,
            duration_ms = elapsed.as_millis() as u64,
            "Work received from node"
        );

        Ok(Computed::Done(WorkResponse::from_entry(&entry, WorkSource::Fresh)))
    }

    fn on_failure(&self, hash: &str) {
        self.metrics.record_out_error();
        if self.config.failure_policy == FailurePolicy::Rollback
            && self.store.remove_computing(hash)
        {
            debug!(hash, "Rolled back computing placeholder");
        }
    }
}

impl std::fmt::Debug for WorkResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkResolver")
            .field("config", &self.config)
            .field("outstanding", &self.outbound.current())
            .finish()
    }
}
