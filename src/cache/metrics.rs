//! Work Cache Metrics Collection
//!
//! Process-lifetime counters for the status endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Counters updated by the resolution engine and the worker pool
#[derive(Debug, Default)]
pub struct WorkMetrics {
    // Inbound (Generate) requests
    in_requests: AtomicU64,
    in_from_cache: AtomicU64,
    in_errors: AtomicU64,

    // Outbound work calls to the node
    out_requests: AtomicU64,
    out_responses: AtomicU64,
    out_errors: AtomicU64,
    out_rejected: AtomicU64,
    out_duration_ms_total: AtomicU64,

    // Pregeneration
    pregen_enqueued: AtomicU64,
    pregen_dropped: AtomicU64,
    pregen_processed: AtomicU64,
}

impl WorkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_in_request(&self) {
        self.in_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_in_from_cache(&self) {
        self.in_from_cache.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_in_error(&self) {
        self.in_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out_request(&self) {
        self.out_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out_response(&self, duration: Duration) {
        self.out_responses.fetch_add(1, Ordering::Relaxed);
        self.out_duration_ms_total
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_out_error(&self) {
        self.out_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out_rejected(&self) {
        self.out_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pregen_enqueued(&self) {
        self.pregen_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pregen_dropped(&self) {
        self.pregen_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pregen_processed(&self) {
        self.pregen_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_requests(&self) -> u64 {
        self.in_requests.load(Ordering::Relaxed)
    }

    pub fn in_from_cache(&self) -> u64 {
        self.in_from_cache.load(Ordering::Relaxed)
    }

    pub fn in_errors(&self) -> u64 {
        self.in_errors.load(Ordering::Relaxed)
    }

    pub fn out_requests(&self) -> u64 {
        self.out_requests.load(Ordering::Relaxed)
    }

    pub fn out_responses(&self) -> u64 {
        self.out_responses.load(Ordering::Relaxed)
    }

    pub fn out_errors(&self) -> u64 {
        self.out_errors.load(Ordering::Relaxed)
    }

    pub fn out_rejected(&self) -> u64 {
        self.out_rejected.load(Ordering::Relaxed)
    }

    pub fn pregen_enqueued(&self) -> u64 {
        self.pregen_enqueued.load(Ordering::Relaxed)
    }

    pub fn pregen_dropped(&self) -> u64 {
        self.pregen_dropped.load(Ordering::Relaxed)
    }

    pub fn pregen_processed(&self) -> u64 {
        self.pregen_processed.load(Ordering::Relaxed)
    }

    /// Fraction of inbound requests answered from cache
    pub fn in_cache_ratio(&self) -> f64 {
        let total = self.in_requests() as f64;
        if total == 0.0 {
            0.0
        } else {
            self.in_from_cache() as f64 / total
        }
    }

    /// Mean duration of successful outbound work calls
    pub fn out_duration_avg_ms(&self) -> f64 {
        let responses = self.out_responses() as f64;
        if responses == 0.0 {
            0.0
        } else {
            self.out_duration_ms_total.load(Ordering::Relaxed) as f64 / responses
        }
    }

    /// Fill the counter part of a status snapshot
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            work_in_req_count: self.in_requests(),
            work_in_req_from_cache: self.in_from_cache(),
            work_in_req_error: self.in_errors(),
            work_in_req_cache_ratio: self.in_cache_ratio(),
            work_out_req_count: self.out_requests(),
            work_out_resp_count: self.out_responses(),
            work_out_error_count: self.out_errors(),
            work_out_rejected_count: self.out_rejected(),
            work_out_dur_avg_ms: self.out_duration_avg_ms(),
            pregen_enqueued: self.pregen_enqueued(),
            pregen_dropped: self.pregen_dropped(),
            pregen_processed: self.pregen_processed(),
            ..StatusSnapshot::default()
        }
    }
}

/// Read-only view for status and metrics endpoints
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub cache_size: usize,
    pub work_in_req_count: u64,
    pub work_in_req_from_cache: u64,
    pub work_in_req_error: u64,
    pub work_in_req_cache_ratio: f64,
    pub work_out_req_count: u64,
    pub work_out_resp_count: u64,
    pub work_out_error_count: u64,
    pub work_out_rejected_count: u64,
    pub work_out_dur_avg_ms: f64,
    pub active_work_out_req_count: usize,
    pub pregen_queue_size: usize,
    pub pregen_enqueued: u64,
    pub pregen_dropped: u64,
    pub pregen_processed: u64,
    /// Current network difficulty, hex
    pub difficulty: String,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratios_with_no_traffic() {
        let metrics = WorkMetrics::new();
        assert_eq!(metrics.in_cache_ratio(), 0.0);
        assert_eq!(metrics.out_duration_avg_ms(), 0.0);
    }

    #[test]
    fn test_cache_ratio() {
        let metrics = WorkMetrics::new();
        for _ in 0..4 {
            metrics.record_in_request();
        }
        metrics.record_in_from_cache();
        assert_eq!(metrics.in_cache_ratio(), 0.25);
    }

    #[test]
    fn test_outbound_average() {
        let metrics = WorkMetrics::new();
        metrics.record_out_response(Duration::from_millis(100));
        metrics.record_out_response(Duration::from_millis(300));
        assert_eq!(metrics.out_duration_avg_ms(), 200.0);
    }

    #[test]
    fn test_snapshot_copies_counters() {
        let metrics = WorkMetrics::new();
        metrics.record_in_request();
        metrics.record_in_error();
        metrics.record_out_request();
        metrics.record_pregen_dropped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.work_in_req_count, 1);
        assert_eq!(snapshot.work_in_req_error, 1);
        assert_eq!(snapshot.work_out_req_count, 1);
        assert_eq!(snapshot.pregen_dropped, 1);
        assert_eq!(snapshot.cache_size, 0);
    }
}
