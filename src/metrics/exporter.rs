//! Prometheus Exporter
//!
//! Mirrors a [`StatusSnapshot`] into a private Prometheus registry at scrape
//! time.

use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};

use crate::cache::StatusSnapshot;
use crate::error::{Error, Result};

/// Prometheus view of the work cache
pub struct WorkCacheExporter {
    registry: Registry,

    cache_size: IntGauge,
    active_out_requests: IntGauge,
    pregen_queue_size: IntGauge,
    cache_ratio: Gauge,
    out_duration_avg_ms: Gauge,
    uptime_secs: IntGauge,

    in_requests: IntCounter,
    in_from_cache: IntCounter,
    in_errors: IntCounter,
    out_requests: IntCounter,
    out_responses: IntCounter,
    out_errors: IntCounter,
    out_rejected: IntCounter,
    pregen_enqueued: IntCounter,
    pregen_dropped: IntCounter,
    pregen_processed: IntCounter,
}

fn register<C>(registry: &Registry, collector: C) -> Result<C>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| Error::Internal(format!("Failed to register metric: {}", e)))?;
    Ok(collector)
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let gauge = IntGauge::new(name, help)
        .map_err(|e| Error::Internal(format!("Invalid metric {}: {}", name, e)))?;
    register(registry, gauge)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge> {
    let gauge = Gauge::new(name, help)
        .map_err(|e| Error::Internal(format!("Invalid metric {}: {}", name, e)))?;
    register(registry, gauge)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::new(name, help)
        .map_err(|e| Error::Internal(format!("Invalid metric {}: {}", name, e)))?;
    register(registry, counter)
}

/// Advance a counter to `value`; never moves backwards
fn advance(counter: &IntCounter, value: u64) {
    counter.inc_by(value.saturating_sub(counter.get()));
}

impl WorkCacheExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let r = &registry;

        Ok(Self {
            cache_size: int_gauge(r, "work_cache_entries", "Entries in the work cache")?,
            active_out_requests: int_gauge(
                r,
                "work_cache_active_out_requests",
                "Work requests to the node currently in flight",
            )?,
            pregen_queue_size: int_gauge(
                r,
                "work_cache_pregen_queue_size",
                "Requests waiting in the pregeneration queue",
            )?,
            cache_ratio: gauge(
                r,
                "work_cache_in_cache_ratio",
                "Fraction of work requests answered from cache",
            )?,
            out_duration_avg_ms: gauge(
                r,
                "work_cache_out_duration_avg_ms",
                "Mean duration of successful node work requests",
            )?,
            uptime_secs: int_gauge(r, "work_cache_uptime_seconds", "Seconds since start")?,
            in_requests: counter(r, "work_cache_in_requests_total", "Inbound work requests")?,
            in_from_cache: counter(
                r,
                "work_cache_in_from_cache_total",
                "Inbound work requests answered from cache",
            )?,
            in_errors: counter(
                r,
                "work_cache_in_errors_total",
                "Inbound work requests that failed",
            )?,
            out_requests: counter(
                r,
                "work_cache_out_requests_total",
                "Work requests sent to the node",
            )?,
            out_responses: counter(
                r,
                "work_cache_out_responses_total",
                "Successful work responses from the node",
            )?,
            out_errors: counter(
                r,
                "work_cache_out_errors_total",
                "Failed work requests to the node",
            )?,
            out_rejected: counter(
                r,
                "work_cache_out_rejected_total",
                "Work requests rejected by the outstanding cap",
            )?,
            pregen_enqueued: counter(
                r,
                "work_cache_pregen_enqueued_total",
                "Pregeneration requests queued",
            )?,
            pregen_dropped: counter(
                r,
                "work_cache_pregen_dropped_total",
                "Pregeneration requests dropped on a full queue",
            )?,
            pregen_processed: counter(
                r,
                "work_cache_pregen_processed_total",
                "Pregeneration requests handled by workers",
            )?,
            registry,
        })
    }

    /// Copy a snapshot into the registry
    pub fn update(&self, status: &StatusSnapshot) {
        self.cache_size.set(status.cache_size as i64);
        self.active_out_requests.set(status.active_work_out_req_count as i64);
        self.pregen_queue_size.set(status.pregen_queue_size as i64);
        self.cache_ratio.set(status.work_in_req_cache_ratio);
        self.out_duration_avg_ms.set(status.work_out_dur_avg_ms);
        self.uptime_secs.set(status.uptime_secs as i64);

        advance(&self.in_requests, status.work_in_req_count);
        advance(&self.in_from_cache, status.work_in_req_from_cache);
        advance(&self.in_errors, status.work_in_req_error);
        advance(&self.out_requests, status.work_out_req_count);
        advance(&self.out_responses, status.work_out_resp_count);
        advance(&self.out_errors, status.work_out_error_count);
        advance(&self.out_rejected, status.work_out_rejected_count);
        advance(&self.pregen_enqueued, status.pregen_enqueued);
        advance(&self.pregen_dropped, status.pregen_dropped);
        advance(&self.pregen_processed, status.pregen_processed);
    }

    /// Text exposition format; returns the content type and body
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

impl std::fmt::Debug for WorkCacheExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkCacheExporter").finish_non_exhaustive()
    }
}
