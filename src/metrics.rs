// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the recommendation cache.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host service is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `reco_cache_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: read, populate, evict, flush, cleanup, warm_up, view
//! - `outcome`: hit, miss, error, ok, queued, requeued, dead

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// READ PATH
// ═══════════════════════════════════════════════════════════════════════════

/// Record a recommendation lookup against the cache
pub fn record_cache_read(outcome: &str) {
    counter!(
        "reco_cache_reads_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a read served by the store of record
pub fn record_fallback_read(success: bool) {
    let status = if success { "ok" } else { "error" };
    counter!(
        "reco_cache_fallback_reads_total",
        "status" => status
    )
    .increment(1);
}

/// Record ids dropped during hydration (absent or incomplete records)
pub fn record_hydration_skips(count: usize) {
    if count > 0 {
        counter!("reco_cache_hydration_skips_total").increment(count as u64);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// WRITE PATH
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cache backend failure that was absorbed
pub fn record_error(operation: &str, error_type: &str) {
    counter!(
        "reco_cache_errors_total",
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a buffered view
pub fn record_view(buffered: bool) {
    let path = if buffered { "buffer" } else { "direct" };
    counter!(
        "reco_cache_views_total",
        "path" => path
    )
    .increment(1);
}

/// Record an eviction outcome (ok, queued, lost)
pub fn record_eviction(outcome: &str) {
    counter!(
        "reco_cache_evictions_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// WORKERS
// ═══════════════════════════════════════════════════════════════════════════

/// Record a committed flush batch
pub fn record_flush(videos: usize, views: u64, duration: Duration) {
    counter!("reco_cache_flush_batches_total").increment(1);
    counter!("reco_cache_flushed_videos_total").increment(videos as u64);
    counter!("reco_cache_flushed_views_total").increment(views);
    histogram!("reco_cache_flush_seconds").record(duration.as_secs_f64());
}

/// Record a flush that left its snapshot in place
pub fn record_flush_failure(stage: &str) {
    counter!(
        "reco_cache_flush_failures_total",
        "stage" => stage.to_string()
    )
    .increment(1);
}

/// Record flush batch ids dropped from the store's ledger
pub fn record_flush_batches_pruned(count: u64) {
    counter!("reco_cache_flush_batches_pruned_total").increment(count);
}

/// Record a cleanup job outcome (ok, requeued, dead, malformed)
pub fn record_cleanup_job(outcome: &str) {
    counter!(
        "reco_cache_cleanup_jobs_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set the observed retry queue length
pub fn set_retry_queue_len(len: u64) {
    gauge!("reco_cache_retry_queue_len").set(len as f64);
}

/// Record a warm-up run
pub fn record_warm_up(tags: usize, videos: usize, duration: Duration) {
    gauge!("reco_cache_warm_up_tags").set(tags as f64);
    gauge!("reco_cache_warm_up_videos").set(videos as f64);
    histogram!("reco_cache_warm_up_seconds").record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "reco_cache_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Track service state transitions
pub fn set_service_state(state: &str) {
    counter!(
        "reco_cache_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "reco_cache_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Records its lifetime as operation latency when dropped.
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(operation: &'static str) -> Self {
        Self { operation, start: Instant::now() }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder these only verify the calls don't panic.

    #[test]
    fn test_read_path_metrics() {
        record_cache_read("hit");
        record_cache_read("miss");
        record_fallback_read(true);
        record_hydration_skips(0);
        record_hydration_skips(3);
    }

    #[test]
    fn test_worker_metrics() {
        record_flush(2, 9, Duration::from_millis(4));
        record_flush_failure("apply");
        record_cleanup_job("requeued");
        set_retry_queue_len(12);
        record_warm_up(40, 1_200, Duration::from_secs(2));
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("read");
            std::thread::sleep(Duration::from_micros(10));
        }
    }
}
