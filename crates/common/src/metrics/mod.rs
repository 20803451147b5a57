//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with SLO-aligned histograms
//! and standardized naming conventions.

use metrics::{counter, describe_counter, describe_histogram, gauge, describe_gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all Keystone metrics
pub const METRICS_PREFIX: &str = "keystone";

/// SLO-aligned histogram buckets for retrieval latency (in seconds)
/// Targets: P50 < 500ms, P99 < 3s (rerank dominates)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.010,  // 10ms
    0.025,  // 25ms
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms - P50 target
    1.000,  // 1s
    2.000,  // 2s
    3.000,  // 3s - P99 target
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Retrieval metrics
    describe_counter!(
        format!("{}_retrievals_total", METRICS_PREFIX),
        Unit::Count,
        "Total retrieval requests by outcome"
    );

    describe_histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end retrieval latency in seconds"
    );

    describe_gauge!(
        format!("{}_retrieval_results_count", METRICS_PREFIX),
        Unit::Count,
        "Number of chunks returned by the last retrieval"
    );

    describe_histogram!(
        format!("{}_stage_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Per-stage retrieval latency in seconds"
    );

    // Upstream metrics
    describe_counter!(
        format!("{}_search_calls_total", METRICS_PREFIX),
        Unit::Count,
        "Search index calls by modality and status"
    );

    describe_counter!(
        format!("{}_rerank_fallbacks_total", METRICS_PREFIX),
        Unit::Count,
        "Relevance judgments replaced by the neutral fallback"
    );

    // Access control metrics
    describe_counter!(
        format!("{}_acl_decisions_total", METRICS_PREFIX),
        Unit::Count,
        "ACL predicate constructions by strategy"
    );

    describe_counter!(
        format!("{}_acl_groups_truncated_total", METRICS_PREFIX),
        Unit::Count,
        "Groups left out of fallback ACL predicates"
    );

    // Cache metrics
    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache hits"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache misses"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Helper to record a completed retrieval
pub fn record_retrieval(duration_secs: f64, intent: &str, result_count: usize, outcome: &str) {
    counter!(
        format!("{}_retrievals_total", METRICS_PREFIX),
        "intent" => intent.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        "intent" => intent.to_string()
    )
    .record(duration_secs);

    gauge!(
        format!("{}_retrieval_results_count", METRICS_PREFIX),
        "intent" => intent.to_string()
    )
    .set(result_count as f64);
}

/// Helper to record a single pipeline stage
pub fn record_stage(stage: &str, duration_secs: f64) {
    histogram!(
        format!("{}_stage_duration_seconds", METRICS_PREFIX),
        "stage" => stage.to_string()
    )
    .record(duration_secs);
}

/// Helper to record one search index call
pub fn record_search_call(modality: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_search_calls_total", METRICS_PREFIX),
        "modality" => modality.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Helper to record a reranker fallback
pub fn record_rerank_fallback(judgment: &str) {
    counter!(
        format!("{}_rerank_fallbacks_total", METRICS_PREFIX),
        "judgment" => judgment.to_string()
    )
    .increment(1);
}

/// Helper to record an ACL predicate decision
pub fn record_acl_strategy(strategy: &str, groups_truncated: usize) {
    counter!(
        format!("{}_acl_decisions_total", METRICS_PREFIX),
        "strategy" => strategy.to_string()
    )
    .increment(1);

    if groups_truncated > 0 {
        counter!(format!("{}_acl_groups_truncated_total", METRICS_PREFIX))
            .increment(groups_truncated as u64);
    }
}

/// Helper to record cache metrics
pub fn record_cache(hit: bool, cache_name: &str) {
    if hit {
        counter!(
            format!("{}_cache_hits_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    } else {
        counter!(
            format!("{}_cache_misses_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_buckets() {
        // Verify buckets are sorted and contain SLO targets
        let mut prev = 0.0;
        for &bucket in LATENCY_BUCKETS {
            assert!(bucket > prev);
            prev = bucket;
        }

        assert!(LATENCY_BUCKETS.contains(&0.500));
        assert!(LATENCY_BUCKETS.contains(&3.000));
    }

    #[test]
    fn test_helpers_without_recorder() {
        // No recorder installed: every helper must be a no-op
        record_retrieval(0.12, "definition", 4, "ok");
        record_stage("fuse", 0.001);
        record_search_call("vector", false);
        record_acl_strategy("fallback", 372);
        record_cache(true, "identity");
    }
}
