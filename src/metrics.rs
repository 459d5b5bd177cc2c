//! Lightweight in-memory metrics for the fan-out engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Default)]
struct FederationMetrics {
    requests: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timeouts: AtomicU64,
    instances: AtomicU64,
    instance_failures: AtomicU64,
    retries: AtomicU64,
    plan_cache_hits: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_max_ms: AtomicU64,
}

static FEDERATION_METRICS: OnceLock<FederationMetrics> = OnceLock::new();

fn metrics() -> &'static FederationMetrics {
    FEDERATION_METRICS.get_or_init(FederationMetrics::default)
}

pub fn record_request(duration_ms: f64, success: bool) {
    let duration_ms = duration_ms.max(0.0) as u64;
    let metrics = metrics();
    metrics.requests.fetch_add(1, Ordering::Relaxed);
    if !success {
        metrics.failed.fetch_add(1, Ordering::Relaxed);
    }
    metrics
        .duration_total_ms
        .fetch_add(duration_ms, Ordering::Relaxed);
    metrics
        .duration_max_ms
        .fetch_max(duration_ms, Ordering::Relaxed);
}

pub fn record_instances(count: usize) {
    metrics()
        .instances
        .fetch_add(count as u64, Ordering::Relaxed);
}

pub fn record_instance_failure() {
    metrics().instance_failures.fetch_add(1, Ordering::Relaxed);
}

pub fn record_retry() {
    metrics().retries.fetch_add(1, Ordering::Relaxed);
}

pub fn record_plan_cache_hit() {
    metrics().plan_cache_hits.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cancel() {
    metrics().cancelled.fetch_add(1, Ordering::Relaxed);
}

pub fn record_timeout() {
    metrics().timeouts.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Serialize)]
pub struct FederationMetricsSnapshot {
    pub requests: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timeouts: u64,
    pub instances: u64,
    pub instance_failures: u64,
    pub retries: u64,
    pub plan_cache_hits: u64,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
}

pub fn snapshot() -> FederationMetricsSnapshot {
    let metrics = metrics();
    let requests = metrics.requests.load(Ordering::Relaxed);
    let duration_total = metrics.duration_total_ms.load(Ordering::Relaxed);
    let max_ms = metrics.duration_max_ms.load(Ordering::Relaxed);

    let avg_ms = if requests > 0 {
        Some(duration_total as f64 / requests as f64)
    } else {
        None
    };

    FederationMetricsSnapshot {
        requests,
        failed: metrics.failed.load(Ordering::Relaxed),
        cancelled: metrics.cancelled.load(Ordering::Relaxed),
        timeouts: metrics.timeouts.load(Ordering::Relaxed),
        instances: metrics.instances.load(Ordering::Relaxed),
        instance_failures: metrics.instance_failures.load(Ordering::Relaxed),
        retries: metrics.retries.load(Ordering::Relaxed),
        plan_cache_hits: metrics.plan_cache_hits.load(Ordering::Relaxed),
        avg_ms,
        max_ms: if max_ms > 0 { Some(max_ms) } else { None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_flow() {
        // Other tests record concurrently, so only check deltas.
        let initial = snapshot();

        record_request(100.0, true);
        record_request(50.0, false);
        let s1 = snapshot();
        assert!(s1.requests >= initial.requests + 2);
        assert!(s1.failed > initial.failed);

        record_instances(3);
        record_retry();
        record_instance_failure();
        let s2 = snapshot();
        assert!(s2.instances >= initial.instances + 3);
        assert!(s2.retries > initial.retries);
        assert!(s2.instance_failures > initial.instance_failures);

        record_cancel();
        record_timeout();
        let s3 = snapshot();
        assert!(s3.cancelled > initial.cancelled);
        assert!(s3.timeouts > initial.timeouts);

        record_request(99999.0, true);
        assert!(snapshot().max_ms.unwrap() >= 99999);
    }
}
