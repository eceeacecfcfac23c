use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global metrics collector for the service.
///
/// Tracks request outcomes, inference latency, and detection volume.
/// Thread-safe and cheap to clone into handlers.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    requests_total: AtomicUsize,
    requests_success: AtomicUsize,
    requests_failed: AtomicUsize,

    images_processed: AtomicUsize,
    detections_total: AtomicUsize,

    inference_latency_ms: RwLock<Vec<u64>>,

    // Per-endpoint request counters
    endpoint_counters: DashMap<String, AtomicUsize>,

    // Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                requests_total: AtomicUsize::new(0),
                requests_success: AtomicUsize::new(0),
                requests_failed: AtomicUsize::new(0),
                images_processed: AtomicUsize::new(0),
                detections_total: AtomicUsize::new(0),
                inference_latency_ms: RwLock::new(Vec::new()),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_request(&self, success: bool) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.inner.requests_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_inference(&self, duration: Duration, detections: usize) {
        self.inner.images_processed.fetch_add(1, Ordering::Relaxed);
        self.inner
            .detections_total
            .fetch_add(detections, Ordering::Relaxed);
        self.inner
            .inference_latency_ms
            .write()
            .push(duration.as_millis() as u64);
    }

    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner
            .endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    // Get snapshot for reporting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.inner.inference_latency_ms.read();
        let latency_avg = avg(&latency);
        let latency_p50 = percentile(&latency, 0.5);
        let latency_p95 = percentile(&latency, 0.95);
        let latency_p99 = percentile(&latency, 0.99);
        drop(latency);

        let endpoints = self
            .inner
            .endpoint_counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            requests_total: self.inner.requests_total.load(Ordering::Relaxed),
            requests_success: self.inner.requests_success.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            images_processed: self.inner.images_processed.load(Ordering::Relaxed),
            detections_total: self.inner.detections_total.load(Ordering::Relaxed),
            inference_latency_avg_ms: latency_avg,
            inference_latency_p50_ms: latency_p50,
            inference_latency_p95_ms: latency_p95,
            inference_latency_p99_ms: latency_p99,
            endpoints,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP requests_total Total number of inference requests
# TYPE requests_total counter
requests_total {{}} {}

# HELP requests_success Number of successful inference requests
# TYPE requests_success counter
requests_success {{}} {}

# HELP requests_failed Number of failed inference requests
# TYPE requests_failed counter
requests_failed {{}} {}

# HELP images_processed_total Total number of images run through the detector
# TYPE images_processed_total counter
images_processed_total {{}} {}

# HELP detections_total Total number of detections emitted
# TYPE detections_total counter
detections_total {{}} {}

# HELP inference_latency_avg_ms Average inference latency in milliseconds
# TYPE inference_latency_avg_ms gauge
inference_latency_avg_ms {{}} {}

# HELP inference_latency_p95_ms 95th percentile inference latency in milliseconds
# TYPE inference_latency_p95_ms gauge
inference_latency_p95_ms {{}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            snapshot.requests_total,
            snapshot.requests_success,
            snapshot.requests_failed,
            snapshot.images_processed,
            snapshot.detections_total,
            snapshot.inference_latency_avg_ms,
            snapshot.inference_latency_p95_ms,
            snapshot.uptime_seconds,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_total: usize,
    pub requests_success: usize,
    pub requests_failed: usize,
    pub images_processed: usize,
    pub detections_total: usize,
    pub inference_latency_avg_ms: u64,
    pub inference_latency_p50_ms: u64,
    pub inference_latency_p95_ms: u64,
    pub inference_latency_p99_ms: u64,
    pub endpoints: std::collections::HashMap<String, usize>,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_request(true);
        metrics.record_request(false);
        metrics.record_inference(Duration::from_millis(100), 3);
        metrics.record_inference(Duration::from_millis(50), 0);
        metrics.record_endpoint_request("/infer");
        metrics.record_endpoint_request("/infer");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_success, 1);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.images_processed, 2);
        assert_eq!(snapshot.detections_total, 3);
        assert_eq!(snapshot.inference_latency_avg_ms, 75);
        assert_eq!(snapshot.endpoints.get("/infer"), Some(&2));
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_request(true);
        metrics.record_inference(Duration::from_millis(100), 5);

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("requests_total {} 1"));
        assert!(prometheus.contains("detections_total {} 5"));
    }

    #[test]
    fn test_empty_percentiles_are_zero() {
        let snapshot = Metrics::new().snapshot();
        assert_eq!(snapshot.inference_latency_p95_ms, 0);
        assert_eq!(snapshot.inference_latency_avg_ms, 0);
    }
}
