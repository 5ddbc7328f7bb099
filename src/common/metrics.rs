//! Ingestion and API metrics
//!
//! Prometheus-compatible text exposition for:
//! - Ledger entries applied / stale / malformed
//! - Backfill chunk outcomes and range-query latency
//! - Live tail polls and watch reconnects
//! - Snapshot writes
//! - Fan-out publishes and subscriber churn
//! - Per-endpoint HTTP request counts and latency

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// Fixed-bucket latency histogram
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        Self {
            buckets: (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: boundaries.to_vec(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in milliseconds
    pub fn observe(&self, value_ms: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| value_ms <= b)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value_ms * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, d: Duration) {
        self.observe(d.as_secs_f64() * 1000.0);
    }

    /// Cumulative `(le, count)` pairs, last one is +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut out: Vec<(f64, u64)> = self
            .boundaries
            .iter()
            .enumerate()
            .map(|(i, &b)| {
                cumulative += self.buckets[i].load(Ordering::Relaxed);
                (b, cumulative)
            })
            .collect();
        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        out.push((f64::INFINITY, cumulative));
        out
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn write_prometheus(&self, out: &mut String, name: &str, labels: &str) {
        let sep = if labels.is_empty() { "" } else { "," };
        for (le, count) in self.get_buckets() {
            let le = if le.is_infinite() {
                "+Inf".to_string()
            } else {
                le.to_string()
            };
            let _ = writeln!(out, "{name}_bucket{{{labels}{sep}le=\"{le}\"}} {count}");
        }
        let _ = writeln!(out, "{name}_sum{{{labels}}} {}", self.sum());
        let _ = writeln!(out, "{name}_count{{{labels}}} {}", self.count());
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Per-endpoint HTTP metrics
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub requests_total: Counter,
    pub requests_error: Counter,
    pub latency: Histogram,
}

/// Global metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    endpoints: Mutex<HashMap<String, Arc<EndpointMetrics>>>,

    // Ingestion
    pub entries_applied: Counter,
    pub entries_stale: Counter,
    pub entries_malformed: Counter,
    pub chunks_completed: Counter,
    pub chunks_failed: Counter,
    pub retries: Counter,
    pub range_query_latency: Histogram,
    pub live_polls: Counter,
    pub watch_reconnects: Counter,

    // Durability
    pub snapshots_written: Counter,
    pub snapshots_failed: Counter,

    // Fan-out
    pub records_published: Counter,
    pub subscribers_active: Gauge,
    pub subscribers_dropped: Counter,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            entries_applied: Counter::new(),
            entries_stale: Counter::new(),
            entries_malformed: Counter::new(),
            chunks_completed: Counter::new(),
            chunks_failed: Counter::new(),
            retries: Counter::new(),
            range_query_latency: Histogram::new(),
            live_polls: Counter::new(),
            watch_reconnects: Counter::new(),
            snapshots_written: Counter::new(),
            snapshots_failed: Counter::new(),
            records_published: Counter::new(),
            subscribers_active: Gauge::new(),
            subscribers_dropped: Counter::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for an endpoint
    pub fn endpoint(&self, path: &str) -> Arc<EndpointMetrics> {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        endpoints.entry(path.to_string()).or_default().clone()
    }

    /// Record a finished HTTP request
    pub fn record_request(&self, path: &str, duration: Duration, success: bool) {
        let endpoint = self.endpoint(path);
        endpoint.requests_total.inc();
        endpoint.latency.observe_duration(duration);
        if !success {
            endpoint.requests_error.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 12] = [
            ("entries_applied_total", "Ledger entries that changed the cache", &self.entries_applied),
            ("entries_stale_total", "Ledger entries ignored as duplicates or older", &self.entries_stale),
            ("entries_malformed_total", "Ledger entries dropped during normalization", &self.entries_malformed),
            ("chunks_completed_total", "Range query chunks scanned", &self.chunks_completed),
            ("chunks_failed_total", "Range query chunks skipped after exhausting retries", &self.chunks_failed),
            ("retries_total", "Ledger request retries", &self.retries),
            ("live_polls_total", "Live tail poll ticks", &self.live_polls),
            ("watch_reconnects_total", "Push subscription connection attempts", &self.watch_reconnects),
            ("snapshots_written_total", "Snapshots persisted", &self.snapshots_written),
            ("snapshots_failed_total", "Snapshot writes that failed", &self.snapshots_failed),
            ("records_published_total", "Records sent to push-stream subscribers", &self.records_published),
            ("subscribers_dropped_total", "Subscribers dropped for lagging or disconnecting", &self.subscribers_dropped),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP pixel_indexer_{name} {help}");
            let _ = writeln!(out, "# TYPE pixel_indexer_{name} counter");
            let _ = writeln!(out, "pixel_indexer_{name} {}", counter.get());
        }

        out.push_str("# HELP pixel_indexer_uptime_seconds Process uptime in seconds\n");
        out.push_str("# TYPE pixel_indexer_uptime_seconds gauge\n");
        let _ = writeln!(out, "pixel_indexer_uptime_seconds {}", self.uptime_seconds());

        out.push_str("# HELP pixel_indexer_subscribers_active Connected push-stream subscribers\n");
        out.push_str("# TYPE pixel_indexer_subscribers_active gauge\n");
        let _ = writeln!(
            out,
            "pixel_indexer_subscribers_active {}",
            self.subscribers_active.get()
        );

        out.push_str("# HELP pixel_indexer_range_query_ms Ledger range query latency\n");
        out.push_str("# TYPE pixel_indexer_range_query_ms histogram\n");
        self.range_query_latency
            .write_prometheus(&mut out, "pixel_indexer_range_query_ms", "");

        let endpoints = self.endpoints.lock().unwrap_or_else(|e| e.into_inner());
        out.push_str("# HELP pixel_indexer_http_requests_total Requests per endpoint\n");
        out.push_str("# TYPE pixel_indexer_http_requests_total counter\n");
        for (path, m) in endpoints.iter() {
            let _ = writeln!(
                out,
                "pixel_indexer_http_requests_total{{path=\"{}\"}} {}",
                path,
                m.requests_total.get()
            );
        }
        out.push_str("# HELP pixel_indexer_http_errors_total Failed requests per endpoint\n");
        out.push_str("# TYPE pixel_indexer_http_errors_total counter\n");
        for (path, m) in endpoints.iter() {
            let _ = writeln!(
                out,
                "pixel_indexer_http_errors_total{{path=\"{}\"}} {}",
                path,
                m.requests_error.get()
            );
        }
        out.push_str("# HELP pixel_indexer_http_request_ms Request duration in milliseconds\n");
        out.push_str("# TYPE pixel_indexer_http_request_ms histogram\n");
        for (path, m) in endpoints.iter() {
            m.latency.write_prometheus(
                &mut out,
                "pixel_indexer_http_request_ms",
                &format!("path=\"{}\"", path),
            );
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let hist = Histogram::new();
        hist.observe(0.5);
        hist.observe(50.0);
        hist.observe(10_000.0);

        assert_eq!(hist.count(), 3);
        let buckets = hist.get_buckets();
        assert_eq!(buckets.first().unwrap(), &(1.0, 1));
        assert_eq!(buckets.last().unwrap().1, 3);
        assert!(buckets.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn test_gauge_does_not_underflow() {
        let gauge = Gauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.set(2);
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 2);
    }

    #[test]
    fn test_prometheus_output() {
        let registry = MetricsRegistry::new();
        registry.entries_applied.add(7);
        registry.record_request("/pixels", Duration::from_millis(3), true);
        registry.record_request("/pixels", Duration::from_millis(4), false);

        let text = registry.to_prometheus();
        assert!(text.contains("pixel_indexer_entries_applied_total 7"));
        assert!(text.contains("pixel_indexer_http_requests_total{path=\"/pixels\"} 2"));
        assert!(text.contains("pixel_indexer_http_errors_total{path=\"/pixels\"} 1"));
        assert!(text.contains("pixel_indexer_http_request_ms_bucket{path=\"/pixels\",le=\"+Inf\"} 2"));
        assert!(text.contains("pixel_indexer_range_query_ms_bucket{le=\"+Inf\"} 0"));
    }
}
