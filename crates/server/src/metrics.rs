//! Prometheus metrics collection.

use prometheus_client::encoding::{text::encode, EncodeLabelSet};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// HTTP request labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    pub method: String,
    pub path: String,
    pub status: u16,
}

/// Application metrics.
pub struct Metrics {
    registry: Registry,

    /// HTTP request counter by method/path/status.
    pub http_requests: Family<HttpLabels, Counter>,

    /// Image generation duration (codec work included).
    pub generation_seconds: Histogram,

    /// Derivative cache hit counter.
    pub cache_hits: Counter,

    /// Derivative cache miss counter.
    pub cache_misses: Counter,

    /// Requests that timed out waiting on another worker's generation.
    pub stampede_timeouts: Counter,

    /// Currently running background tasks.
    pub tasks_running: Gauge,

    /// Completed background tasks.
    pub tasks_completed: Counter,
}

impl Metrics {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let http_requests = Family::<HttpLabels, Counter>::default();
        registry.register(
            "http_requests_total",
            "Total HTTP requests",
            http_requests.clone(),
        );

        let generation_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 12));
        registry.register(
            "image_generation_seconds",
            "Derivative generation duration in seconds",
            generation_seconds.clone(),
        );

        let cache_hits = Counter::default();
        registry.register(
            "cache_hits_total",
            "Derivative cache hit count",
            cache_hits.clone(),
        );

        let cache_misses = Counter::default();
        registry.register(
            "cache_misses_total",
            "Derivative cache miss count",
            cache_misses.clone(),
        );

        let stampede_timeouts = Counter::default();
        registry.register(
            "stampede_timeouts_total",
            "Requests that exhausted the generation wait budget",
            stampede_timeouts.clone(),
        );

        let tasks_running = Gauge::default();
        registry.register(
            "tasks_running",
            "Background tasks currently executing",
            tasks_running.clone(),
        );

        let tasks_completed = Counter::default();
        registry.register(
            "tasks_completed_total",
            "Background tasks completed",
            tasks_completed.clone(),
        );

        Self {
            registry,
            http_requests,
            generation_seconds,
            cache_hits,
            cache_misses,
            stampede_timeouts,
            tasks_running,
            tasks_completed,
        }
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        let mut output = String::new();
        if encode(&mut output, &self.registry).is_err() {
            return String::new();
        }
        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn renders_registered_metrics() {
        let metrics = Metrics::new();
        metrics.cache_hits.inc();
        metrics.cache_misses.inc();
        metrics
            .http_requests
            .get_or_create(&HttpLabels {
                method: "GET".to_string(),
                path: "/image".to_string(),
                status: 200,
            })
            .inc();

        let output = metrics.render();
        assert!(output.contains("cache_hits_total 1"));
        assert!(output.contains("cache_misses_total 1"));
        assert!(output.contains("http_requests_total"));
    }
}
