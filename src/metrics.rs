use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub endpoint: Endpoint,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Endpoint {
    Meta,
    File,
    Lfs,
    Other,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    pub outcome: CacheOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheOutcome {
    Hit,
    Miss,
    Bypass,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the mirror.
pub struct Metrics {
    pub requests_total: Family<RequestLabels, Counter>,
    pub request_duration_seconds: Family<RequestLabels, Histogram>,

    // -- chunk cache --
    pub block_reads_total: Family<CacheLabels, Counter>,
    pub blocks_written_total: Counter,
    pub bytes_served_total: Counter,
    pub cache_invalidations_total: Counter,
    pub evictions_total: Counter,
    pub cache_size_bytes: Gauge,

    // -- metadata cache --
    pub meta_stale_served: Counter,

    // -- upstream --
    pub upstream_requests_total: Counter,
    pub upstream_retries_total: Counter,

    // -- state --
    pub offline_mode: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "hubcache_requests",
            "Inbound requests by endpoint class",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<RequestLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.005, 2.0, 14))
            });
        registry.register(
            "hubcache_request_duration_seconds",
            "Request latency in seconds by endpoint class",
            request_duration_seconds.clone(),
        );

        let block_reads_total = Family::<CacheLabels, Counter>::default();
        registry.register(
            "hubcache_block_reads",
            "Block reads by cache outcome",
            block_reads_total.clone(),
        );

        let blocks_written_total = Counter::default();
        registry.register(
            "hubcache_blocks_written",
            "Blocks persisted to the chunk cache",
            blocks_written_total.clone(),
        );

        let bytes_served_total = Counter::default();
        registry.register(
            "hubcache_bytes_served",
            "File bytes streamed to clients",
            bytes_served_total.clone(),
        );

        let cache_invalidations_total = Counter::default();
        registry.register(
            "hubcache_cache_invalidations",
            "Cache entries invalidated by size or digest changes",
            cache_invalidations_total.clone(),
        );

        let evictions_total = Counter::default();
        registry.register(
            "hubcache_evictions",
            "Cache entries removed by the eviction sweep",
            evictions_total.clone(),
        );

        let cache_size_bytes: Gauge = Gauge::default();
        registry.register(
            "hubcache_cache_size_bytes",
            "Allocated bytes in the chunk cache at the last sweep",
            cache_size_bytes.clone(),
        );

        let meta_stale_served = Counter::default();
        registry.register(
            "hubcache_meta_stale_served",
            "Expired metadata entries served because upstream was unavailable",
            meta_stale_served.clone(),
        );

        let upstream_requests_total = Counter::default();
        registry.register(
            "hubcache_upstream_requests",
            "Requests issued to the upstream hub or CDN",
            upstream_requests_total.clone(),
        );

        let upstream_retries_total = Counter::default();
        registry.register(
            "hubcache_upstream_retries",
            "Upstream attempts beyond the first",
            upstream_retries_total.clone(),
        );

        let offline_mode: Gauge = Gauge::default();
        registry.register(
            "hubcache_offline_mode",
            "1 when offline mode is active",
            offline_mode.clone(),
        );

        Self {
            requests_total,
            request_duration_seconds,
            block_reads_total,
            blocks_written_total,
            bytes_served_total,
            cache_invalidations_total,
            evictions_total,
            cache_size_bytes,
            meta_stale_served,
            upstream_requests_total,
            upstream_retries_total,
            offline_mode,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, stored in `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all mirror metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_encodes_registered_metrics() {
        let registry = MetricsRegistry::new();
        registry.metrics.blocks_written_total.inc();
        registry
            .metrics
            .requests_total
            .get_or_create(&RequestLabels {
                endpoint: Endpoint::File,
            })
            .inc();

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &registry.registry).unwrap();
        assert!(out.contains("hubcache_blocks_written_total 1"));
        assert!(out.contains("hubcache_requests"));
    }
}
