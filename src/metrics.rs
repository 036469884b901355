use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServiceLabels {
    pub service: Service,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Service {
    InfoRefs,
    UploadPack,
    ReceivePack,
    Archive,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    pub result: CacheResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheResult {
    Hit,
    Miss,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PollLabels {
    pub status: PollStatus,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum PollStatus {
    Hit,
    Miss,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    /// Accelerated git requests by service.
    pub git_requests: Family<ServiceLabels, Counter>,
    /// Archive disk-cache hits and misses.
    pub archive_cache: Family<CacheLabels, Counter>,
    /// Keys currently being watched by long-poll callers.
    pub keywatcher_watchers: Gauge,
    /// Completed key watches, partitioned by hit (value unchanged) and miss.
    pub keywatcher_hit_miss: Family<PollLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let git_requests = Family::<ServiceLabels, Counter>::default();
        registry.register(
            "gitshuttle_git_requests",
            "Accelerated git requests by service",
            git_requests.clone(),
        );

        let archive_cache = Family::<CacheLabels, Counter>::default();
        registry.register(
            "gitshuttle_git_archive_cache",
            "Cache hits and misses for git archive streaming",
            archive_cache.clone(),
        );

        let keywatcher_watchers: Gauge = Gauge::default();
        registry.register(
            "gitshuttle_keywatcher_watchers",
            "Number of keys currently watched by long-poll callers",
            keywatcher_watchers.clone(),
        );

        let keywatcher_hit_miss = Family::<PollLabels, Counter>::default();
        registry.register(
            "gitshuttle_keywatcher_hit_miss",
            "Completed key watches partitioned by hit and miss",
            keywatcher_hit_miss.clone(),
        );

        Self {
            git_requests,
            archive_cache,
            keywatcher_watchers,
            keywatcher_hit_miss,
        }
    }

    pub fn count_request(&self, service: Service) {
        self.git_requests.get_or_create(&ServiceLabels { service }).inc();
    }

    pub fn count_archive_cache(&self, result: CacheResult) {
        self.archive_cache.get_or_create(&CacheLabels { result }).inc();
    }

    pub fn count_keywatch(&self, status: PollStatus) {
        self.keywatcher_hit_miss
            .get_or_create(&PollLabels { status })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_count() {
        let registry = MetricsRegistry::new();
        let m = &registry.metrics;

        m.count_archive_cache(CacheResult::Miss);
        m.count_archive_cache(CacheResult::Miss);
        m.count_archive_cache(CacheResult::Hit);

        let hit = m
            .archive_cache
            .get_or_create(&CacheLabels { result: CacheResult::Hit });
        assert_eq!(hit.get(), 1);
        let miss = m
            .archive_cache
            .get_or_create(&CacheLabels { result: CacheResult::Miss });
        assert_eq!(miss.get(), 2);
    }

    #[test]
    fn exposition_contains_metric_names() {
        let registry = MetricsRegistry::new();
        registry.metrics.count_request(Service::UploadPack);

        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &registry.registry).unwrap();
        assert!(buf.contains("gitshuttle_git_requests"));
        assert!(buf.contains("gitshuttle_keywatcher_watchers"));
    }
}
