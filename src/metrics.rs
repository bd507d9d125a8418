//! Prometheus metrics, exposed in text format at `/metrics`.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    pub method: String,
    pub path: String,
    pub status: u16,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TierLabels {
    pub tier: String,
}

pub struct Metrics {
    registry: Registry,

    pub http_requests: Family<HttpLabels, Counter>,
    pub http_duration_seconds: Family<HttpLabels, Histogram>,

    pub cache_hits: Family<TierLabels, Counter>,
    pub cache_misses: Counter,
    pub derivations: Counter,
    pub derivation_duration_seconds: Histogram,
    pub evictions: Family<TierLabels, Counter>,

    pub uploads: Counter,
    pub upload_bytes: Counter,

    pub tier_size_bytes: Family<TierLabels, Gauge>,
    pub tier_count: Family<TierLabels, Gauge>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let http_requests = Family::<HttpLabels, Counter>::default();
        registry.register(
            "http_requests_total",
            "Total HTTP requests",
            http_requests.clone(),
        );

        let http_duration_seconds = Family::<HttpLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 12))
        });
        registry.register(
            "http_request_duration_seconds",
            "HTTP request duration in seconds",
            http_duration_seconds.clone(),
        );

        let cache_hits = Family::<TierLabels, Counter>::default();
        registry.register("cache_hits_total", "Cache hits by tier", cache_hits.clone());

        let cache_misses = Counter::default();
        registry.register(
            "cache_misses_total",
            "Requests that missed every tier",
            cache_misses.clone(),
        );

        let derivations = Counter::default();
        registry.register(
            "derivations_total",
            "Derived images produced by the derivation engine",
            derivations.clone(),
        );

        let derivation_duration_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 12));
        registry.register(
            "derivation_duration_seconds",
            "Time spent deriving a missing image",
            derivation_duration_seconds.clone(),
        );

        let evictions = Family::<TierLabels, Counter>::default();
        registry.register("evictions_total", "Entries evicted by tier", evictions.clone());

        let uploads = Counter::default();
        registry.register("uploads_total", "Original images uploaded", uploads.clone());

        let upload_bytes = Counter::default();
        registry.register(
            "upload_bytes_total",
            "Bytes uploaded as original images",
            upload_bytes.clone(),
        );

        let tier_size_bytes = Family::<TierLabels, Gauge>::default();
        registry.register(
            "tier_size_bytes",
            "Bytes currently held by each tier",
            tier_size_bytes.clone(),
        );

        let tier_count = Family::<TierLabels, Gauge>::default();
        registry.register(
            "tier_entry_count",
            "Entries currently held by each tier",
            tier_count.clone(),
        );

        Metrics {
            registry,
            http_requests,
            http_duration_seconds,
            cache_hits,
            cache_misses,
            derivations,
            derivation_duration_seconds,
            evictions,
            uploads,
            upload_bytes,
            tier_size_bytes,
            tier_count,
        }
    }

    pub fn record_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let labels = HttpLabels {
            method: method.to_string(),
            path: normalize_path(path),
            status,
        };
        self.http_requests.get_or_create(&labels).inc();
        self.http_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_hit(&self, tier: &str) {
        self.cache_hits
            .get_or_create(&TierLabels {
                tier: tier.to_string(),
            })
            .inc();
    }

    pub fn record_miss(&self) {
        self.cache_misses.inc();
    }

    pub fn record_derivation(&self, duration_secs: f64) {
        self.derivations.inc();
        self.derivation_duration_seconds.observe(duration_secs);
    }

    pub fn record_eviction(&self, tier: &str) {
        self.evictions
            .get_or_create(&TierLabels {
                tier: tier.to_string(),
            })
            .inc();
    }

    pub fn record_upload(&self, bytes: u64) {
        self.uploads.inc();
        self.upload_bytes.inc_by(bytes);
    }

    pub fn set_tier_gauges(&self, tier: &str, size_bytes: u64, count: u64) {
        let labels = TierLabels {
            tier: tier.to_string(),
        };
        self.tier_size_bytes.get_or_create(&labels).set(size_bytes as i64);
        self.tier_count.get_or_create(&labels).set(count as i64);
    }

    pub fn encode(&self) -> String {
        let mut buf = String::new();
        let _ = encode(&mut buf, &self.registry);
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapses path parameters so metric cardinality doesn't scale with the
/// number of distinct cache names requested.
fn normalize_path(path: &str) -> String {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        if segment == "images" || segment == "health" || segment == "metrics" {
            segments.push(segment.to_string());
        } else {
            segments.push(":name".to_string());
        }
    }
    format!("/{}", segments.join("/"))
}
