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
pub struct FormatLabels {
    pub format: ArchiveKind,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

impl From<crate::archive::ArchiveFormat> for ArchiveKind {
    fn from(format: crate::archive::ArchiveFormat) -> Self {
        match format {
            crate::archive::ArchiveFormat::Zip => Self::Zip,
            crate::archive::ArchiveFormat::Tar => Self::Tar,
            crate::archive::ArchiveFormat::TarGz => Self::TarGz,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: PublishOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum PublishOutcome {
    Success,
    NoFiles,
    RemoteError,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the service.
///
/// Counters are registered without the `_total` suffix; the encoder adds it.
pub struct Metrics {
    // -- uploads --
    pub uploads_total: Family<FormatLabels, Counter>,
    pub archive_entries_total: Counter,
    pub archive_parse_warnings_total: Counter,

    // -- publishing --
    pub publish_total: Family<OutcomeLabels, Counter>,
    pub publish_files_total: Counter,
    pub publish_duration_seconds: Histogram,

    // -- upstream API --
    pub upstream_api_calls: Family<EndpointLabels, Counter>,
    pub upstream_api_rate_limit_remaining: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let uploads_total = Family::<FormatLabels, Counter>::default();
        registry.register(
            "forgepush_uploads",
            "Archives extracted, by format",
            uploads_total.clone(),
        );

        let archive_entries_total = Counter::default();
        registry.register(
            "forgepush_archive_entries",
            "Entries listed across all extracted archives",
            archive_entries_total.clone(),
        );

        let archive_parse_warnings_total = Counter::default();
        registry.register(
            "forgepush_archive_parse_warnings",
            "Non-fatal archive parse warnings",
            archive_parse_warnings_total.clone(),
        );

        let publish_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "forgepush_publish",
            "Push operations by outcome",
            publish_total.clone(),
        );

        let publish_files_total = Counter::default();
        registry.register(
            "forgepush_publish_files",
            "Files committed by successful pushes",
            publish_files_total.clone(),
        );

        let publish_duration_seconds = Histogram::new(exponential_buckets(0.05, 2.0, 12));
        registry.register(
            "forgepush_publish_duration_seconds",
            "Push latency in seconds",
            publish_duration_seconds.clone(),
        );

        let upstream_api_calls = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "forgepush_upstream_api_calls",
            "GitHub API call count by endpoint",
            upstream_api_calls.clone(),
        );

        let upstream_api_rate_limit_remaining: Gauge = Gauge::default();
        registry.register(
            "forgepush_upstream_api_rate_limit_remaining",
            "Remaining GitHub API calls before rate limit",
            upstream_api_rate_limit_remaining.clone(),
        );

        Self {
            uploads_total,
            archive_entries_total,
            archive_parse_warnings_total,
            publish_total,
            publish_files_total,
            publish_duration_seconds,
            upstream_api_calls,
            upstream_api_rate_limit_remaining,
        }
    }

    pub fn record_upstream_call(&self, endpoint: &str) {
        self.upstream_api_calls
            .get_or_create(&EndpointLabels {
                endpoint: endpoint.to_string(),
            })
            .inc();
    }

    pub fn record_publish(&self, outcome: PublishOutcome) {
        self.publish_total
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all service metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
