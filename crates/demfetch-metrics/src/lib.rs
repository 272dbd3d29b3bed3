//! Metric declarations for the demfetch tile pipeline.
//!
//! Every metric the pipeline emits is declared once in [`metric_defs`] as a
//! const [`Metric`], so names, units and label keys live in one place. The
//! `metrics` crate is re-exported; install any recorder (Prometheus, logging,
//! none) before calling [`describe_metrics`].
//!
//! ```rust
//! use demfetch_metrics::{metric_defs, SourceLabels};
//!
//! let labels = SourceLabels::new("srtm");
//! metrics::counter!(metric_defs::CACHE_HITS.name, &labels.to_labels()).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric (counter, gauge, or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration with its metadata.
///
/// Built with const constructors so declarations can be `const` items:
///
/// ```rust
/// use demfetch_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const TILES: Metric = Metric::counter("demfetch.example.tiles")
///     .with_description("Tiles seen")
///     .with_unit(Unit::Count)
///     .with_labels(&["source"]);
///
/// assert_eq!(TILES.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// Dotted metric name, e.g. `demfetch.cache.hits`.
    pub name: &'static str,
    pub kind: MetricKind,
    pub description: &'static str,
    pub unit: Option<Unit>,
    /// Label keys every emission of this metric carries.
    pub labels: &'static [&'static str],
}

impl Metric {
    const fn new(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    pub const fn counter(name: &'static str) -> Self {
        Self::new(name, MetricKind::Counter)
    }

    pub const fn gauge(name: &'static str) -> Self {
        Self::new(name, MetricKind::Gauge)
    }

    pub const fn histogram(name: &'static str) -> Self {
        Self::new(name, MetricKind::Histogram)
    }

    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => {
                describe_counter!(self.name, unit, self.description);
            }
            (MetricKind::Counter, None) => {
                describe_counter!(self.name, self.description);
            }
            (MetricKind::Gauge, Some(unit)) => {
                describe_gauge!(self.name, unit, self.description);
            }
            (MetricKind::Gauge, None) => {
                describe_gauge!(self.name, self.description);
            }
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description);
            }
            (MetricKind::Histogram, None) => {
                describe_histogram!(self.name, self.description);
            }
        }
    }
}

/// All metric definitions for the pipeline.
pub mod metric_defs {
    use super::{Metric, Unit};

    /// Label carried by every per-source metric.
    pub const SOURCE_LABELS: &[&str] = &["source"];

    // ========================================================================
    // Tile Cache
    // ========================================================================

    /// Fetches served from a fresh cache entry.
    pub const CACHE_HITS: Metric = Metric::counter("demfetch.cache.hits")
        .with_description("Tile fetches served from a fresh cache entry")
        .with_unit(Unit::Count)
        .with_labels(SOURCE_LABELS);

    /// Fetches that found no usable entry.
    pub const CACHE_MISSES: Metric = Metric::counter("demfetch.cache.misses")
        .with_description("Tile fetches that required a download")
        .with_unit(Unit::Count)
        .with_labels(SOURCE_LABELS);

    /// Fetches that waited on another caller's in-flight download.
    pub const CACHE_DEDUP_WAITS: Metric = Metric::counter("demfetch.cache.dedup_waits")
        .with_description("Fetches that joined an in-flight download instead of starting one")
        .with_unit(Unit::Count)
        .with_labels(SOURCE_LABELS);

    /// Completed, verified downloads.
    pub const CACHE_DOWNLOADS: Metric = Metric::counter("demfetch.cache.downloads")
        .with_description("Tiles downloaded, verified and published")
        .with_unit(Unit::Count)
        .with_labels(SOURCE_LABELS);

    /// Bytes published into the cache.
    pub const CACHE_DOWNLOAD_BYTES: Metric = Metric::counter("demfetch.cache.download_bytes")
        .with_description("Bytes of tile payload published into the cache")
        .with_unit(Unit::Bytes)
        .with_labels(SOURCE_LABELS);

    /// Download attempts that were retried.
    pub const CACHE_RETRIES: Metric = Metric::counter("demfetch.cache.retries")
        .with_description("Remote operations retried after a transient failure")
        .with_unit(Unit::Count)
        .with_labels(SOURCE_LABELS);

    /// Stale entries checked against the remote.
    pub const CACHE_REVALIDATIONS: Metric = Metric::counter("demfetch.cache.revalidations")
        .with_description("Stale cache entries re-validated against the remote")
        .with_unit(Unit::Count)
        .with_labels(SOURCE_LABELS);

    /// Stale entries served because the remote could not be reached.
    pub const CACHE_STALE_REUSES: Metric = Metric::counter("demfetch.cache.stale_reuses")
        .with_description("Stale cache entries reused because re-validation or refresh failed")
        .with_unit(Unit::Count)
        .with_labels(SOURCE_LABELS);

    /// Entries removed to honour the size limit.
    pub const CACHE_EVICTIONS: Metric = Metric::counter("demfetch.cache.evictions")
        .with_description("Cache entries evicted to stay under the size limit")
        .with_unit(Unit::Count);

    /// Total size of published entries.
    pub const CACHE_SIZE: Metric = Metric::gauge("demfetch.cache.size_bytes")
        .with_description("Total bytes held by published cache entries")
        .with_unit(Unit::Bytes);

    /// Wall time of a download including retries.
    pub const FETCH_DURATION: Metric = Metric::histogram("demfetch.fetch.duration")
        .with_description("Time to download, verify and publish one tile")
        .with_unit(Unit::Seconds)
        .with_labels(SOURCE_LABELS);

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Jobs accepted by the orchestrator.
    pub const JOBS_SUBMITTED: Metric = Metric::counter("demfetch.jobs.submitted")
        .with_description("Jobs accepted for processing")
        .with_unit(Unit::Count)
        .with_labels(SOURCE_LABELS);

    /// Jobs that produced an artifact.
    pub const JOBS_COMPLETED: Metric = Metric::counter("demfetch.jobs.completed")
        .with_description("Jobs that finished with a raster artifact")
        .with_unit(Unit::Count)
        .with_labels(SOURCE_LABELS);

    /// Jobs that failed, by error kind.
    pub const JOBS_FAILED: Metric = Metric::counter("demfetch.jobs.failed")
        .with_description("Jobs that finished with an error")
        .with_unit(Unit::Count)
        .with_labels(&["source", "kind"]);

    /// Jobs currently held by a worker.
    pub const JOBS_ACTIVE: Metric = Metric::gauge("demfetch.jobs.active")
        .with_description("Jobs currently being processed by a worker")
        .with_unit(Unit::Count);

    /// Submit-to-terminal time of a job.
    pub const JOB_DURATION: Metric = Metric::histogram("demfetch.jobs.duration")
        .with_description("Time from pickup to terminal state")
        .with_unit(Unit::Seconds)
        .with_labels(SOURCE_LABELS);

    /// Time spent in each non-terminal stage.
    pub const JOB_STAGE_DURATION: Metric = Metric::histogram("demfetch.jobs.stage_duration")
        .with_description("Time a job spent in one stage")
        .with_unit(Unit::Seconds)
        .with_labels(&["source", "stage"]);

    /// Tiles located per job.
    pub const JOB_TILES: Metric = Metric::histogram("demfetch.jobs.tiles")
        .with_description("Tiles located for a job")
        .with_unit(Unit::Count)
        .with_labels(SOURCE_LABELS);

    // ========================================================================
    // Mosaic
    // ========================================================================

    /// Valid pixels in each produced artifact.
    pub const MOSAIC_VALID_PIXELS: Metric = Metric::histogram("demfetch.mosaic.valid_pixels")
        .with_description("Valid (non-NoData) pixels in a clipped artifact")
        .with_unit(Unit::Count)
        .with_labels(SOURCE_LABELS);

    /// Returns a slice of all defined metrics.
    pub const ALL: &[&Metric] = &[
        // Tile Cache
        &CACHE_HITS,
        &CACHE_MISSES,
        &CACHE_DEDUP_WAITS,
        &CACHE_DOWNLOADS,
        &CACHE_DOWNLOAD_BYTES,
        &CACHE_RETRIES,
        &CACHE_REVALIDATIONS,
        &CACHE_STALE_REUSES,
        &CACHE_EVICTIONS,
        &CACHE_SIZE,
        &FETCH_DURATION,
        // Jobs
        &JOBS_SUBMITTED,
        &JOBS_COMPLETED,
        &JOBS_FAILED,
        &JOBS_ACTIVE,
        &JOB_DURATION,
        &JOB_STAGE_DURATION,
        &JOB_TILES,
        // Mosaic
        &MOSAIC_VALID_PIXELS,
    ];
}

/// Labels identifying the source a metric refers to.
#[derive(Debug, Clone)]
pub struct SourceLabels {
    pub source: String,
}

impl SourceLabels {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Label pairs in the form the `metrics` macros accept.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![("source", self.source.clone())]
    }

    /// Source label plus extra pairs.
    pub fn with(&self, extra: &[(&'static str, String)]) -> Vec<(&'static str, String)> {
        let mut labels = self.to_labels();
        labels.extend_from_slice(extra);
        labels
    }
}

/// Register descriptions of every metric in [`metric_defs::ALL`].
///
/// Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_source_labels() {
        let labels = SourceLabels::new("srtm");
        assert_eq!(labels.to_labels(), vec![("source", "srtm".to_string())]);

        let extended = labels.with(&[("kind", "fetch_failed".to_string())]);
        assert_eq!(extended.len(), 2);
        assert!(extended.contains(&("kind", "fetch_failed".to_string())));
    }

    #[test]
    fn test_metric_definitions() {
        assert_eq!(metric_defs::CACHE_HITS.name, "demfetch.cache.hits");
        assert_eq!(metric_defs::CACHE_HITS.kind, MetricKind::Counter);
        assert_eq!(metric_defs::CACHE_SIZE.kind, MetricKind::Gauge);
        assert_eq!(metric_defs::FETCH_DURATION.unit, Some(Unit::Seconds));
        assert_eq!(metric_defs::JOBS_FAILED.labels, &["source", "kind"]);
    }

    #[test]
    fn test_metric_names_unique_and_prefixed() {
        let mut seen = HashSet::new();
        for metric in metric_defs::ALL {
            assert!(metric.name.starts_with("demfetch."), "{}", metric.name);
            assert!(seen.insert(metric.name), "duplicate metric {}", metric.name);
            assert!(!metric.description.is_empty(), "{} has no description", metric.name);
        }
        assert_eq!(seen.len(), 19);
    }

    #[test]
    fn test_describe_without_recorder() {
        // Describing with no recorder installed is a no-op
        describe_metrics();
    }
}
