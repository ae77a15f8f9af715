use std::sync::Arc;
use std::time::Duration;

/// Structured, in-process event hook for observability.
///
/// The crate never prints. Callers provide an implementation that forwards these events to
/// `tracing` or a custom sink; [`TracingEventListener`] covers the common case.
pub trait DbEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: DbEvent);
}

/// Structured events emitted by the core.
#[derive(Debug, Clone, PartialEq)]
pub enum DbEvent {
    /// A level's store rejected a cascaded write; coarser levels were not touched.
    CascadeAborted { level: usize, series: String, error: String },
    /// The terminal level's filter emitted an entry but the level is populated externally.
    TerminalEmissionDropped { level: usize, series: String },

    QueryFinished { series: String, entries: u64, buckets: u64, early_stop: bool },
    QueryCancelled { series: String, entries: u64 },
    QueryFailed { series: String, error: String },
    CursorCloseFailed { series: String, error: String },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl DbEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: DbEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn DbEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards every event to `tracing` under the `tierdb` target.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl DbEventListener for TracingEventListener {
    fn on_event(&self, event: DbEvent) {
        match event {
            DbEvent::CascadeAborted { level, series, error } => {
                tracing::warn!(
                    target: "tierdb",
                    cascade_level = level,
                    %series,
                    %error,
                    "cascade aborted"
                );
            }
            DbEvent::TerminalEmissionDropped { level, series } => {
                tracing::debug!(
                    target: "tierdb",
                    cascade_level = level,
                    %series,
                    "terminal level emission dropped"
                );
            }
            DbEvent::QueryFinished { series, entries, buckets, early_stop } => {
                tracing::debug!(
                    target: "tierdb",
                    %series,
                    entries,
                    buckets,
                    early_stop,
                    "query finished"
                );
            }
            DbEvent::QueryCancelled { series, entries } => {
                tracing::debug!(target: "tierdb", %series, entries, "query cancelled by consumer");
            }
            DbEvent::QueryFailed { series, error } => {
                tracing::warn!(target: "tierdb", %series, %error, "query failed");
            }
            DbEvent::CursorCloseFailed { series, error } => {
                tracing::error!(target: "tierdb", %series, %error, "cursor close failed");
            }
        }
    }
}

/// Metrics instrumentation through the `metrics` facade.
///
/// Emitting is effectively a no-op until the host installs a recorder.
pub mod db_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_histogram, Unit};

    // Counters are exposed as `<name>_total` by the Prometheus exporter.
    pub const CASCADE_WRITES: &str = "tierdb_cascade_writes";
    pub const BUCKET_WRITES: &str = "tierdb_bucket_writes";
    pub const BUCKET_ATTRIBUTES: &str = "tierdb_bucket_attributes";
    pub const QUERY_ENTRIES: &str = "tierdb_query_entries";
    pub const QUERY_BUCKETS: &str = "tierdb_query_buckets";
    pub const QUERY_DURATION_SECONDS: &str = "tierdb_query_duration_seconds";

    #[inline]
    pub fn record_cascade_write(level: usize) {
        ::metrics::counter!(CASCADE_WRITES, "level" => level.to_string()).increment(1);
    }

    #[inline]
    pub fn record_bucket_write(attributes: usize) {
        ::metrics::counter!(BUCKET_WRITES).increment(1);
        ::metrics::histogram!(BUCKET_ATTRIBUTES).record(attributes as f64);
    }

    #[inline]
    pub fn record_query(duration: Duration, entries: u64, buckets: u64) {
        ::metrics::histogram!(QUERY_DURATION_SECONDS).record(duration.as_secs_f64());
        if entries > 0 {
            ::metrics::counter!(QUERY_ENTRIES).increment(entries);
        }
        if buckets > 0 {
            ::metrics::counter!(QUERY_BUCKETS).increment(buckets);
        }
    }

    /// Registers descriptions with the installed recorder. Call once after installing it.
    pub fn describe_all() {
        describe_counter!(
            CASCADE_WRITES,
            Unit::Count,
            "Entries stored by a level's cascade handler."
        );
        describe_counter!(
            BUCKET_WRITES,
            Unit::Count,
            "Bucket rows written by bucketed stores."
        );
        describe_histogram!(
            BUCKET_ATTRIBUTES,
            Unit::Count,
            "Encoded attribute streams per written bucket, time stream included."
        );
        describe_counter!(
            QUERY_ENTRIES,
            Unit::Count,
            "Entries emitted on query output streams."
        );
        describe_counter!(
            QUERY_BUCKETS,
            Unit::Count,
            "Buckets fetched from backing scans by queries."
        );
        describe_histogram!(
            QUERY_DURATION_SECONDS,
            Unit::Seconds,
            "Wall time of one store query, scan to cursor close."
        );
    }
}
