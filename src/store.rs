use crate::error::DbError;
use crate::query::QuerySink;
use crate::types::{Entry, SeriesId, Timestamp};

use std::sync::Arc;

/// Persistence contract of one granularity level.
///
/// `query` is blocking: it pushes entries in non-decreasing timestamp order into `sink` and
/// reports failures through the sink's error side. It returns once the range is exhausted,
/// the first entry past `end` was seen, the consumer went away, or an error occurred.
/// Any backing cursor is closed before it returns.
pub trait SeriesStore: Send + Sync {
    fn insert(&self, series: SeriesId, entry: &Entry) -> Result<(), DbError>;

    /// Streams entries of `series` within `[start, end]` carrying `attributes`.
    ///
    /// An empty `attributes` slice asks for every stored attribute.
    fn query(
        &self,
        series: SeriesId,
        start: Timestamp,
        end: Timestamp,
        attributes: &[String],
        sink: &QuerySink,
    );
}

impl<S: SeriesStore + ?Sized> SeriesStore for Arc<S> {
    fn insert(&self, series: SeriesId, entry: &Entry) -> Result<(), DbError> {
        (**self).insert(series, entry)
    }

    fn query(
        &self,
        series: SeriesId,
        start: Timestamp,
        end: Timestamp,
        attributes: &[String],
        sink: &QuerySink,
    ) {
        (**self).query(series, start, end, attributes, sink)
    }
}
