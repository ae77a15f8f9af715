//! Contracts of the backing tables the storage core persists into.
//!
//! A real deployment maps these onto a columnar store (bucket table keyed by
//! `(series, window_start)`, cache table keyed by `(series, timestamp)`, tag table keyed by
//! `(tag, value, series)`). The crate ships in-memory implementations in [`crate::storage`].

use crate::error::DbError;
use crate::types::{EncodedAttribute, SeriesId, Tag, Timestamp, Value};

use std::collections::HashMap;
use std::time::Duration;

/// One stored bucket row as returned by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBucket {
    /// Window start (the bucket key within its series).
    pub start: Timestamp,
    /// Attribute name -> encoded blob.
    pub attributes: HashMap<String, Vec<u8>>,
}

/// One row of the cache (raw) table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachePoint {
    pub timestamp: Timestamp,
    pub value: Value,
}

/// Open scan over bucket rows. Must be closed on every exit path; closing may itself fail.
pub trait BucketCursor: Iterator<Item = Result<StoredBucket, DbError>> + Send {
    fn close(self) -> Result<(), DbError>;
}

/// Open scan over cache rows.
pub trait PointCursor: Iterator<Item = Result<CachePoint, DbError>> + Send {
    fn close(self) -> Result<(), DbError>;
}

/// Bucket table of one bucketed level.
pub trait BucketRepository: Send + Sync {
    type Cursor: BucketCursor;

    /// Persists one bucket keyed by `(series, start)`, replacing any stored attribute set.
    fn put(
        &self,
        series: SeriesId,
        granularity: Duration,
        start: Timestamp,
        attributes: &[EncodedAttribute],
    ) -> Result<(), DbError>;

    /// Reads back a single bucket, if present.
    fn fetch(&self, series: SeriesId, start: Timestamp) -> Result<Option<StoredBucket>, DbError>;

    /// Scans buckets of `series` whose window start lies in `[from, to]`.
    fn scan(
        &self,
        series: SeriesId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Self::Cursor, DbError>;

    /// Whether `scan` yields buckets in ascending window-start order.
    ///
    /// Query early termination relies on this; stores answering `false` get their scan results
    /// sorted before they are merged.
    fn scans_in_order(&self) -> bool {
        true
    }
}

/// Cache (raw point) table of the finest level.
pub trait PointTable: Send + Sync {
    type Cursor: PointCursor;

    /// Writes one point, overwriting any value stored at the exact same timestamp.
    fn upsert(&self, series: SeriesId, timestamp: Timestamp, value: Value) -> Result<(), DbError>;

    /// Scans points of `series` with timestamp in `[from, to]`, ascending.
    fn scan(
        &self,
        series: SeriesId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Self::Cursor, DbError>;
}

/// Series metadata index. A batch is written all-or-nothing.
pub trait TagStore: Send + Sync {
    fn tag(&self, series: SeriesId, tags: &[Tag]) -> Result<(), DbError>;
}

impl<R: BucketRepository> BucketRepository for std::sync::Arc<R> {
    type Cursor = R::Cursor;

    fn put(
        &self,
        series: SeriesId,
        granularity: Duration,
        start: Timestamp,
        attributes: &[EncodedAttribute],
    ) -> Result<(), DbError> {
        (**self).put(series, granularity, start, attributes)
    }

    fn fetch(&self, series: SeriesId, start: Timestamp) -> Result<Option<StoredBucket>, DbError> {
        (**self).fetch(series, start)
    }

    fn scan(
        &self,
        series: SeriesId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Self::Cursor, DbError> {
        (**self).scan(series, from, to)
    }

    fn scans_in_order(&self) -> bool {
        (**self).scans_in_order()
    }
}

impl<T: PointTable> PointTable for std::sync::Arc<T> {
    type Cursor = T::Cursor;

    fn upsert(&self, series: SeriesId, timestamp: Timestamp, value: Value) -> Result<(), DbError> {
        (**self).upsert(series, timestamp, value)
    }

    fn scan(
        &self,
        series: SeriesId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Self::Cursor, DbError> {
        (**self).scan(series, from, to)
    }
}

impl<T: TagStore + ?Sized> TagStore for std::sync::Arc<T> {
    fn tag(&self, series: SeriesId, tags: &[Tag]) -> Result<(), DbError> {
        (**self).tag(series, tags)
    }
}
