//! In-memory backing tables.
//!
//! Rows are kept per series in `BTreeMap`s keyed by time, so every scan comes back in
//! ascending order. Scans copy the matching rows out under a read lock; the returned cursor
//! holds no lock.

use crate::backend::{
    BucketCursor, BucketRepository, CachePoint, PointCursor, PointTable, StoredBucket, TagStore,
};
use crate::error::DbError;
use crate::types::{truncate_to_second, EncodedAttribute, SeriesId, Tag, Timestamp, Value};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Cursor over rows copied out of an in-memory table.
#[derive(Debug)]
pub struct MemoryCursor<T> {
    rows: std::vec::IntoIter<T>,
}

impl<T> MemoryCursor<T> {
    fn new(rows: Vec<T>) -> Self {
        MemoryCursor {
            rows: rows.into_iter(),
        }
    }
}

impl<T> Iterator for MemoryCursor<T> {
    type Item = Result<T, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next().map(Ok)
    }
}

impl BucketCursor for MemoryCursor<StoredBucket> {
    fn close(self) -> Result<(), DbError> {
        Ok(())
    }
}

impl PointCursor for MemoryCursor<CachePoint> {
    fn close(self) -> Result<(), DbError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BucketRow {
    granularity_secs: u64,
    attributes: HashMap<String, Vec<u8>>,
}

/// Serializable copy of a [`MemoryBucketTable`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketTableImage(HashMap<SeriesId, BTreeMap<Timestamp, BucketRow>>);

/// Bucket table keyed by `(series, window start)`.
#[derive(Debug, Default)]
pub struct MemoryBucketTable {
    series_data: RwLock<HashMap<SeriesId, BTreeMap<Timestamp, BucketRow>>>,
}

impl MemoryBucketTable {
    /// Number of buckets stored for a series.
    pub fn bucket_count(&self, series: SeriesId) -> Result<usize, DbError> {
        let guard = self.series_data.read()?;
        Ok(guard.get(&series).map_or(0, |rows| rows.len()))
    }

    /// Granularity recorded with a stored bucket.
    pub fn granularity_of(
        &self,
        series: SeriesId,
        start: Timestamp,
    ) -> Result<Option<Duration>, DbError> {
        let guard = self.series_data.read()?;
        Ok(guard
            .get(&series)
            .and_then(|rows| rows.get(&truncate_to_second(start)))
            .map(|row| Duration::from_secs(row.granularity_secs)))
    }

    pub fn image(&self) -> Result<BucketTableImage, DbError> {
        Ok(BucketTableImage(self.series_data.read()?.clone()))
    }

    pub fn restore(&self, image: BucketTableImage) -> Result<(), DbError> {
        *self.series_data.write()? = image.0;
        Ok(())
    }
}

impl BucketRepository for MemoryBucketTable {
    type Cursor = MemoryCursor<StoredBucket>;

    fn put(
        &self,
        series: SeriesId,
        granularity: Duration,
        start: Timestamp,
        attributes: &[EncodedAttribute],
    ) -> Result<(), DbError> {
        let row = BucketRow {
            granularity_secs: granularity.as_secs(),
            attributes: attributes
                .iter()
                .map(|a| (a.name.clone(), a.data.clone()))
                .collect(),
        };
        let mut guard = self.series_data.write()?;
        guard
            .entry(series)
            .or_default()
            .insert(truncate_to_second(start), row);
        Ok(())
    }

    fn fetch(&self, series: SeriesId, start: Timestamp) -> Result<Option<StoredBucket>, DbError> {
        let key = truncate_to_second(start);
        let guard = self.series_data.read()?;
        Ok(guard.get(&series).and_then(|rows| rows.get(&key)).map(|row| StoredBucket {
            start: key,
            attributes: row.attributes.clone(),
        }))
    }

    fn scan(
        &self,
        series: SeriesId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Self::Cursor, DbError> {
        if from > to {
            return Ok(MemoryCursor::new(Vec::new()));
        }
        let guard = self.series_data.read()?;
        let rows = guard
            .get(&series)
            .map(|rows| {
                rows.range(from..=to)
                    .map(|(start, row)| StoredBucket {
                        start: *start,
                        attributes: row.attributes.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(MemoryCursor::new(rows))
    }
}

/// Serializable copy of a [`MemoryPointTable`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointTableImage(HashMap<SeriesId, BTreeMap<Timestamp, Value>>);

/// Cache table keyed by `(series, timestamp)`.
#[derive(Debug, Default)]
pub struct MemoryPointTable {
    series_data: RwLock<HashMap<SeriesId, BTreeMap<Timestamp, Value>>>,
}

impl MemoryPointTable {
    /// Number of points stored for a series.
    pub fn point_count(&self, series: SeriesId) -> Result<usize, DbError> {
        let guard = self.series_data.read()?;
        Ok(guard.get(&series).map_or(0, |rows| rows.len()))
    }

    pub fn image(&self) -> Result<PointTableImage, DbError> {
        Ok(PointTableImage(self.series_data.read()?.clone()))
    }

    pub fn restore(&self, image: PointTableImage) -> Result<(), DbError> {
        *self.series_data.write()? = image.0;
        Ok(())
    }
}

impl PointTable for MemoryPointTable {
    type Cursor = MemoryCursor<CachePoint>;

    fn upsert(&self, series: SeriesId, timestamp: Timestamp, value: Value) -> Result<(), DbError> {
        let mut guard = self.series_data.write()?;
        guard.entry(series).or_default().insert(timestamp, value);
        Ok(())
    }

    fn scan(
        &self,
        series: SeriesId,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Self::Cursor, DbError> {
        if from > to {
            return Ok(MemoryCursor::new(Vec::new()));
        }
        let guard = self.series_data.read()?;
        let rows = guard
            .get(&series)
            .map(|rows| {
                rows.range(from..=to)
                    .map(|(&timestamp, &value)| CachePoint { timestamp, value })
                    .collect()
            })
            .unwrap_or_default();
        Ok(MemoryCursor::new(rows))
    }
}

/// Serializable copy of a [`MemoryTagStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagTableImage(BTreeSet<(String, String, SeriesId)>);

/// Tag table keyed by `(tag, value, series)`.
#[derive(Debug, Default)]
pub struct MemoryTagStore {
    rows: RwLock<BTreeSet<(String, String, SeriesId)>>,
}

impl MemoryTagStore {
    /// All series carrying `name=value`, in identifier order.
    pub fn series_with(&self, name: &str, value: &str) -> Result<Vec<SeriesId>, DbError> {
        let guard = self.rows.read()?;
        Ok(guard
            .iter()
            .filter(|(n, v, _)| n == name && v == value)
            .map(|(_, _, s)| *s)
            .collect())
    }

    /// Every tag written for a series.
    pub fn tags_of(&self, series: SeriesId) -> Result<Vec<Tag>, DbError> {
        let guard = self.rows.read()?;
        Ok(guard
            .iter()
            .filter(|(_, _, s)| *s == series)
            .map(|(n, v, _)| Tag::new(n, v))
            .collect())
    }

    pub fn image(&self) -> Result<TagTableImage, DbError> {
        Ok(TagTableImage(self.rows.read()?.clone()))
    }

    pub fn restore(&self, image: TagTableImage) -> Result<(), DbError> {
        *self.rows.write()? = image.0;
        Ok(())
    }
}

impl TagStore for MemoryTagStore {
    fn tag(&self, series: SeriesId, tags: &[Tag]) -> Result<(), DbError> {
        // Validate the whole batch before touching the table.
        if let Some(bad) = tags.iter().find(|t| t.name.is_empty()) {
            return Err(DbError::InvalidTag(format!("empty tag name (value {:?})", bad.value)));
        }
        let mut guard = self.rows.write()?;
        for t in tags {
            guard.insert((t.name.clone(), t.value.clone(), series));
        }
        Ok(())
    }
}

/// Serializable copy of a whole [`MemoryBackend`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendImage {
    pub cache: PointTableImage,
    pub levels: Vec<BucketTableImage>,
    pub tags: TagTableImage,
}

/// The full set of in-memory tables backing one database: a cache table for the finest level
/// and one bucket table per bucketed level.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    pub cache: Arc<MemoryPointTable>,
    pub levels: Vec<Arc<MemoryBucketTable>>,
    pub tags: Arc<MemoryTagStore>,
}

impl MemoryBackend {
    pub fn new(bucketed_levels: usize) -> Self {
        MemoryBackend {
            cache: Arc::new(MemoryPointTable::default()),
            levels: (0..bucketed_levels)
                .map(|_| Arc::new(MemoryBucketTable::default()))
                .collect(),
            tags: Arc::new(MemoryTagStore::default()),
        }
    }

    pub fn image(&self) -> Result<BackendImage, DbError> {
        Ok(BackendImage {
            cache: self.cache.image()?,
            levels: self
                .levels
                .iter()
                .map(|t| t.image())
                .collect::<Result<_, _>>()?,
            tags: self.tags.image()?,
        })
    }

    /// Replaces the contents of every table. The image must have one bucket table per level.
    pub fn restore(&self, image: BackendImage) -> Result<(), DbError> {
        if image.levels.len() != self.levels.len() {
            return Err(DbError::Corruption {
                details: format!(
                    "Image has {} bucket tables, backend has {}",
                    image.levels.len(),
                    self.levels.len()
                ),
                series: None,
                timestamp: None,
            });
        }
        self.cache.restore(image.cache)?;
        for (table, level) in self.levels.iter().zip(image.levels) {
            table.restore(level)?;
        }
        self.tags.restore(image.tags)
    }
}
