//! Bucketed tier: entries grouped into epoch-aligned windows, one encoded column per attribute.
//!
//! A bucket holds a `time` column with each row's offset from the window start (in native
//! units of `multiplier` seconds) plus one column per attribute, all of equal length and
//! paired by position. A row missing an attribute stores NaN in that column, which reads back
//! as "attribute absent".
//!
//! Queries decode buckets in lockstep into two fixed-capacity entry buffers that are swapped
//! after every batch, so memory stays bounded by `batch_size` whatever the bucket sizes.

use crate::backend::{BucketCursor, BucketRepository, StoredBucket};
use crate::encoding::{decode_attribute, encode_attribute, BucketDecoder};
use crate::error::DbError;
use crate::level::LevelConfig;
use crate::query::{QueryEnd, QuerySink, QueryTally, DEFAULT_QUERY_BATCH_SIZE};
use crate::store::SeriesStore;
use crate::telemetry::{db_metrics, noop_event_listener, DbEventListener};
use crate::types::{
    truncate_to, truncate_to_second, Attributes, EncodedAttribute, Entry, SeriesId, Timestamp,
    Value, TIME_ATTRIBUTE,
};

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Bounds and column selection of one query, after truncation to the second.
struct QueryRange<'a> {
    start: Timestamp,
    end: Timestamp,
    attributes: &'a [String],
}

/// Series store over a bucket table.
#[derive(Debug)]
pub struct BucketStore<R> {
    repo: R,
    granularity: Duration,
    multiplier: f64,
    batch_size: usize,
    events: Arc<dyn DbEventListener>,
}

impl<R: BucketRepository> BucketStore<R> {
    /// Creates a store for one level. `config` is expected to be valid (see
    /// [`LevelConfig::validate`]).
    pub fn new(repo: R, config: &LevelConfig) -> Self {
        BucketStore {
            repo,
            granularity: config.granularity(),
            multiplier: config.multiplier,
            batch_size: DEFAULT_QUERY_BATCH_SIZE,
            events: noop_event_listener(),
        }
    }

    /// Sets the number of entries decoded per batch (at least one).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn DbEventListener>) -> Self {
        self.events = events;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn granularity(&self) -> Duration {
        self.granularity
    }

    /// Offset of a second-aligned timestamp inside its window, in native units.
    fn offset_of(&self, ts: Timestamp, window_start: Timestamp) -> u64 {
        let secs = (ts.timestamp() - window_start.timestamp()).max(0);
        if self.multiplier == 1.0 {
            secs as u64
        } else {
            (secs as f64 / self.multiplier).floor() as u64
        }
    }

    fn decode_rows(&self, bucket: &StoredBucket) -> Result<BTreeMap<u64, Attributes>, DbError> {
        let mut rows = BTreeMap::new();
        let time = match bucket.attributes.get(TIME_ATTRIBUTE) {
            Some(data) => decode_attribute(0, data)?,
            None if bucket.attributes.is_empty() => return Ok(rows),
            None => return Err(DbError::corruption("Bucket has no time column")),
        };
        let offsets: Vec<u64> = time.iter().map(|p| p.offset as u64).collect();
        for &offset in &offsets {
            rows.insert(offset, Attributes::new());
        }
        for (name, data) in &bucket.attributes {
            if name == TIME_ATTRIBUTE {
                continue;
            }
            let column = decode_attribute(0, data)?;
            if column.len() != offsets.len() {
                return Err(DbError::corruption(format!(
                    "Column {:?} has {} rows, time column has {}",
                    name,
                    column.len(),
                    offsets.len()
                )));
            }
            for (offset, point) in offsets.iter().zip(column) {
                if point.value.is_nan() {
                    continue;
                }
                if let Some(row) = rows.get_mut(offset) {
                    row.insert(name.clone(), point.value);
                }
            }
        }
        Ok(rows)
    }

    /// Walks buckets in ascending window order, emitting entries within `[start, end]`.
    fn merge<I>(
        &self,
        series: SeriesId,
        buckets: I,
        range: &QueryRange<'_>,
        sink: &QuerySink,
        tally: &mut QueryTally,
    ) -> QueryEnd
    where
        I: Iterator<Item = Result<StoredBucket, DbError>>,
    {
        let mut current = vec![Entry::new(DateTime::<Utc>::UNIX_EPOCH); self.batch_size];
        let mut next = current.clone();

        for bucket in buckets {
            let bucket = match bucket {
                Ok(b) => b,
                Err(e) => return QueryEnd::failed(sink, e),
            };
            tally.buckets += 1;
            let context = series.to_string();
            let window = bucket.start.timestamp();

            let mut reader = match EntryReader::open(&bucket, range.attributes, self.multiplier) {
                Ok(r) => r,
                Err(e) => return QueryEnd::failed(sink, e.in_bucket(&context, window)),
            };
            reader.reset(&mut current);
            reader.reset(&mut next);

            loop {
                let (n, batch_end) = reader.read_entries(&mut next);
                std::mem::swap(&mut current, &mut next);
                for entry in &current[..n] {
                    if entry.timestamp < range.start {
                        continue;
                    }
                    if entry.timestamp > range.end {
                        return QueryEnd::EarlyStop;
                    }
                    if !sink.emit(entry.clone()) {
                        return QueryEnd::Cancelled;
                    }
                    tally.entries += 1;
                }
                match batch_end {
                    BatchEnd::More => {}
                    BatchEnd::Exhausted => break,
                    BatchEnd::Failed(e) => {
                        return QueryEnd::failed(sink, e.in_bucket(&context, window))
                    }
                }
            }
        }
        QueryEnd::Exhausted
    }
}

impl<R: BucketRepository> SeriesStore for BucketStore<R> {
    /// Merges one entry into its bucket: fetch, decode, overwrite per attribute, re-encode, put.
    fn insert(&self, series: SeriesId, entry: &Entry) -> Result<(), DbError> {
        if entry.attributes.contains_key(TIME_ATTRIBUTE) {
            return Err(DbError::ReservedAttribute(TIME_ATTRIBUTE.to_string()));
        }
        let ts = truncate_to_second(entry.timestamp);
        let window_start = truncate_to(ts, self.granularity);
        let offset = self.offset_of(ts, window_start);

        let mut rows = match self.repo.fetch(series, window_start)? {
            Some(bucket) => self
                .decode_rows(&bucket)
                .map_err(|e| e.in_bucket(&series.to_string(), window_start.timestamp()))?,
            None => BTreeMap::new(),
        };
        let row = rows.entry(offset).or_default();
        for (name, value) in &entry.attributes {
            row.insert(name.clone(), *value);
        }

        let encoded = encode_rows(&rows)?;
        self.repo.put(series, self.granularity, window_start, &encoded)?;
        db_metrics::record_bucket_write(encoded.len());
        Ok(())
    }

    fn query(
        &self,
        series: SeriesId,
        start: Timestamp,
        end: Timestamp,
        attributes: &[String],
        sink: &QuerySink,
    ) {
        let mut tally = QueryTally::new(series);
        let range = QueryRange {
            start: truncate_to_second(start),
            end,
            attributes,
        };
        let first_window = truncate_to(range.start, self.granularity);

        let mut cursor = match self.repo.scan(series, first_window, end) {
            Ok(c) => c,
            Err(e) => {
                let outcome = QueryEnd::failed(sink, e);
                tally.finish(outcome, self.events.as_ref());
                return;
            }
        };

        let outcome = if self.repo.scans_in_order() {
            let outcome = self.merge(series, cursor.by_ref(), &range, sink, &mut tally);
            tally.closed(cursor.close(), sink, self.events.as_ref());
            outcome
        } else {
            let mut buckets = Vec::new();
            let mut scan_error = None;
            for bucket in cursor.by_ref() {
                match bucket {
                    Ok(b) => buckets.push(b),
                    Err(e) => {
                        scan_error = Some(e);
                        break;
                    }
                }
            }
            let closed = cursor.close();
            let outcome = match scan_error {
                Some(e) => QueryEnd::failed(sink, e),
                None => {
                    buckets.sort_by_key(|b| b.start);
                    let ordered = buckets.into_iter().map(Ok);
                    self.merge(series, ordered, &range, sink, &mut tally)
                }
            };
            tally.closed(closed, sink, self.events.as_ref());
            outcome
        };
        tally.finish(outcome, self.events.as_ref());
    }
}

/// Re-encodes every column of a bucket. Rows lacking an attribute get NaN in its column.
fn encode_rows(rows: &BTreeMap<u64, Attributes>) -> Result<Vec<EncodedAttribute>, DbError> {
    let names: BTreeSet<&str> = rows
        .values()
        .flat_map(|row| row.keys().map(String::as_str))
        .collect();

    let mut encoded = Vec::with_capacity(names.len() + 1);
    let time: Vec<(u64, Value)> = rows.keys().map(|&offset| (offset, 0.0)).collect();
    encoded.push(EncodedAttribute {
        name: TIME_ATTRIBUTE.to_string(),
        data: encode_attribute(&time)?,
    });
    for name in names {
        let column: Vec<(u64, Value)> = rows
            .iter()
            .map(|(&offset, row)| (offset, row.get(name).copied().unwrap_or(f64::NAN)))
            .collect();
        encoded.push(EncodedAttribute {
            name: name.to_string(),
            data: encode_attribute(&column)?,
        });
    }
    Ok(encoded)
}

/// Why [`EntryReader::read_entries`] stopped filling the buffer.
#[derive(Debug)]
enum BatchEnd {
    /// The buffer is full; the bucket may hold more rows.
    More,
    /// The time column is exhausted.
    Exhausted,
    Failed(DbError),
}

/// Lockstep decoder over the columns of one bucket.
struct EntryReader<'a> {
    window_start: Timestamp,
    anchor: i64,
    multiplier: f64,
    time: BucketDecoder<'a>,
    /// Requested columns. `None` for a column the bucket does not store.
    columns: Vec<(&'a str, Option<BucketDecoder<'a>>)>,
}

impl<'a> EntryReader<'a> {
    fn open(
        bucket: &'a StoredBucket,
        attributes: &'a [String],
        multiplier: f64,
    ) -> Result<Self, DbError> {
        let anchor = bucket.start.timestamp();
        let time_data = bucket
            .attributes
            .get(TIME_ATTRIBUTE)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let time = BucketDecoder::new(anchor, time_data)?;

        let mut columns = Vec::new();
        if attributes.is_empty() {
            let mut names: Vec<&'a String> = bucket
                .attributes
                .keys()
                .filter(|name| name.as_str() != TIME_ATTRIBUTE)
                .collect();
            names.sort();
            for name in names {
                let decoder = BucketDecoder::new(0, &bucket.attributes[name])?;
                columns.push((name.as_str(), Some(decoder)));
            }
        } else {
            for name in attributes {
                let decoder = match bucket.attributes.get(name) {
                    Some(data) => Some(BucketDecoder::new(0, data)?),
                    None => None,
                };
                columns.push((name.as_str(), decoder));
            }
        }

        Ok(EntryReader {
            window_start: bucket.start,
            anchor,
            multiplier,
            time,
            columns,
        })
    }

    /// Drops attributes of a previous bucket from reused entries.
    fn reset(&self, buffer: &mut [Entry]) {
        for entry in buffer.iter_mut() {
            entry
                .attributes
                .retain(|name, _| self.columns.iter().any(|(c, _)| *c == name.as_str()));
        }
    }

    fn timestamp_of(&self, ticks: i64) -> Result<Timestamp, DbError> {
        let delta = if self.multiplier == 1.0 {
            TimeDelta::try_seconds(ticks)
        } else {
            TimeDelta::try_milliseconds((ticks as f64 * self.multiplier * 1000.0).round() as i64)
        };
        delta
            .and_then(|d| self.window_start.checked_add_signed(d))
            .ok_or_else(|| {
                DbError::corruption(format!("Offset {} overflows the timestamp range", ticks))
            })
    }

    /// Decodes up to `buffer.len()` rows into the front of `buffer`, reusing its entries.
    ///
    /// Returns how many entries were filled; rows decoded before a failure are valid.
    fn read_entries(&mut self, buffer: &mut [Entry]) -> (usize, BatchEnd) {
        let mut n = 0;
        while n < buffer.len() {
            let point = match self.time.next_point() {
                Ok(Some(p)) => p,
                Ok(None) => return (n, BatchEnd::Exhausted),
                Err(e) => return (n, BatchEnd::Failed(e)),
            };
            let ticks = point.offset - self.anchor;
            let timestamp = match self.timestamp_of(ticks) {
                Ok(ts) => ts,
                Err(e) => return (n, BatchEnd::Failed(e)),
            };

            let entry = &mut buffer[n];
            entry.timestamp = timestamp;
            for (name, decoder) in self.columns.iter_mut() {
                let decoder = match decoder {
                    Some(d) => d,
                    None => {
                        entry.attributes.remove(*name);
                        continue;
                    }
                };
                match decoder.next_point() {
                    Ok(Some(p)) if p.offset != ticks => {
                        return (
                            n,
                            BatchEnd::Failed(DbError::corruption(format!(
                                "Column {:?} is out of step with the time column",
                                name
                            ))),
                        );
                    }
                    Ok(Some(p)) => set_attribute(&mut entry.attributes, *name, p.value),
                    Ok(None) => {
                        return (
                            n,
                            BatchEnd::Failed(DbError::corruption(format!(
                                "Column {:?} is shorter than the time column",
                                name
                            ))),
                        );
                    }
                    Err(e) => return (n, BatchEnd::Failed(e)),
                }
            }
            n += 1;
        }
        (n, BatchEnd::More)
    }
}

/// Updates an attribute in place; NaN removes it.
#[inline]
fn set_attribute(attributes: &mut Attributes, name: &str, value: Value) {
    if value.is_nan() {
        attributes.remove(name);
    } else if let Some(slot) = attributes.get_mut(name) {
        *slot = value;
    } else {
        attributes.insert(name.to_string(), value);
    }
}
