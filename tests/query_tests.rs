//! Integration tests for the bucketed read path: early termination, ordering fallback,
//! cursor lifecycle, cancellation, and error streams.

use chrono::{TimeDelta, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tierdb::backend::{BucketCursor, StoredBucket};
use tierdb::encoding::encode_attribute;
use tierdb::query::channel;
use tierdb::types::EncodedAttribute;
use tierdb::{
    BucketRepository, BucketStore, DbError, DbEvent, DbEventListener, Entry, LevelConfig,
    MemoryBucketTable, MemoryPointTable, PassThroughFilter, QueryOptions, QuerySink, SeriesId,
    SeriesStore, TimeDb, TimeDbConfig, Timestamp, TracingEventListener, RAW_ATTRIBUTE,
    TIME_ATTRIBUTE,
};

fn at(secs: i64) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs)
}

fn minute() -> LevelConfig {
    LevelConfig::new("minute", Duration::from_secs(60), Duration::from_secs(86400))
}

#[derive(Debug, Default)]
struct CollectEvents(Mutex<Vec<DbEvent>>);

impl DbEventListener for CollectEvents {
    fn on_event(&self, event: DbEvent) {
        self.0.lock().unwrap().push(event);
    }
}

impl CollectEvents {
    fn events(&self) -> Vec<DbEvent> {
        self.0.lock().unwrap().clone()
    }

    /// Waits for the background producer to report how its query ended.
    fn wait_for_outcome(&self) -> DbEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let found = self.events().into_iter().find(|e| {
                matches!(
                    e,
                    DbEvent::QueryFinished { .. }
                        | DbEvent::QueryCancelled { .. }
                        | DbEvent::QueryFailed { .. }
                )
            });
            if let Some(e) = found {
                return e;
            }
            assert!(Instant::now() < deadline, "query never finished");
            thread::sleep(Duration::from_millis(5));
        }
    }
}

#[derive(Debug, Default)]
struct Tracker {
    pulled: AtomicUsize,
    closed: AtomicUsize,
}

/// Bucket table wrapper that counts cursor activity and can misbehave on demand.
///
/// Its scans ignore the upper bound, so the store itself must stop at the end of the range.
#[derive(Debug, Default)]
struct TrackedTable {
    inner: MemoryBucketTable,
    tracker: Arc<Tracker>,
    unordered: bool,
    fail_close: bool,
    fail_after: Option<usize>,
}

struct TrackedCursor {
    rows: std::vec::IntoIter<StoredBucket>,
    tracker: Arc<Tracker>,
    fail_close: bool,
    fail_after: Option<usize>,
}

impl Iterator for TrackedCursor {
    type Item = Result<StoredBucket, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        let pulled = self.tracker.pulled.load(Ordering::SeqCst);
        if self.fail_after == Some(pulled) {
            self.fail_after = None;
            return Some(Err(DbError::Backend("scan interrupted".to_string())));
        }
        let bucket = self.rows.next()?;
        self.tracker.pulled.fetch_add(1, Ordering::SeqCst);
        Some(Ok(bucket))
    }
}

impl BucketCursor for TrackedCursor {
    fn close(self) -> Result<(), DbError> {
        self.tracker.closed.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            Err(DbError::Backend("cursor close failed".to_string()))
        } else {
            Ok(())
        }
    }
}

impl BucketRepository for TrackedTable {
    type Cursor = TrackedCursor;

    fn put(
        &self,
        series: SeriesId,
        granularity: Duration,
        start: Timestamp,
        attributes: &[EncodedAttribute],
    ) -> Result<(), DbError> {
        self.inner.put(series, granularity, start, attributes)
    }

    fn fetch(&self, series: SeriesId, start: Timestamp) -> Result<Option<StoredBucket>, DbError> {
        self.inner.fetch(series, start)
    }

    fn scan(
        &self,
        series: SeriesId,
        from: Timestamp,
        _to: Timestamp,
    ) -> Result<Self::Cursor, DbError> {
        let mut rows = self
            .inner
            .scan(series, from, Timestamp::MAX_UTC)?
            .collect::<Result<Vec<_>, DbError>>()?;
        if self.unordered {
            rows.reverse();
        }
        Ok(TrackedCursor {
            rows: rows.into_iter(),
            tracker: Arc::clone(&self.tracker),
            fail_close: self.fail_close,
            fail_after: self.fail_after,
        })
    }

    fn scans_in_order(&self) -> bool {
        !self.unordered
    }
}

fn tracked_db(table: TrackedTable, options: QueryOptions, events: Arc<CollectEvents>) -> TimeDb {
    let raw = LevelConfig::new("raw", Duration::from_secs(1), Duration::from_secs(3600));
    TimeDb::builder()
        .events(events)
        .query_options(options)
        .cache_level(raw, MemoryPointTable::default())
        .bucket_level(minute(), table)
        .build()
        .unwrap()
}

fn seconds(entries: &[Entry]) -> Vec<i64> {
    entries.iter().map(|e| (e.timestamp - at(0)).num_seconds()).collect()
}

#[test]
fn test_early_stop_never_fetches_another_bucket() {
    let tracker = Arc::new(Tracker::default());
    let events = Arc::new(CollectEvents::default());
    let table = TrackedTable {
        tracker: Arc::clone(&tracker),
        ..TrackedTable::default()
    };
    let db = tracked_db(table, QueryOptions::default(), events.clone());
    let series = SeriesId::new_random();
    for secs in [5, 15, 25, 65, 125] {
        db.put_value(series, secs as f64, at(secs)).unwrap();
    }

    let got = db
        .query(1, series, at(10), at(20), &[])
        .unwrap()
        .collect_entries()
        .unwrap();

    assert_eq!(got, vec![Entry::raw(at(15), 15.0)]);
    assert_eq!(tracker.pulled.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.closed.load(Ordering::SeqCst), 1);
    assert!(matches!(
        events.wait_for_outcome(),
        DbEvent::QueryFinished { entries: 1, buckets: 1, early_stop: true, .. }
    ));
}

#[test]
fn test_unordered_scans_are_sorted_before_merge() {
    let tracker = Arc::new(Tracker::default());
    let table = TrackedTable {
        tracker: Arc::clone(&tracker),
        unordered: true,
        ..TrackedTable::default()
    };
    let db = tracked_db(table, QueryOptions::default(), Arc::new(CollectEvents::default()));
    let series = SeriesId::new_random();
    for secs in [250, 10, 130, 70, 190, 75] {
        db.put_value(series, secs as f64, at(secs)).unwrap();
    }

    let got = db
        .query(1, series, at(0), at(200), &[])
        .unwrap()
        .collect_entries()
        .unwrap();

    assert_eq!(seconds(&got), vec![10, 70, 75, 130, 190]);
    assert_eq!(tracker.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_batches_do_not_leak_attributes_between_buckets() {
    let table = TrackedTable::default();
    let options = QueryOptions {
        batch_size: 1,
        channel_capacity: 4,
    };
    let db = tracked_db(table, options, Arc::new(CollectEvents::default()));
    let series = SeriesId::new_random();
    db.put(series, &Entry::raw(at(1), 1.0).with("min", 0.5)).unwrap();
    db.put(series, &Entry::raw(at(2), 2.0)).unwrap();
    db.put(series, &Entry::raw(at(61), 3.0).with("max", 9.0)).unwrap();

    let got = db
        .query(1, series, at(0), at(119), &[])
        .unwrap()
        .collect_entries()
        .unwrap();

    assert_eq!(
        got,
        vec![
            Entry::raw(at(1), 1.0).with("min", 0.5),
            Entry::raw(at(2), 2.0),
            Entry::raw(at(61), 3.0).with("max", 9.0),
        ]
    );
}

#[test]
fn test_mutating_an_emitted_entry_leaves_later_entries_intact() {
    let options = QueryOptions {
        batch_size: 1,
        channel_capacity: 1,
    };
    let db = tracked_db(TrackedTable::default(), options, Arc::new(CollectEvents::default()));
    let series = SeriesId::new_random();
    db.put(series, &Entry::raw(at(1), 1.0).with("max", 5.0)).unwrap();
    db.put(series, &Entry::raw(at(2), 2.0)).unwrap();
    db.put(series, &Entry::raw(at(3), 3.0).with("max", 7.0)).unwrap();

    let mut stream = db.query(1, series, at(0), at(59), &[]).unwrap();
    let mut first = stream.next().unwrap().unwrap();
    assert_eq!(first, Entry::raw(at(1), 1.0).with("max", 5.0));
    first.attributes.insert(RAW_ATTRIBUTE.to_string(), -1.0);
    first.attributes.insert("min".to_string(), -9.0);
    first.timestamp = at(2);

    // Each entry passes through the same single-slot buffer.
    let second = stream.next().unwrap().unwrap();
    assert_eq!(second, Entry::raw(at(2), 2.0));
    first.attributes.clear();
    let third = stream.next().unwrap().unwrap();
    assert_eq!(third, Entry::raw(at(3), 3.0).with("max", 7.0));
    assert!(stream.next().is_none());
}

/// A store whose query reports many errors before returning.
#[derive(Debug)]
struct FailingStore {
    failures: usize,
}

impl SeriesStore for FailingStore {
    fn insert(&self, _series: SeriesId, _entry: &Entry) -> Result<(), DbError> {
        Ok(())
    }

    fn query(&self, _: SeriesId, _: Timestamp, _: Timestamp, _: &[String], sink: &QuerySink) {
        if !sink.emit(Entry::raw(at(0), 0.0)) {
            return;
        }
        for i in 0..self.failures {
            sink.fail(DbError::Backend(format!("replica {} unreachable", i)));
        }
    }
}

#[test]
fn test_many_reported_errors_reach_the_consumer() {
    let db = TimeDb::builder()
        .level(
            LevelConfig::new("raw", Duration::from_secs(1), Duration::from_secs(3600)),
            PassThroughFilter::factory(),
            FailingStore { failures: 16 },
        )
        .build()
        .unwrap();
    let series = SeriesId::new_random();

    let stream = db.query(0, series, at(0), at(59), &[]).unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(stream.collect_entries());
    });
    let partial = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("consumer finished")
        .unwrap_err();

    assert_eq!(partial.entries, vec![Entry::raw(at(0), 0.0)]);
    assert_eq!(partial.errors.len(), 16);
    assert!(matches!(
        &partial.errors[15],
        DbError::Backend(msg) if msg == "replica 15 unreachable"
    ));
}

#[test]
fn test_dropping_the_stream_cancels_the_query() {
    let tracker = Arc::new(Tracker::default());
    let events = Arc::new(CollectEvents::default());
    let table = TrackedTable {
        tracker: Arc::clone(&tracker),
        ..TrackedTable::default()
    };
    let options = QueryOptions {
        batch_size: 4,
        channel_capacity: 1,
    };
    let db = tracked_db(table, options, events.clone());
    let series = SeriesId::new_random();
    for secs in 0..600 {
        db.put_value(series, secs as f64, at(secs)).unwrap();
    }

    let mut stream = db.query(1, series, at(0), at(599), &[]).unwrap();
    let head: Vec<Entry> = stream.by_ref().take(3).map(Result::unwrap).collect();
    assert_eq!(seconds(&head), vec![0, 1, 2]);
    drop(stream);

    assert!(matches!(events.wait_for_outcome(), DbEvent::QueryCancelled { .. }));
    assert_eq!(tracker.closed.load(Ordering::SeqCst), 1);
    assert!(tracker.pulled.load(Ordering::SeqCst) < 10);
}

#[test]
fn test_scan_error_follows_valid_prefix() {
    let tracker = Arc::new(Tracker::default());
    let events = Arc::new(CollectEvents::default());
    let table = TrackedTable {
        tracker: Arc::clone(&tracker),
        fail_after: Some(1),
        ..TrackedTable::default()
    };
    let db = tracked_db(table, QueryOptions::default(), events.clone());
    let series = SeriesId::new_random();
    for secs in [1, 2, 61] {
        db.put_value(series, secs as f64, at(secs)).unwrap();
    }

    let partial = db
        .query(1, series, at(0), at(119), &[])
        .unwrap()
        .collect_entries()
        .unwrap_err();

    assert_eq!(seconds(&partial.entries), vec![1, 2]);
    assert_eq!(partial.errors.len(), 1);
    assert!(matches!(&partial.errors[0], DbError::Backend(msg) if msg == "scan interrupted"));
    assert_eq!(tracker.closed.load(Ordering::SeqCst), 1);
    assert!(matches!(events.wait_for_outcome(), DbEvent::QueryFailed { .. }));
}

#[test]
fn test_cursor_close_error_is_reported() {
    let events = Arc::new(CollectEvents::default());
    let table = TrackedTable {
        fail_close: true,
        ..TrackedTable::default()
    };
    let db = tracked_db(table, QueryOptions::default(), events.clone());
    let series = SeriesId::new_random();
    db.put_value(series, 1.0, at(1)).unwrap();

    let partial = db
        .query(1, series, at(0), at(59), &[])
        .unwrap()
        .collect_entries()
        .unwrap_err();

    assert_eq!(partial.entries, vec![Entry::raw(at(1), 1.0)]);
    assert!(matches!(&partial.errors[..], [DbError::Backend(msg)] if msg == "cursor close failed"));
    events.wait_for_outcome();
    assert!(events
        .events()
        .iter()
        .any(|e| matches!(e, DbEvent::CursorCloseFailed { .. })));
}

#[test]
fn test_decode_error_follows_valid_prefix() {
    let (db, backend) =
        TimeDb::open_in_memory(&TimeDbConfig::default(), Arc::new(TracingEventListener)).unwrap();
    let series = SeriesId::new_random();
    let offsets = [(1, 0.0), (2, 0.0), (3, 0.0)];
    let values = [(1, 1.0), (2, 2.0)];
    backend.levels[0]
        .put(
            series,
            Duration::from_secs(60),
            at(0),
            &[
                EncodedAttribute {
                    name: TIME_ATTRIBUTE.to_string(),
                    data: encode_attribute(&offsets).unwrap(),
                },
                EncodedAttribute {
                    name: RAW_ATTRIBUTE.to_string(),
                    data: encode_attribute(&values).unwrap(),
                },
            ],
        )
        .unwrap();

    let partial = db
        .query(1, series, at(0), at(59), &[])
        .unwrap()
        .collect_entries()
        .unwrap_err();

    assert_eq!(partial.entries, vec![Entry::raw(at(1), 1.0), Entry::raw(at(2), 2.0)]);
    match &partial.errors[0] {
        DbError::Corruption { series: s, timestamp, .. } => {
            assert_eq!(s.as_deref(), Some(series.to_string().as_str()));
            assert_eq!(*timestamp, Some(at(0).timestamp()));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_bucket_query_is_ordered_and_in_range(
        writes in prop::collection::vec((0i64..600, -1.0e6f64..1.0e6), 0..40),
        bounds in (0i64..600, 0i64..600),
        batch_size in 1usize..8,
    ) {
        let store = BucketStore::new(MemoryBucketTable::default(), &minute())
            .with_batch_size(batch_size);
        let series = SeriesId::new_random();
        let mut expected = BTreeMap::new();
        for (secs, value) in &writes {
            store.insert(series, &Entry::raw(at(*secs), *value)).unwrap();
            expected.insert(*secs, *value);
        }
        let (lo, hi) = (bounds.0.min(bounds.1), bounds.0.max(bounds.1));

        let (sink, stream) = channel(1024);
        store.query(series, at(lo), at(hi), &[], &sink);
        drop(sink);
        let got: Vec<(i64, f64)> = stream
            .collect_entries()
            .unwrap()
            .iter()
            .map(|e| ((e.timestamp - at(0)).num_seconds(), e.get(RAW_ATTRIBUTE).unwrap()))
            .collect();
        let want: Vec<(i64, f64)> = expected.range(lo..=hi).map(|(k, v)| (*k, *v)).collect();
        prop_assert_eq!(got, want);
    }
}
