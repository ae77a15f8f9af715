//! Integration tests for the level cascade: fan-out, handler wiring, error propagation.

use chrono::{TimeDelta, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tierdb::encoding::decode_attribute;
use tierdb::query::QuerySink;
use tierdb::*;

fn at(secs: i64) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs)
}

fn level(name: &str, secs: u64) -> LevelConfig {
    LevelConfig::new(name, Duration::from_secs(secs), Duration::from_secs(secs * 1000))
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
}

/// A level store whose backend is down.
#[derive(Debug)]
struct UnavailableStore;

impl SeriesStore for UnavailableStore {
    fn insert(&self, _series: SeriesId, _entry: &Entry) -> Result<(), DbError> {
        Err(DbError::Backend("connection refused".to_string()))
    }

    fn query(&self, _: SeriesId, _: Timestamp, _: Timestamp, _: &[String], sink: &QuerySink) {
        sink.fail(DbError::Backend("connection refused".to_string()));
    }
}

/// Forwards only entries whose timestamp falls on an even second.
struct EvenSecondsFilter {
    handler: Handler,
}

impl Filter for EvenSecondsFilter {
    fn insert(&self, series: SeriesId, entry: &Entry) -> Result<(), DbError> {
        if entry.timestamp.timestamp() % 2 == 0 {
            self.handler.call(series, entry)
        } else {
            Ok(())
        }
    }
}

fn window_offsets(table: &MemoryBucketTable, series: SeriesId, start: Timestamp) -> Vec<i64> {
    let bucket = table.fetch(series, start).unwrap().expect("bucket stored");
    decode_attribute(0, &bucket.attributes[TIME_ATTRIBUTE])
        .unwrap()
        .iter()
        .map(|p| p.offset)
        .collect()
}

#[test]
fn test_single_insert_fans_out_to_every_level() {
    let config = TimeDbConfig {
        levels: vec![level("second", 1), level("minute", 60), level("hour", 3600)],
        ..TimeDbConfig::default()
    };
    let (db, backend) = TimeDb::open_in_memory(&config, Arc::new(TracingEventListener)).unwrap();
    let series: SeriesId = "4f1c1d2e-9b7a-4c61-8f0e-2a6d3b5c7e91".parse().unwrap();

    db.put_value(series, 10.0, at(30)).unwrap();

    assert_eq!(backend.cache.point_count(series).unwrap(), 1);
    assert_eq!(window_offsets(&backend.levels[0], series, at(0)), vec![30]);
    assert_eq!(window_offsets(&backend.levels[1], series, at(0)), vec![30]);
    assert_eq!(
        backend.levels[1].granularity_of(series, at(0)).unwrap(),
        Some(Duration::from_secs(3600))
    );

    for level in 0..3 {
        let got = db
            .query(level, series, at(0), at(59), &[])
            .unwrap()
            .collect_entries()
            .unwrap();
        assert_eq!(got, vec![Entry::raw(at(30), 10.0)], "level {}", level);
    }
}

#[test]
fn test_later_writes_merge_into_existing_buckets() {
    let (db, backend) =
        TimeDb::open_in_memory(&TimeDbConfig::default(), Arc::new(TracingEventListener)).unwrap();
    let series = SeriesId::new_random();

    for secs in [30, 10, 95, 10] {
        db.put_value(series, secs as f64, at(secs)).unwrap();
    }

    assert_eq!(backend.levels[0].bucket_count(series).unwrap(), 2);
    assert_eq!(window_offsets(&backend.levels[0], series, at(0)), vec![10, 30]);
    assert_eq!(window_offsets(&backend.levels[1], series, at(0)), vec![10, 30, 95]);
}

#[test]
fn test_store_failure_stops_cascade_without_rollback() {
    let events = Arc::new(CollectEvents::default());
    let backend = MemoryBackend::new(1);
    let db = TimeDb::builder()
        .events(events.clone())
        .cache_level(level("raw", 1), Arc::clone(&backend.cache))
        .level(level("minute", 60), PassThroughFilter::factory(), UnavailableStore)
        .bucket_level(level("hour", 3600), Arc::clone(&backend.levels[0]))
        .build()
        .unwrap();
    let series = SeriesId::new_random();

    let err = db.put_value(series, 1.0, at(5)).unwrap_err();
    assert!(matches!(err, DbError::Backend(ref msg) if msg == "connection refused"));

    // The finest level committed; the level after the failure never saw the entry.
    assert_eq!(backend.cache.point_count(series).unwrap(), 1);
    assert_eq!(backend.levels[0].bucket_count(series).unwrap(), 0);

    assert!(events.events().contains(&DbEvent::CascadeAborted {
        level: 1,
        series: series.to_string(),
        error: err.to_string(),
    }));
}

#[test]
fn test_external_terminal_level_is_not_written() {
    let events = Arc::new(CollectEvents::default());
    let config = TimeDbConfig {
        terminal_level: TerminalLevel::External,
        ..TimeDbConfig::default()
    };
    let (db, backend) = TimeDb::open_in_memory(&config, events.clone()).unwrap();
    let series = SeriesId::new_random();

    db.put_value(series, 1.0, at(0)).unwrap();

    assert_eq!(db.terminal(), TerminalLevel::External);
    assert_eq!(backend.levels[0].bucket_count(series).unwrap(), 1);
    assert_eq!(backend.levels[1].bucket_count(series).unwrap(), 0);
    assert!(events.events().contains(&DbEvent::TerminalEmissionDropped {
        level: 2,
        series: series.to_string(),
    }));
}

#[test]
fn test_custom_filter_gates_coarser_levels() {
    let backend = MemoryBackend::new(1);
    let db = TimeDb::builder()
        .level(
            level("raw", 1),
            |handler| Arc::new(EvenSecondsFilter { handler }) as Arc<dyn Filter>,
            CacheStore::new(Arc::clone(&backend.cache)),
        )
        .bucket_level(level("minute", 60), Arc::clone(&backend.levels[0]))
        .build()
        .unwrap();
    let series = SeriesId::new_random();

    for secs in 0..6 {
        db.put_value(series, secs as f64, at(secs)).unwrap();
    }

    // The gate sits in front of the raw level's own store too.
    assert_eq!(backend.cache.point_count(series).unwrap(), 3);
    assert_eq!(window_offsets(&backend.levels[0], series, at(0)), vec![0, 2, 4]);
}

#[test]
fn test_put_many_reports_first_failing_series() {
    let backend = MemoryBackend::new(0);
    let db = TimeDb::builder()
        .cache_level(level("raw", 1), Arc::clone(&backend.cache))
        .build()
        .unwrap();
    let good = SeriesId::new_random();
    let bad = SeriesId::new_random();

    let batch = vec![
        (good, Entry::raw(at(0), 1.0)),
        (bad, Entry::new(at(0)).with("avg", 1.0)),
        (good, Entry::raw(at(1), 2.0)),
        (bad, Entry::raw(at(1), 2.0)),
    ];
    let err = db.put_many(&batch).unwrap_err();
    assert!(matches!(err, DbError::MissingAttribute { .. }));

    // Other series are unaffected; the failing series stops at its failing entry.
    assert_eq!(backend.cache.point_count(good).unwrap(), 2);
    assert_eq!(backend.cache.point_count(bad).unwrap(), 0);
}

#[test]
fn test_put_many_spreads_series_across_threads() {
    let (db, backend) =
        TimeDb::open_in_memory(&TimeDbConfig::default(), Arc::new(TracingEventListener)).unwrap();
    let series: Vec<SeriesId> = (0..16).map(|_| SeriesId::new_random()).collect();
    let batch: Vec<(SeriesId, Entry)> = (0..640)
        .map(|i| (series[i % 16], Entry::raw(at((i / 16) as i64), i as f64)))
        .collect();

    db.put_many(&batch).unwrap();

    for id in &series {
        assert_eq!(backend.cache.point_count(*id).unwrap(), 40);
        let minute = db
            .query(1, *id, at(0), at(59), &[])
            .unwrap()
            .collect_entries()
            .unwrap();
        assert_eq!(minute.len(), 40);
    }
}
