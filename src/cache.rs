//! Raw tier: one row per `(series, timestamp)` holding the `raw` value.

use crate::backend::{PointCursor, PointTable};
use crate::error::DbError;
use crate::query::{QueryEnd, QuerySink, QueryTally};
use crate::store::SeriesStore;
use crate::telemetry::{noop_event_listener, DbEventListener};
use crate::types::{Entry, SeriesId, Timestamp, RAW_ATTRIBUTE};

use std::sync::Arc;

/// Series store over a raw point table.
///
/// Inserts keep the full timestamp and only the `raw` attribute; queries return every row in
/// `[start, end]` as a single-attribute entry, whatever attributes were requested.
#[derive(Debug)]
pub struct CacheStore<T> {
    table: T,
    events: Arc<dyn DbEventListener>,
}

impl<T: PointTable> CacheStore<T> {
    pub fn new(table: T) -> Self {
        CacheStore {
            table,
            events: noop_event_listener(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn DbEventListener>) -> Self {
        self.events = events;
        self
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    fn drain(&self, cursor: &mut T::Cursor, sink: &QuerySink, tally: &mut QueryTally) -> QueryEnd {
        for row in cursor {
            match row {
                Ok(point) => {
                    if !sink.emit(Entry::raw(point.timestamp, point.value)) {
                        return QueryEnd::Cancelled;
                    }
                    tally.entries += 1;
                }
                Err(e) => return QueryEnd::failed(sink, e),
            }
        }
        QueryEnd::Exhausted
    }
}

impl<T: PointTable> SeriesStore for CacheStore<T> {
    fn insert(&self, series: SeriesId, entry: &Entry) -> Result<(), DbError> {
        let value = entry.get(RAW_ATTRIBUTE).ok_or_else(|| DbError::MissingAttribute {
            attribute: RAW_ATTRIBUTE.to_string(),
        })?;
        self.table.upsert(series, entry.timestamp, value)
    }

    fn query(
        &self,
        series: SeriesId,
        start: Timestamp,
        end: Timestamp,
        _attributes: &[String],
        sink: &QuerySink,
    ) {
        let mut tally = QueryTally::new(series);
        let mut cursor = match self.table.scan(series, start, end) {
            Ok(c) => c,
            Err(e) => {
                let end = QueryEnd::failed(sink, e);
                tally.finish(end, self.events.as_ref());
                return;
            }
        };
        let end = self.drain(&mut cursor, sink, &mut tally);
        tally.closed(cursor.close(), sink, self.events.as_ref());
        tally.finish(end, self.events.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::channel;
    use crate::storage::MemoryPointTable;
    use chrono::{TimeDelta, TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    #[test]
    fn test_insert_requires_raw_attribute() {
        let store = CacheStore::new(MemoryPointTable::default());
        let err = store
            .insert(SeriesId::new_random(), &Entry::new(at(0)).with("avg", 1.0))
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::MissingAttribute { attribute } if attribute == RAW_ATTRIBUTE
        ));
    }

    #[test]
    fn test_query_returns_range_in_order_with_overwrite() {
        let store = CacheStore::new(MemoryPointTable::default());
        let series = SeriesId::new_random();
        for (secs, v) in [(30, 3.0), (10, 1.0), (20, 2.0), (40, 4.0), (20, 2.5)] {
            store.insert(series, &Entry::raw(at(secs), v)).unwrap();
        }
        // Sub-second precision is kept by the raw tier.
        store
            .insert(series, &Entry::raw(at(20) + TimeDelta::milliseconds(500), 2.7))
            .unwrap();

        let (sink, stream) = channel(16);
        store.query(series, at(15), at(30), &[], &sink);
        drop(sink);
        let got: Vec<(Timestamp, f64)> = stream
            .collect_entries()
            .unwrap()
            .iter()
            .map(|e| (e.timestamp, e.get(RAW_ATTRIBUTE).unwrap()))
            .collect();
        assert_eq!(
            got,
            vec![
                (at(20), 2.5),
                (at(20) + TimeDelta::milliseconds(500), 2.7),
                (at(30), 3.0)
            ]
        );
    }
}
