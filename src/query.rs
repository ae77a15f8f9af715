//! Streaming query plumbing: a producer thread runs a store query and pushes entries into a
//! bounded channel and errors into an unbounded one; the caller consumes both through a
//! [`QueryStream`].
//!
//! Backpressure comes from the bounded entry channel. Reporting an error never blocks, since
//! the stream only drains errors once the entry side has closed. Cancellation is cooperative: dropping
//! the stream makes the producer's next send fail, which ends the query.

use crate::error::DbError;
use crate::store::SeriesStore;
use crate::telemetry::{db_metrics, DbEvent, DbEventListener};
use crate::types::{Entry, SeriesId, Timestamp};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Default number of entries decoded per batch by bucketed stores.
pub const DEFAULT_QUERY_BATCH_SIZE: usize = 64;
/// Default capacity of the entry channel between producer and consumer.
pub const DEFAULT_QUERY_CHANNEL_CAPACITY: usize = 256;

/// Tuning knobs of the read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Entries per decode buffer. Two buffers of this size exist per running query.
    pub batch_size: usize,
    /// Bound of the entry channel.
    pub channel_capacity: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            batch_size: DEFAULT_QUERY_BATCH_SIZE,
            channel_capacity: DEFAULT_QUERY_CHANNEL_CAPACITY,
        }
    }
}

/// Producer side of a query: where a store pushes entries and errors.
#[derive(Debug)]
pub struct QuerySink {
    entries: SyncSender<Entry>,
    errors: Sender<DbError>,
}

impl QuerySink {
    /// Sends one entry, blocking while the channel is full.
    ///
    /// Returns `false` once the consumer has gone away; the producer must stop.
    pub fn emit(&self, entry: Entry) -> bool {
        self.entries.send(entry).is_ok()
    }

    /// Reports an error without blocking. Errors for a consumer that has gone away are dropped.
    pub fn fail(&self, error: DbError) {
        let _ = self.errors.send(error);
    }
}

/// How a store's query loop ended.
#[derive(Debug)]
pub(crate) enum QueryEnd {
    Exhausted,
    /// An entry past the end of the range was seen.
    EarlyStop,
    Cancelled,
    Failed(String),
}

impl QueryEnd {
    /// Pushes `error` to the error stream and records the failure.
    pub(crate) fn failed(sink: &QuerySink, error: DbError) -> Self {
        let message = error.to_string();
        sink.fail(error);
        QueryEnd::Failed(message)
    }
}

/// Per-query counters reported as events and metrics when the query returns.
#[derive(Debug)]
pub(crate) struct QueryTally {
    series: SeriesId,
    started: Instant,
    pub(crate) entries: u64,
    pub(crate) buckets: u64,
}

impl QueryTally {
    pub(crate) fn new(series: SeriesId) -> Self {
        QueryTally {
            series,
            started: Instant::now(),
            entries: 0,
            buckets: 0,
        }
    }

    /// Reports the outcome of closing the backing cursor. A close error goes to the error
    /// stream after anything the query loop already reported.
    pub(crate) fn closed(
        &self,
        result: Result<(), DbError>,
        sink: &QuerySink,
        events: &dyn DbEventListener,
    ) {
        if let Err(e) = result {
            events.on_event(DbEvent::CursorCloseFailed {
                series: self.series.to_string(),
                error: e.to_string(),
            });
            sink.fail(e);
        }
    }

    pub(crate) fn finish(self, end: QueryEnd, events: &dyn DbEventListener) {
        db_metrics::record_query(self.started.elapsed(), self.entries, self.buckets);
        let series = self.series.to_string();
        let finished = |series, early_stop| DbEvent::QueryFinished {
            series,
            entries: self.entries,
            buckets: self.buckets,
            early_stop,
        };
        let event = match end {
            QueryEnd::Exhausted => finished(series, false),
            QueryEnd::EarlyStop => finished(series, true),
            QueryEnd::Cancelled => DbEvent::QueryCancelled {
                series,
                entries: self.entries,
            },
            QueryEnd::Failed(error) => DbEvent::QueryFailed { series, error },
        };
        events.on_event(event);
    }
}

/// Creates a connected sink/stream pair without a producer thread.
///
/// Useful to run `SeriesStore::query` inline when the entry capacity is known to be enough.
pub fn channel(capacity: usize) -> (QuerySink, QueryStream) {
    let (entry_tx, entry_rx) = mpsc::sync_channel(capacity);
    let (error_tx, error_rx) = mpsc::channel();
    (
        QuerySink {
            entries: entry_tx,
            errors: error_tx,
        },
        QueryStream {
            entries: entry_rx,
            errors: error_rx,
            producer: None,
            entries_done: false,
            producer_panic: None,
        },
    )
}

/// Runs `store.query(..)` on its own thread and returns the consumer side.
pub fn spawn_query<S>(
    store: Arc<S>,
    series: SeriesId,
    start: Timestamp,
    end: Timestamp,
    attributes: Vec<String>,
    capacity: usize,
) -> Result<QueryStream, DbError>
where
    S: SeriesStore + ?Sized + 'static,
{
    let (sink, mut stream) = channel(capacity.max(1));
    let handle = thread::Builder::new()
        .name("tierdb-query".to_string())
        .spawn(move || {
            store.query(series, start, end, &attributes, &sink);
        })
        .map_err(|e| DbError::BackgroundTaskError(format!("failed to spawn query thread: {}", e)))?;
    stream.producer = Some(handle);
    Ok(stream)
}

/// Consumer side of a running query.
///
/// Iterating yields every entry in emission order, then any errors the producer reported.
/// A stream ending in an error is a valid prefix followed by a fatal failure.
#[derive(Debug)]
pub struct QueryStream {
    entries: Receiver<Entry>,
    errors: Receiver<DbError>,
    producer: Option<JoinHandle<()>>,
    entries_done: bool,
    producer_panic: Option<DbError>,
}

impl QueryStream {
    /// Drains the stream. `Err` carries the entries received before the failure.
    pub fn collect_entries(self) -> Result<Vec<Entry>, PartialQuery> {
        let mut entries = Vec::new();
        let mut errors = Vec::new();
        for item in self {
            match item {
                Ok(e) => entries.push(e),
                Err(e) => errors.push(e),
            }
        }
        if errors.is_empty() {
            Ok(entries)
        } else {
            Err(PartialQuery { entries, errors })
        }
    }

    fn join_producer(&mut self) {
        if let Some(handle) = self.producer.take() {
            if handle.join().is_err() {
                self.producer_panic = Some(DbError::BackgroundTaskError(
                    "query producer panicked".to_string(),
                ));
            }
        }
    }
}

impl Iterator for QueryStream {
    type Item = Result<Entry, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.entries_done {
            match self.entries.recv() {
                Ok(entry) => return Some(Ok(entry)),
                // Every sender is gone: the producer has finished.
                Err(_) => {
                    self.entries_done = true;
                    self.join_producer();
                }
            }
        }
        match self.errors.try_recv() {
            Ok(e) => Some(Err(e)),
            Err(_) => self.producer_panic.take().map(Err),
        }
    }
}

/// A query that failed after emitting `entries`.
#[derive(Debug)]
pub struct PartialQuery {
    /// The valid prefix received before the failure.
    pub entries: Vec<Entry>,
    /// Every reported error, first failure first. Never empty.
    pub errors: Vec<DbError>,
}

impl fmt::Display for PartialQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query failed after {} entries", self.entries.len())?;
        for e in &self.errors {
            write!(f, ": {}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for PartialQuery {}
