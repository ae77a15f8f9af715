//! Core database logic: the level cascade, its builder, and the public read/write API.

use crate::backend::{BucketRepository, PointTable};
use crate::bucket::BucketStore;
use crate::cache::CacheStore;
use crate::config::TimeDbConfig;
use crate::error::DbError;
use crate::filter::{Filter, FilterFactory, Handler, PassThroughFilter};
use crate::level::{validate_levels, Level, LevelConfig, TerminalLevel};
use crate::query::{spawn_query, QueryOptions, QueryStream};
use crate::storage::MemoryBackend;
use crate::store::SeriesStore;
use crate::telemetry::{db_metrics, noop_event_listener, DbEvent, DbEventListener};
use crate::types::{Entry, SeriesId, Timestamp, Value};

use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

/// A multi-granularity time-series store.
///
/// Writes enter the finest level's filter and cascade: each level's handler stores the
/// filter's emission into its own store, then feeds the next level's filter. Reads target one
/// level's store directly.
#[derive(Debug)]
pub struct TimeDb {
    levels: Vec<Level>,
    query: QueryOptions,
    terminal: TerminalLevel,
    events: Arc<dyn DbEventListener>,
}

struct PendingLevel {
    config: LevelConfig,
    filter: FilterFactory,
    store: Arc<dyn SeriesStore>,
}

/// Assembles a [`TimeDb`]. Levels are added finest first.
pub struct TimeDbBuilder {
    levels: Vec<PendingLevel>,
    query: QueryOptions,
    terminal: TerminalLevel,
    events: Arc<dyn DbEventListener>,
}

impl Default for TimeDbBuilder {
    fn default() -> Self {
        TimeDbBuilder {
            levels: Vec::new(),
            query: QueryOptions::default(),
            terminal: TerminalLevel::default(),
            events: noop_event_listener(),
        }
    }
}

impl TimeDbBuilder {
    /// Adds a level with a custom filter. The factory receives the handler the cascade
    /// assigns to the level's filter.
    pub fn level<F, S>(mut self, config: LevelConfig, filter: F, store: S) -> Self
    where
        F: FnOnce(Handler) -> Arc<dyn Filter> + 'static,
        S: SeriesStore + 'static,
    {
        self.levels.push(PendingLevel {
            config,
            filter: Box::new(filter),
            store: Arc::new(store),
        });
        self
    }

    /// Adds a raw level over a point table, with a pass-through filter.
    pub fn cache_level<T>(self, config: LevelConfig, table: T) -> Self
    where
        T: PointTable + 'static,
    {
        let store = CacheStore::new(table).with_events(Arc::clone(&self.events));
        self.level(config, PassThroughFilter::factory(), store)
    }

    /// Adds a bucketed level over a bucket table, with a pass-through filter.
    pub fn bucket_level<R>(self, config: LevelConfig, repo: R) -> Self
    where
        R: BucketRepository + 'static,
    {
        let store = BucketStore::new(repo, &config)
            .with_batch_size(self.query.batch_size)
            .with_events(Arc::clone(&self.events));
        self.level(config, PassThroughFilter::factory(), store)
    }

    pub fn terminal(mut self, terminal: TerminalLevel) -> Self {
        self.terminal = terminal;
        self
    }

    /// Sets read-path options. Bucketed levels added afterwards pick up the batch size.
    pub fn query_options(mut self, options: QueryOptions) -> Self {
        self.query = options;
        self
    }

    /// Sets the event listener. Stores created by `cache_level`/`bucket_level` afterwards
    /// report to it as well.
    pub fn events(mut self, events: Arc<dyn DbEventListener>) -> Self {
        self.events = events;
        self
    }

    /// Validates the level list and wires the cascade.
    ///
    /// Level `i`'s handler stores into level `i`'s store, then inserts into level `i + 1`'s
    /// filter. The coarsest level's handler depends on [`TerminalLevel`].
    ///
    /// # Errors
    /// Returns `ConfigError` when there are no levels, a level is invalid, or granularities
    /// are not strictly increasing.
    pub fn build(self) -> Result<TimeDb, DbError> {
        let configs: Vec<LevelConfig> = self.levels.iter().map(|l| l.config.clone()).collect();
        validate_levels(&configs)?;

        let count = self.levels.len();
        let mut built: Vec<Level> = Vec::with_capacity(count);
        let mut downstream: Option<Arc<dyn Filter>> = None;

        // Coarsest first, so every handler can capture the filter it forwards into.
        for (index, pending) in self.levels.into_iter().enumerate().rev() {
            let handler = match downstream.take() {
                Some(next) => {
                    cascade_handler(index, Arc::clone(&pending.store), next, &self.events)
                }
                None => match self.terminal {
                    TerminalLevel::Persist => {
                        terminal_handler(index, Arc::clone(&pending.store), &self.events)
                    }
                    TerminalLevel::External => detached_handler(index, &self.events),
                },
            };
            let filter = (pending.filter)(handler);
            downstream = Some(Arc::clone(&filter));
            built.push(Level {
                config: pending.config,
                filter,
                store: pending.store,
            });
        }
        built.reverse();

        Ok(TimeDb {
            levels: built,
            query: self.query,
            terminal: self.terminal,
            events: self.events,
        })
    }
}

fn store_into(
    index: usize,
    store: &dyn SeriesStore,
    series: SeriesId,
    entry: &Entry,
    events: &dyn DbEventListener,
) -> Result<(), DbError> {
    match store.insert(series, entry) {
        Ok(()) => {
            db_metrics::record_cascade_write(index);
            Ok(())
        }
        Err(e) => {
            events.on_event(DbEvent::CascadeAborted {
                level: index,
                series: series.to_string(),
                error: e.to_string(),
            });
            Err(e)
        }
    }
}

fn cascade_handler(
    index: usize,
    store: Arc<dyn SeriesStore>,
    next: Arc<dyn Filter>,
    events: &Arc<dyn DbEventListener>,
) -> Handler {
    let events = Arc::clone(events);
    Handler::new(move |series, entry| {
        store_into(index, store.as_ref(), series, entry, events.as_ref())?;
        next.insert(series, entry)
    })
}

fn terminal_handler(
    index: usize,
    store: Arc<dyn SeriesStore>,
    events: &Arc<dyn DbEventListener>,
) -> Handler {
    let events = Arc::clone(events);
    Handler::new(move |series, entry| {
        store_into(index, store.as_ref(), series, entry, events.as_ref())
    })
}

fn detached_handler(index: usize, events: &Arc<dyn DbEventListener>) -> Handler {
    let events = Arc::clone(events);
    Handler::new(move |series, _entry| {
        events.on_event(DbEvent::TerminalEmissionDropped {
            level: index,
            series: series.to_string(),
        });
        Ok(())
    })
}

impl TimeDb {
    pub fn builder() -> TimeDbBuilder {
        TimeDbBuilder::default()
    }

    /// Builds a database over fresh in-memory tables: a cache table for the finest level and
    /// one bucket table per coarser level, all with pass-through filters.
    ///
    /// The returned backend gives access to the tables, e.g. for snapshots.
    pub fn open_in_memory(
        config: &TimeDbConfig,
        events: Arc<dyn DbEventListener>,
    ) -> Result<(TimeDb, MemoryBackend), DbError> {
        config.validate()?;
        let backend = MemoryBackend::new(config.levels.len().saturating_sub(1));

        let mut builder = TimeDb::builder()
            .events(events)
            .query_options(config.query_options())
            .terminal(config.terminal_level);
        for (index, level) in config.levels.iter().enumerate() {
            builder = match index {
                0 => builder.cache_level(level.clone(), Arc::clone(&backend.cache)),
                _ => builder.bucket_level(level.clone(), Arc::clone(&backend.levels[index - 1])),
            };
        }
        Ok((builder.build()?, backend))
    }

    /// The levels, finest first.
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn terminal(&self) -> TerminalLevel {
        self.terminal
    }

    /// Writes one entry into the cascade.
    ///
    /// # Errors
    /// Returns the first error raised anywhere in the cascade, unchanged. Levels that stored
    /// the entry before the failure keep it.
    pub fn put(&self, series: SeriesId, entry: &Entry) -> Result<(), DbError> {
        self.levels[0].filter.insert(series, entry)
    }

    /// Writes a raw sample.
    pub fn put_value(
        &self,
        series: SeriesId,
        value: Value,
        timestamp: Timestamp,
    ) -> Result<(), DbError> {
        self.put(series, &Entry::raw(timestamp, value))
    }

    /// Writes a batch. Series are written in parallel; entries of one series are written in
    /// input order.
    ///
    /// # Errors
    /// All series are attempted. Returns the error of the first failing series, in order of
    /// first appearance in the batch; a failing series stops at its failing entry.
    pub fn put_many(&self, batch: &[(SeriesId, Entry)]) -> Result<(), DbError> {
        let mut groups: Vec<(SeriesId, Vec<&Entry>)> = Vec::new();
        let mut slots: HashMap<SeriesId, usize> = HashMap::new();
        for (series, entry) in batch {
            let slot = *slots.entry(*series).or_insert_with(|| {
                groups.push((*series, Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(entry);
        }

        let results: Vec<Result<(), DbError>> = groups
            .par_iter()
            .map(|(series, entries)| entries.iter().try_for_each(|entry| self.put(*series, entry)))
            .collect();
        results.into_iter().collect()
    }

    /// Streams the entries of `series` in `[start, end]` from level `level`.
    ///
    /// The query runs on its own thread; the returned stream yields entries in non-decreasing
    /// timestamp order, followed by any errors. An empty `attributes` slice requests every
    /// stored attribute.
    ///
    /// # Errors
    /// `LevelNotFound` for an unknown level, `InvalidTimeRange` when `start > end`, and
    /// `BackgroundTaskError` if the producer thread cannot be spawned.
    pub fn query(
        &self,
        level: usize,
        series: SeriesId,
        start: Timestamp,
        end: Timestamp,
        attributes: &[&str],
    ) -> Result<QueryStream, DbError> {
        let target = self.levels.get(level).ok_or(DbError::LevelNotFound {
            index: level,
            levels: self.levels.len(),
        })?;
        if start > end {
            return Err(DbError::InvalidTimeRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        spawn_query(
            Arc::clone(&target.store),
            series,
            start,
            end,
            attributes.iter().map(|a| a.to_string()).collect(),
            self.query.channel_capacity,
        )
    }

    pub fn event_listener(&self) -> &Arc<dyn DbEventListener> {
        &self.events
    }
}
