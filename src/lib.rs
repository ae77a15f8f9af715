#![doc = include_str!("../README.md")]
// Declare modules
pub mod backend;
pub mod bucket;
pub mod cache;
pub mod config;
pub mod core;
pub mod encoding;
pub mod error;
pub mod filter;
pub mod level;
pub mod persistence;
pub mod query;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod types;

/// Contracts of the backing tables.
pub use crate::backend::{BucketRepository, PointTable, TagStore};
/// Bucketed-tier series store.
pub use crate::bucket::BucketStore;
/// Raw-tier series store.
pub use crate::cache::CacheStore;
/// Layered configuration (defaults, TOML file, environment).
pub use crate::config::TimeDbConfig;
/// Main entry point: the level cascade and its builder.
pub use crate::core::{TimeDb, TimeDbBuilder};
/// Error type for database operations.
pub use crate::error::DbError;
/// Per-level aggregation gate and its downstream callback.
pub use crate::filter::{Filter, Handler, PassThroughFilter};
pub use crate::level::{Level, LevelConfig, TerminalLevel};
/// Snapshot manager for the in-memory backend.
pub use crate::persistence::Snapshotter;
/// Consumer and producer sides of a streaming query.
pub use crate::query::{PartialQuery, QueryOptions, QuerySink, QueryStream};
/// In-memory backing tables.
pub use crate::storage::{MemoryBackend, MemoryBucketTable, MemoryPointTable, MemoryTagStore};
/// Persistence contract of one level.
pub use crate::store::SeriesStore;
/// Structured event hook for observability.
pub use crate::telemetry::{DbEvent, DbEventListener, TracingEventListener};
pub use crate::types::{
    Attributes, Entry, SeriesId, Tag, Timestamp, Value, RAW_ATTRIBUTE, TIME_ATTRIBUTE,
};
