use crate::error::DbError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Timestamp type (UTC wall clock; second resolution is what bucketed tiers keep).
pub type Timestamp = DateTime<Utc>;

/// Value type.
pub type Value = f64;

/// Attribute mapping carried by an entry (attribute name -> value).
pub type Attributes = HashMap<String, Value>;

/// Reserved attribute name of the offset stream inside a bucket.
pub const TIME_ATTRIBUTE: &str = "time";

/// Reserved attribute name of a raw sample value.
pub const RAW_ATTRIBUTE: &str = "raw";

/// 128-bit identifier of one logical time series.
///
/// Construction validates the input, so every `SeriesId` in circulation is well-formed and
/// the nil UUID is never accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesId(Uuid);

impl SeriesId {
    /// Generates a fresh random identifier.
    pub fn new_random() -> Self {
        SeriesId(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Result<Self, DbError> {
        if id.is_nil() {
            return Err(DbError::InvalidSeriesId("nil UUID".to_string()));
        }
        Ok(SeriesId(id))
    }

    /// Parses the 16 raw bytes of an identifier.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DbError> {
        let id = Uuid::from_slice(bytes).map_err(|e| {
            DbError::InvalidSeriesId(format!("{} byte identifier: {}", bytes.len(), e))
        })?;
        Self::from_uuid(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl FromStr for SeriesId {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s)
            .map_err(|e| DbError::InvalidSeriesId(format!("{:?}: {}", s, e)))?;
        Self::from_uuid(id)
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One entry in a time series: a timestamp plus named values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub timestamp: Timestamp,
    pub attributes: Attributes,
}

impl Entry {
    pub fn new(timestamp: Timestamp) -> Self {
        Entry {
            timestamp,
            attributes: Attributes::new(),
        }
    }

    /// Builds a raw sample entry carrying only the `raw` attribute.
    pub fn raw(timestamp: Timestamp, value: Value) -> Self {
        Entry::new(timestamp).with(RAW_ATTRIBUTE, value)
    }

    pub fn with(mut self, name: &str, value: Value) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.attributes.get(name).copied()
    }
}

/// One named, encoded attribute stream of a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAttribute {
    pub name: String,
    pub data: Vec<u8>,
}

/// Metadata tag attached to a series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: &str, value: &str) -> Self {
        Tag {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// Drops the sub-second part of a timestamp.
pub fn truncate_to_second(ts: Timestamp) -> Timestamp {
    DateTime::<Utc>::from_timestamp(ts.timestamp(), 0).unwrap_or(ts)
}

/// Aligns a timestamp down to a multiple of `granularity` since the Unix epoch.
///
/// Granularities are whole seconds; anything below one second aligns to the second.
pub fn truncate_to(ts: Timestamp, granularity: Duration) -> Timestamp {
    let width = granularity.as_secs().max(1) as i64;
    let secs = ts.timestamp();
    DateTime::<Utc>::from_timestamp(secs - secs.rem_euclid(width), 0).unwrap_or(ts)
}
