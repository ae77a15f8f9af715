//! Granularity levels: configuration plus the filter/store pair the cascade wires together.

use crate::error::DbError;
use crate::filter::Filter;
use crate::store::SeriesStore;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration of one granularity level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelConfig {
    /// Human-readable name, used in logs and metrics.
    pub name: String,
    /// Bucket width in whole seconds.
    pub granularity_secs: u64,
    /// How long the level's data is meant to be kept. Informational to the core.
    pub retention_secs: u64,
    /// Seconds per native offset unit inside a bucket.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

impl LevelConfig {
    pub fn new(name: &str, granularity: Duration, retention: Duration) -> Self {
        LevelConfig {
            name: name.to_string(),
            granularity_secs: granularity.as_secs(),
            retention_secs: retention.as_secs(),
            multiplier: default_multiplier(),
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn granularity(&self) -> Duration {
        Duration::from_secs(self.granularity_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn validate(&self) -> Result<(), DbError> {
        if self.granularity_secs == 0 {
            return Err(DbError::ConfigError(format!(
                "level {:?}: granularity must be at least one second",
                self.name
            )));
        }
        if self.retention_secs < self.granularity_secs {
            return Err(DbError::ConfigError(format!(
                "level {:?}: retention {}s is shorter than granularity {}s",
                self.name, self.retention_secs, self.granularity_secs
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier <= 0.0 {
            return Err(DbError::ConfigError(format!(
                "level {:?}: multiplier must be finite and positive, got {}",
                self.name, self.multiplier
            )));
        }
        Ok(())
    }
}

/// Checks a whole level list: non-empty, each level valid, granularities strictly increasing.
pub fn validate_levels(levels: &[LevelConfig]) -> Result<(), DbError> {
    if levels.is_empty() {
        return Err(DbError::ConfigError("at least one level is required".to_string()));
    }
    for level in levels {
        level.validate()?;
    }
    for pair in levels.windows(2) {
        if pair[1].granularity_secs <= pair[0].granularity_secs {
            return Err(DbError::ConfigError(format!(
                "level {:?} ({}s) must be coarser than level {:?} ({}s)",
                pair[1].name, pair[1].granularity_secs, pair[0].name, pair[0].granularity_secs
            )));
        }
    }
    Ok(())
}

/// What the coarsest level's filter does with the entries it emits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalLevel {
    /// Emissions are stored into the coarsest level's own store.
    #[default]
    Persist,
    /// The coarsest level is populated externally; its filter's emissions are dropped.
    External,
}

/// One granularity level of the cascade.
#[derive(Clone)]
pub struct Level {
    pub config: LevelConfig,
    pub filter: Arc<dyn Filter>,
    pub store: Arc<dyn SeriesStore>,
}

impl fmt::Debug for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Level").field("config", &self.config).finish_non_exhaustive()
    }
}
