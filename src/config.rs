//! Database configuration.
//!
//! Loaded in precedence order: built-in defaults, an optional TOML file, then environment
//! variables (`TIMEDB__*`, e.g. `TIMEDB__QUERY_BATCH_SIZE=128`).

use crate::error::DbError;
use crate::level::{validate_levels, LevelConfig, TerminalLevel};
use crate::query::{QueryOptions, DEFAULT_QUERY_BATCH_SIZE, DEFAULT_QUERY_CHANNEL_CAPACITY};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment prefix used by [`TimeDbConfig::load`].
pub const ENV_PREFIX: &str = "TIMEDB";

/// Configuration options for a [`crate::TimeDb`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeDbConfig {
    /// Levels, finest first. Granularities must be strictly increasing.
    pub levels: Vec<LevelConfig>,
    /// Entries decoded per batch by bucketed levels.
    pub query_batch_size: usize,
    /// Capacity of the entry channel of a running query.
    pub query_channel_capacity: usize,
    /// Handling of the coarsest level's filter emissions.
    pub terminal_level: TerminalLevel,
}

impl Default for TimeDbConfig {
    fn default() -> Self {
        TimeDbConfig {
            levels: vec![
                LevelConfig::new("raw", Duration::from_secs(1), Duration::from_secs(60 * 60)),
                LevelConfig::new(
                    "minute",
                    Duration::from_secs(60),
                    Duration::from_secs(7 * 24 * 60 * 60),
                ),
                LevelConfig::new(
                    "hour",
                    Duration::from_secs(60 * 60),
                    Duration::from_secs(365 * 24 * 60 * 60),
                ),
            ],
            query_batch_size: DEFAULT_QUERY_BATCH_SIZE,
            query_channel_capacity: DEFAULT_QUERY_CHANNEL_CAPACITY,
            terminal_level: TerminalLevel::default(),
        }
    }
}

/// File/env view of the configuration. Every field optional for layering.
#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    levels: Option<Vec<LevelConfig>>,
    query_batch_size: Option<usize>,
    query_channel_capacity: Option<usize>,
    terminal_level: Option<TerminalLevel>,
}

impl TimeDbConfig {
    /// Loads defaults, then `path` (if given and present), then `TIMEDB__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, DbError> {
        Self::load_with_env_prefix(path, ENV_PREFIX)
    }

    /// Like [`TimeDbConfig::load`] with a custom environment prefix.
    pub fn load_with_env_prefix(path: Option<&Path>, prefix: &str) -> Result<Self, DbError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );
        let partial: PartialConfig = builder.build()?.try_deserialize()?;

        let mut config = TimeDbConfig::default();
        config.merge(partial);
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document layered over the defaults. No environment lookup.
    pub fn from_toml_str(toml: &str) -> Result<Self, DbError> {
        let partial: PartialConfig = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        let mut config = TimeDbConfig::default();
        config.merge(partial);
        config.validate()?;
        Ok(config)
    }

    fn merge(&mut self, partial: PartialConfig) {
        if let Some(levels) = partial.levels {
            self.levels = levels;
        }
        if let Some(n) = partial.query_batch_size {
            self.query_batch_size = n;
        }
        if let Some(n) = partial.query_channel_capacity {
            self.query_channel_capacity = n;
        }
        if let Some(t) = partial.terminal_level {
            self.terminal_level = t;
        }
    }

    pub fn validate(&self) -> Result<(), DbError> {
        validate_levels(&self.levels)?;
        if self.query_batch_size == 0 {
            return Err(DbError::ConfigError("query_batch_size must be positive".to_string()));
        }
        if self.query_channel_capacity == 0 {
            return Err(DbError::ConfigError(
                "query_channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn query_options(&self) -> QueryOptions {
        QueryOptions {
            batch_size: self.query_batch_size,
            channel_capacity: self.query_channel_capacity,
        }
    }
}
