use thiserror::Error;

/// Custom error type for the storage core operations.
#[derive(Error, Debug)]
pub enum DbError {
    /// A series identifier could not be parsed or is the nil UUID.
    #[error("Invalid series identifier: {0}")]
    InvalidSeriesId(String),

    /// Failure reported by a backing table. Surfaced verbatim, never retried.
    #[error("Backing store error: {0}")]
    Backend(String),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Invalid time range: start={start}, end={end}")]
    InvalidTimeRange { start: String, end: String },

    #[error("Entry is missing required attribute {attribute:?}")]
    MissingAttribute { attribute: String },

    #[error("Attribute name {0:?} is reserved")]
    ReservedAttribute(String),

    #[error("Invalid tag: {0}")]
    InvalidTag(String),

    #[error("Level {index} does not exist (database has {levels} levels)")]
    LevelNotFound { index: usize, levels: usize },

    #[error("Configuration Error: {0}")]
    ConfigError(String),

    #[error("Background task error: {0}")]
    BackgroundTaskError(String),

    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        series: Option<String>,
        timestamp: Option<i64>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Shorthand for a decode/corruption error without series context.
    pub(crate) fn corruption(details: impl Into<String>) -> Self {
        DbError::Corruption {
            details: details.into(),
            series: None,
            timestamp: None,
        }
    }

    /// Attaches series and window context to a corruption error; other errors pass through.
    pub(crate) fn in_bucket(self, series: &str, window_start: i64) -> Self {
        match self {
            DbError::Corruption {
                details,
                series: None,
                timestamp: None,
            } => DbError::Corruption {
                details,
                series: Some(series.to_string()),
                timestamp: Some(window_start),
            },
            other => other,
        }
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DbError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

impl From<config::ConfigError> for DbError {
    fn from(err: config::ConfigError) -> Self {
        DbError::ConfigError(err.to_string())
    }
}
