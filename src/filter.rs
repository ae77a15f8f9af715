//! Per-level aggregation gates.
//!
//! A filter receives every entry written to its level and emits zero or more derived entries
//! through the [`Handler`] it was constructed with. The cascade gives each filter exactly one
//! handler, at build time.

use crate::error::DbError;
use crate::types::{Entry, SeriesId};

use std::fmt;
use std::sync::Arc;

type HandlerFn = dyn Fn(SeriesId, &Entry) -> Result<(), DbError> + Send + Sync;

/// Downstream callback of a filter.
#[derive(Clone)]
pub struct Handler {
    inner: Option<Arc<HandlerFn>>,
}

impl Handler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(SeriesId, &Entry) -> Result<(), DbError> + Send + Sync + 'static,
    {
        Handler {
            inner: Some(Arc::new(f)),
        }
    }

    /// A handler that accepts every emission and drops it.
    pub fn detached() -> Self {
        Handler { inner: None }
    }

    pub fn is_attached(&self) -> bool {
        self.inner.is_some()
    }

    #[inline]
    pub fn call(&self, series: SeriesId, entry: &Entry) -> Result<(), DbError> {
        match &self.inner {
            Some(f) => f(series, entry),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("attached", &self.is_attached())
            .finish()
    }
}

pub trait Filter: Send + Sync {
    /// Feeds one entry. Errors returned by the handler propagate unchanged.
    fn insert(&self, series: SeriesId, entry: &Entry) -> Result<(), DbError>;
}

/// Builds a level's filter around the handler the cascade assigns to it.
pub type FilterFactory = Box<dyn FnOnce(Handler) -> Arc<dyn Filter>>;

/// Identity filter: emits every entry immediately and unchanged.
#[derive(Debug)]
pub struct PassThroughFilter {
    handler: Handler,
}

impl PassThroughFilter {
    pub fn new(handler: Handler) -> Self {
        PassThroughFilter { handler }
    }

    pub fn factory() -> FilterFactory {
        Box::new(|handler| Arc::new(PassThroughFilter::new(handler)) as Arc<dyn Filter>)
    }
}

impl Filter for PassThroughFilter {
    fn insert(&self, series: SeriesId, entry: &Entry) -> Result<(), DbError> {
        self.handler.call(series, entry)
    }
}
