//! Filters selecting queries for bulk operations.

use std::fmt;
use std::sync::Arc;

use crate::key::QueryKey;
use crate::query::Query;
use crate::state::{FetchStatus, QueryStatus};

/// Which queries match by observer activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryTypeFilter {
    /// Every query.
    #[default]
    All,
    /// Queries with at least one enabled observer.
    Active,
    /// Queries without enabled observers.
    Inactive,
}

/// Selects queries in the cache.
///
/// The default filter matches everything.
#[derive(Clone, Default)]
pub struct QueryFilters {
    /// Key prefix, or the exact key when `exact` is set.
    pub query_key: Option<QueryKey>,
    /// Match `query_key` exactly instead of as a prefix.
    pub exact: bool,
    /// Observer activity.
    pub kind: QueryTypeFilter,
    /// Match on staleness.
    pub stale: Option<bool>,
    /// Match on status.
    pub status: Option<QueryStatus>,
    /// Match on fetch status.
    pub fetch_status: Option<FetchStatus>,
    /// Arbitrary extra condition.
    pub predicate: Option<Arc<dyn Fn(&Query) -> bool + Send + Sync>>,
}

impl fmt::Debug for QueryFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilters")
            .field("query_key", &self.query_key)
            .field("exact", &self.exact)
            .field("kind", &self.kind)
            .field("stale", &self.stale)
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl QueryFilters {
    /// Match every query.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match queries whose key starts with `prefix`.
    pub fn key(prefix: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(prefix.into()),
            ..Self::default()
        }
    }

    /// Match exactly one key.
    pub fn exact(key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(key.into()),
            exact: true,
            ..Self::default()
        }
    }

    /// Restrict by observer activity.
    #[must_use]
    pub fn kind(mut self, kind: QueryTypeFilter) -> Self {
        self.kind = kind;
        self
    }

    /// Restrict by staleness.
    #[must_use]
    pub fn stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    /// Restrict by status.
    #[must_use]
    pub fn status(mut self, status: QueryStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restrict by fetch status.
    #[must_use]
    pub fn fetch_status(mut self, fetch_status: FetchStatus) -> Self {
        self.fetch_status = Some(fetch_status);
        self
    }

    /// Add a custom condition.
    #[must_use]
    pub fn predicate(mut self, predicate: impl Fn(&Query) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Returns `true` if `query` satisfies every condition.
    pub fn matches(&self, query: &Query) -> bool {
        if let Some(key) = &self.query_key {
            let matched = if self.exact {
                query.key() == key
            } else {
                query.key().matches_prefix(key)
            };
            if !matched {
                return false;
            }
        }
        self.matches_ignoring_key(query)
    }

    pub(crate) fn matches_ignoring_key(&self, query: &Query) -> bool {
        match self.kind {
            QueryTypeFilter::All => {}
            QueryTypeFilter::Active if !query.is_active() => return false,
            QueryTypeFilter::Inactive if query.is_active() => return false,
            _ => {}
        }

        if self.stale.is_some_and(|stale| query.is_stale() != stale) {
            return false;
        }

        if self.status.is_some() || self.fetch_status.is_some() {
            let state = query.state();
            if self.status.is_some_and(|status| state.status != status) {
                return false;
            }
            if self
                .fetch_status
                .is_some_and(|fetch_status| state.fetch_status != fetch_status)
            {
                return false;
            }
        }

        self.predicate.as_ref().map_or(true, |predicate| predicate(query))
    }
}

impl From<QueryKey> for QueryFilters {
    fn from(key: QueryKey) -> Self {
        QueryFilters::key(key)
    }
}
