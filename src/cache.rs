//! The fingerprint-to-query map and its event stream.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::QueryError;
use crate::filter::QueryFilters;
use crate::manager::OnlineManager;
use crate::options::ErasedQueryOptions;
use crate::query::Query;
use crate::state::{ActionKind, ErasedData};

/// Default capacity of the cache event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

type SuccessCallback = Arc<dyn Fn(&Query, &ErasedData) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&Query, &QueryError) + Send + Sync>;
type SettledCallback = Arc<dyn Fn(&Query, Option<&ErasedData>, Option<&QueryError>) + Send + Sync>;

/// Callbacks run after every settled fetch in the cache.
#[derive(Clone, Default)]
pub struct QueryCacheConfig {
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
    on_settled: Option<SettledCallback>,
}

impl fmt::Debug for QueryCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCacheConfig")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .finish()
    }
}

impl QueryCacheConfig {
    /// Run `f` after every successful fetch.
    #[must_use]
    pub fn on_success(mut self, f: impl Fn(&Query, &ErasedData) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Run `f` after every failed fetch. Cancellations are not failures.
    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&Query, &QueryError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Run `f` after every successful or failed fetch.
    #[must_use]
    pub fn on_settled(
        mut self,
        f: impl Fn(&Query, Option<&ErasedData>, Option<&QueryError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }
}

/// Change notifications broadcast by a [`QueryCache`].
#[derive(Debug, Clone)]
pub enum QueryCacheEvent {
    /// A query was created.
    Added {
        /// The new query.
        query: Query,
    },
    /// A query was removed.
    Removed {
        /// The removed query.
        query: Query,
    },
    /// A query changed state.
    Updated {
        /// The updated query.
        query: Query,
        /// The transition applied.
        action: ActionKind,
    },
    /// An observer attached.
    ObserverAdded {
        /// The observed query.
        query: Query,
        /// Observer count after attaching.
        observers: usize,
    },
    /// An observer detached.
    ObserverRemoved {
        /// The observed query.
        query: Query,
        /// Observer count after detaching.
        observers: usize,
    },
}

impl QueryCacheEvent {
    /// The query the event is about.
    pub fn query(&self) -> &Query {
        match self {
            QueryCacheEvent::Added { query }
            | QueryCacheEvent::Removed { query }
            | QueryCacheEvent::Updated { query, .. }
            | QueryCacheEvent::ObserverAdded { query, .. }
            | QueryCacheEvent::ObserverRemoved { query, .. } => query,
        }
    }
}

pub(crate) struct CacheShared {
    queries: RwLock<BTreeMap<String, Query>>,
    events: broadcast::Sender<QueryCacheEvent>,
    config: QueryCacheConfig,
    online: OnlineManager,
}

impl CacheShared {
    pub(crate) fn emit(&self, event: QueryCacheEvent) {
        // Sending only fails when nobody is subscribed.
        let _ = self.events.send(event);
    }

    pub(crate) fn remove_query(&self, query: &Query) {
        let removed = {
            let mut queries = self.queries.write();
            match queries.get(query.fingerprint()) {
                Some(current) if current == query => queries.remove(query.fingerprint()),
                _ => None,
            }
        };
        if let Some(removed) = removed {
            removed.destroy();
            debug!(key = %removed.key(), "removed query");
            self.emit(QueryCacheEvent::Removed { query: removed });
        }
    }

    pub(crate) fn run_success_callbacks(&self, query: &Query, data: &ErasedData) {
        if let Some(on_success) = &self.config.on_success {
            on_success(query, data);
        }
        if let Some(on_settled) = &self.config.on_settled {
            on_settled(query, Some(data), None);
        }
    }

    pub(crate) fn run_error_callbacks(&self, query: &Query, error: &QueryError) {
        if let Some(on_error) = &self.config.on_error {
            on_error(query, error);
        }
        if let Some(on_settled) = &self.config.on_settled {
            on_settled(query, query.raw_data().as_ref(), Some(error));
        }
    }
}

/// Owns every query of a client.
///
/// Handles are cheap to clone and share one map.
#[derive(Clone)]
pub struct QueryCache {
    shared: Arc<CacheShared>,
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("queries", &self.shared.queries.read().len())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(QueryCacheConfig::default())
    }
}

impl QueryCache {
    /// Create an empty cache that is always online.
    pub fn new(config: QueryCacheConfig) -> Self {
        Self::with_parts(config, OnlineManager::default(), DEFAULT_EVENT_CAPACITY)
    }

    pub(crate) fn with_parts(
        config: QueryCacheConfig,
        online: OnlineManager,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            shared: Arc::new(CacheShared {
                queries: RwLock::new(BTreeMap::new()),
                events,
                config,
                online,
            }),
        }
    }

    /// Return the query for the options' key, creating it if needed.
    pub(crate) fn build(&self, options: &ErasedQueryOptions) -> Query {
        let fingerprint = options.key.fingerprint();
        if let Some(query) = self.shared.queries.read().get(fingerprint) {
            return query.clone();
        }

        let query = {
            let mut queries = self.shared.queries.write();
            if let Some(query) = queries.get(fingerprint) {
                return query.clone();
            }
            let query = Query::new(
                options.clone(),
                Arc::downgrade(&self.shared),
                self.shared.online.clone(),
            );
            queries.insert(fingerprint.to_string(), query.clone());
            query
        };
        debug!(key = %query.key(), "created query");
        query.schedule_gc();
        self.shared.emit(QueryCacheEvent::Added {
            query: query.clone(),
        });
        query
    }

    /// The query stored under `fingerprint`.
    pub fn get(&self, fingerprint: &str) -> Option<Query> {
        self.shared.queries.read().get(fingerprint).cloned()
    }

    /// The first query matching `filters`.
    ///
    /// A key in `filters` is matched exactly.
    pub fn find(&self, filters: &QueryFilters) -> Option<Query> {
        if let Some(key) = &filters.query_key {
            let query = self.get(key.fingerprint())?;
            return filters.matches_ignoring_key(&query).then_some(query);
        }
        self.get_all()
            .into_iter()
            .find(|query| filters.matches(query))
    }

    /// Every query matching `filters`, ordered by fingerprint.
    pub fn find_all(&self, filters: &QueryFilters) -> Vec<Query> {
        self.get_all()
            .into_iter()
            .filter(|query| filters.matches(query))
            .collect()
    }

    /// Every query, ordered by fingerprint.
    pub fn get_all(&self) -> Vec<Query> {
        self.shared.queries.read().values().cloned().collect()
    }

    /// Number of queries.
    pub fn len(&self) -> usize {
        self.shared.queries.read().len()
    }

    /// Returns `true` if the cache holds no queries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove `query`, cancelling its fetch.
    ///
    /// Refuses and returns `false` while observers are attached.
    pub fn remove(&self, query: &Query) -> bool {
        let observers = query.observer_count();
        if observers > 0 {
            warn!(key = %query.key(), observers, "refusing to remove an observed query");
            return false;
        }
        self.shared.remove_query(query);
        true
    }

    /// Remove every query without observers.
    pub fn clear(&self) {
        for query in self.get_all() {
            if query.observer_count() == 0 {
                self.shared.remove_query(&query);
            }
        }
    }

    /// Subscribe to cache events.
    ///
    /// Slow receivers may observe [`broadcast::error::RecvError::Lagged`].
    pub fn subscribe(&self) -> broadcast::Receiver<QueryCacheEvent> {
        self.shared.events.subscribe()
    }

    /// Let observers that refetch on focus do so.
    pub fn on_focus(&self) {
        for query in self.get_all() {
            query.on_focus();
        }
    }

    /// Let observers that refetch on reconnect do so.
    pub fn on_online(&self) {
        for query in self.get_all() {
            query.on_online();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{QueryDefaults, QueryOptions};
    use crate::query::QueryListener;
    use crate::query_key;
    use crate::state::{FetchStatus, QueryStatus};
    use std::sync::Weak;
    use std::time::Duration;

    struct Listener;

    impl QueryListener for Listener {
        fn on_query_update(&self, _fingerprint: &str) {}

        fn is_enabled(&self) -> bool {
            true
        }

        fn is_stale(&self) -> bool {
            false
        }

        fn should_fetch_on_window_focus(&self) -> bool {
            false
        }

        fn should_fetch_on_reconnect(&self) -> bool {
            false
        }
    }

    fn options(key: crate::QueryKey) -> ErasedQueryOptions {
        QueryOptions::<u32>::without_fn(key).erase(&QueryDefaults::default())
    }

    fn with_gc(key: crate::QueryKey, gc_time: Duration) -> ErasedQueryOptions {
        QueryOptions::<u32>::without_fn(key)
            .gc_time(gc_time)
            .erase(&QueryDefaults::default())
    }

    #[test]
    fn test_build_is_idempotent() {
        let cache = QueryCache::default();
        let a = cache.build(&options(query_key!["todos", {"a": 1, "b": 2}]));
        let b = cache.build(&options(query_key!["todos", {"b": 2, "a": 1}]));
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);
        assert_eq!(a.state().status, QueryStatus::Pending);
    }

    #[test]
    fn test_find_and_find_all() {
        let cache = QueryCache::default();
        let one = cache.build(&options(query_key!["todos", 1]));
        let two = cache.build(&options(query_key!["todos", 2]));
        cache.build(&options(query_key!["users"]));
        two.set_data(Arc::new(2u32), None);

        let todos = cache.find_all(&QueryFilters::key(query_key!["todos"]));
        assert_eq!(todos, vec![one.clone(), two.clone()]);

        let done = cache.find_all(&QueryFilters::all().status(QueryStatus::Success));
        assert_eq!(done, vec![two.clone()]);

        assert_eq!(cache.find(&QueryFilters::key(query_key!["todos", 1])), Some(one));
        assert_eq!(cache.find(&QueryFilters::key(query_key!["todos"])), None);
        assert!(cache
            .find_all(&QueryFilters::all().fetch_status(FetchStatus::Fetching))
            .is_empty());
    }

    #[test]
    fn test_remove_refused_while_observed() {
        let cache = QueryCache::default();
        let query = cache.build(&options(query_key!["observed"]));
        let listener: Arc<dyn QueryListener> = Arc::new(Listener);
        let id = query.add_observer(Arc::downgrade(&listener) as Weak<dyn QueryListener>);

        assert!(!cache.remove(&query));
        assert_eq!(cache.len(), 1);
        assert!(query.is_active());

        query.remove_observer(id);
        assert!(cache.remove(&query));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_events() {
        let cache = QueryCache::default();
        let mut events = cache.subscribe();

        let query = cache.build(&options(query_key!["evt"]));
        query.set_data(Arc::new(1u32), None);
        cache.remove(&query);

        assert!(matches!(events.recv().await.unwrap(), QueryCacheEvent::Added { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            QueryCacheEvent::Updated {
                action: ActionKind::Success,
                ..
            }
        ));
        let removed = events.recv().await.unwrap();
        assert!(matches!(removed, QueryCacheEvent::Removed { .. }));
        assert_eq!(removed.query(), &query);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unobserved_query_is_collected() {
        let cache = QueryCache::default();
        cache.build(&with_gc(query_key!["gc"], Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(cache.len(), 1);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_gc_time_keeps_query() {
        let cache = QueryCache::default();
        cache.build(&with_gc(query_key!["forever"], Duration::MAX));
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_cancels_collection() {
        let cache = QueryCache::default();
        let query = cache.build(&with_gc(query_key!["re"], Duration::from_secs(10)));
        let listener: Arc<dyn QueryListener> = Arc::new(Listener);

        let id = query.add_observer(Arc::downgrade(&listener) as Weak<dyn QueryListener>);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(cache.len(), 1);

        query.remove_observer(id);
        assert_eq!(query.observer_count(), 0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        let id = query.add_observer(Arc::downgrade(&listener) as Weak<dyn QueryListener>);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(cache.len(), 1);

        query.remove_observer(id);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(cache.is_empty());
    }
}
