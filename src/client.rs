//! The client: the public entry point over a [`QueryCache`].

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::debug;

use crate::cache::{QueryCache, QueryCacheConfig, DEFAULT_EVENT_CAPACITY};
use crate::error::QueryError;
use crate::filter::{QueryFilters, QueryTypeFilter};
use crate::key::QueryKey;
use crate::manager::{FocusManager, OnlineManager};
use crate::observer::QueryObserver;
use crate::options::{QueryData, QueryDefaults, QueryObserverOptions, QueryOptions};
use crate::query::{downcast_data, CancelOptions};
use crate::retryer::RetryPolicy;
use crate::state::{FetchStatus, QueryState};

/// How [`QueryClient::refetch_queries`] starts fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefetchOptions {
    /// Replace an in-flight fetch of a query that already has data.
    pub cancel_refetch: bool,
    /// Return the first fetch error instead of swallowing it.
    pub throw_on_error: bool,
}

impl Default for RefetchOptions {
    fn default() -> Self {
        Self {
            cancel_refetch: true,
            throw_on_error: false,
        }
    }
}

struct ClientDefaults {
    client: QueryDefaults,
    by_prefix: Vec<(QueryKey, QueryDefaults)>,
}

/// Shared handle to a query cache and its configuration.
///
/// Cloning is cheap; clones operate on the same cache.
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), query_cache::QueryError> {
/// use query_cache::{query_key, QueryClient, QueryOptions};
///
/// let client = QueryClient::new();
/// let todos = client
///     .fetch_query(QueryOptions::new(query_key!["todos"], |_ctx| async {
///         Ok(vec!["write docs".to_string()])
///     }))
///     .await?;
/// assert_eq!(todos.len(), 1);
/// assert!(client.get_query_data::<Vec<String>>(&query_key!["todos"])?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct QueryClient {
    cache: QueryCache,
    defaults: Arc<RwLock<ClientDefaults>>,
    online: OnlineManager,
    focus: FocusManager,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("cache", &self.cache)
            .field("online", &self.online.is_online())
            .field("focused", &self.focus.is_focused())
            .finish()
    }
}

impl QueryClient {
    /// Create a client with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for customizing the client.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use query_cache::{QueryClient, QueryDefaults, RetryPolicy};
    ///
    /// let client = QueryClient::builder()
    ///     .default_options(QueryDefaults {
    ///         stale_time: Some(Duration::from_secs(60)),
    ///         retry: Some(RetryPolicy::Never),
    ///         ..Default::default()
    ///     })
    ///     .build();
    /// assert_eq!(client.get_default_options().stale_time, Some(Duration::from_secs(60)));
    /// ```
    pub fn builder() -> QueryClientBuilder {
        QueryClientBuilder::new()
    }

    /// The underlying cache.
    pub fn get_query_cache(&self) -> &QueryCache {
        &self.cache
    }

    /// The connectivity signal used by this client.
    pub fn online_manager(&self) -> &OnlineManager {
        &self.online
    }

    /// The focus signal used by this client.
    pub fn focus_manager(&self) -> &FocusManager {
        &self.focus
    }

    /// Defaults for `key`: prefix entries over client defaults.
    pub(crate) fn defaults_for(&self, key: &QueryKey) -> QueryDefaults {
        let defaults = self.defaults.read();
        Self::merge_prefix_defaults(&defaults.by_prefix, key).or(&defaults.client)
    }

    // Later registrations override earlier ones.
    fn merge_prefix_defaults(entries: &[(QueryKey, QueryDefaults)], key: &QueryKey) -> QueryDefaults {
        entries
            .iter()
            .filter(|(prefix, _)| key.matches_prefix(prefix))
            .fold(QueryDefaults::default(), |merged, (_, defaults)| {
                defaults.clone().or(&merged)
            })
    }

    /// Replace the client-wide defaults.
    pub fn set_default_options(&self, defaults: QueryDefaults) {
        self.defaults.write().client = defaults;
    }

    /// The client-wide defaults.
    pub fn get_default_options(&self) -> QueryDefaults {
        self.defaults.read().client.clone()
    }

    /// Register defaults for every key starting with `prefix`.
    ///
    /// Registering the same prefix again replaces its entry.
    pub fn set_query_defaults(&self, prefix: impl Into<QueryKey>, defaults: QueryDefaults) {
        let prefix = prefix.into();
        let mut all = self.defaults.write();
        match all.by_prefix.iter_mut().find(|(existing, _)| *existing == prefix) {
            Some(entry) => entry.1 = defaults,
            None => all.by_prefix.push((prefix, defaults)),
        }
    }

    /// The merged prefix defaults that apply to `key`.
    pub fn get_query_defaults(&self, key: &QueryKey) -> QueryDefaults {
        Self::merge_prefix_defaults(&self.defaults.read().by_prefix, key)
    }

    /// Create an observer bound to this client.
    pub fn watch_query<T: QueryData, D: QueryData>(
        &self,
        options: QueryObserverOptions<T, D>,
    ) -> QueryObserver<T, D> {
        QueryObserver::new(self, options)
    }
}

// ============================================================================
// Reads and writes
// ============================================================================

impl QueryClient {
    /// Fetch a query, or return its cached data while fresh.
    ///
    /// Concurrent calls for the same key share one fetch. Unless configured
    /// otherwise, imperative fetches do not retry.
    pub async fn fetch_query<T: QueryData>(
        &self,
        options: QueryOptions<T>,
    ) -> Result<Arc<T>, QueryError> {
        let mut fallback = self.defaults_for(options.key());
        if options.defaults.retry.is_none() && fallback.retry.is_none() {
            fallback.retry = Some(RetryPolicy::Never);
        }
        let erased = options.erase(&fallback);
        let query = self.cache.build(&erased);

        if !query.is_stale_by_time(erased.resolved.stale_time) {
            if let Some(data) = query.data::<T>()? {
                return Ok(data);
            }
        }
        let data = query.fetch(Some(&erased), false).await?;
        downcast_data(query.fingerprint(), data)
    }

    /// Warm the cache. Errors are discarded.
    pub async fn prefetch_query<T: QueryData>(&self, options: QueryOptions<T>) {
        if let Err(error) = self.fetch_query(options).await {
            debug!(%error, "prefetch failed");
        }
    }

    /// Return cached data regardless of staleness, fetching only if missing.
    pub async fn ensure_query_data<T: QueryData>(
        &self,
        options: QueryOptions<T>,
    ) -> Result<Arc<T>, QueryError> {
        if let Some(data) = self.get_query_data::<T>(options.key())? {
            return Ok(data);
        }
        self.fetch_query(options).await
    }

    /// Cached data for `key`.
    pub fn get_query_data<T: QueryData>(&self, key: &QueryKey) -> Result<Option<Arc<T>>, QueryError> {
        match self.cache.get(key.fingerprint()) {
            Some(query) => query.data::<T>(),
            None => Ok(None),
        }
    }

    /// Write data for `key` as a successful fetch would, creating the query
    /// if needed.
    ///
    /// Returns the stored value, which is the previous `Arc` if it was equal.
    pub fn set_query_data<T: QueryData>(&self, key: impl Into<QueryKey>, data: T) -> Arc<T> {
        let options = QueryOptions::<T>::without_fn(key);
        let erased = options.erase(&self.defaults_for(options.key()));
        let query = self.cache.build(&erased);
        let data = Arc::new(data);
        query
            .set_data(data.clone(), None)
            .downcast::<T>()
            .unwrap_or(data)
    }

    /// Write the value computed from the current data.
    ///
    /// An updater returning `None` leaves the cache untouched.
    pub fn update_query_data<T: QueryData>(
        &self,
        key: impl Into<QueryKey>,
        updater: impl FnOnce(Option<&T>) -> Option<T>,
    ) -> Option<Arc<T>> {
        let key = key.into();
        let current = self.get_query_data::<T>(&key).ok().flatten();
        let next = updater(current.as_deref())?;
        Some(self.set_query_data(key, next))
    }

    /// State snapshot for `key`.
    pub fn get_query_state(&self, key: &QueryKey) -> Option<QueryState> {
        self.cache.get(key.fingerprint()).map(|query| query.state())
    }

    /// Number of matching queries currently fetching.
    pub fn is_fetching(&self, filters: &QueryFilters) -> usize {
        self.cache
            .find_all(filters)
            .iter()
            .filter(|query| query.state().fetch_status == FetchStatus::Fetching)
            .count()
    }
}

// ============================================================================
// Bulk operations
// ============================================================================

impl QueryClient {
    /// Mark matching queries stale and refetch the active ones.
    pub async fn invalidate_queries(&self, filters: QueryFilters) -> Result<(), QueryError> {
        for query in self.cache.find_all(&filters) {
            query.invalidate();
        }
        self.refetch_queries(filters.kind(QueryTypeFilter::Active), RefetchOptions::default())
            .await
    }

    /// Refetch matching queries that are not disabled.
    ///
    /// Paused fetches are started but not awaited.
    pub async fn refetch_queries(
        &self,
        filters: QueryFilters,
        options: RefetchOptions,
    ) -> Result<(), QueryError> {
        let fetches: Vec<_> = self
            .cache
            .find_all(&filters)
            .into_iter()
            .filter(|query| !query.is_disabled())
            .filter_map(|query| {
                let fetch = query.fetch(None, options.cancel_refetch);
                (query.state().fetch_status != FetchStatus::Paused).then_some(fetch)
            })
            .collect();

        let outcomes = join_all(fetches).await;
        if options.throw_on_error {
            if let Some(error) = outcomes
                .into_iter()
                .filter_map(Result::err)
                .find(|error| !error.is_cancelled())
            {
                return Err(error);
            }
        }
        Ok(())
    }

    /// Cancel in-flight fetches of matching queries.
    ///
    /// Returns the number of fetches cancelled.
    pub fn cancel_queries(&self, filters: &QueryFilters, options: CancelOptions) -> usize {
        self.cache
            .find_all(filters)
            .iter()
            .filter(|query| query.cancel(options))
            .count()
    }

    /// Remove matching queries without observers.
    ///
    /// Returns the number of queries removed.
    pub fn remove_queries(&self, filters: &QueryFilters) -> usize {
        self.cache
            .find_all(filters)
            .iter()
            .filter(|query| self.cache.remove(query))
            .count()
    }

    /// Reset matching queries to their initial state and refetch the active ones.
    pub async fn reset_queries(&self, filters: QueryFilters) -> Result<(), QueryError> {
        for query in self.cache.find_all(&filters) {
            query.reset();
        }
        self.refetch_queries(filters.kind(QueryTypeFilter::Active), RefetchOptions::default())
            .await
    }

    /// Remove every query without observers.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Report connectivity. Coming back online refetches observers that
    /// refetch on reconnect.
    pub fn set_online(&self, online: bool) {
        if self.online.set_online(online) && online {
            self.cache.on_online();
        }
    }

    /// Report focus. Regaining focus refetches observers that refetch on
    /// window focus.
    pub fn set_focused(&self, focused: bool) {
        if self.focus.set_focused(focused) && focused {
            self.cache.on_focus();
        }
    }
}

/// Builder for [`QueryClient`].
pub struct QueryClientBuilder {
    defaults: QueryDefaults,
    cache_config: QueryCacheConfig,
    event_capacity: usize,
    online: OnlineManager,
    focus: FocusManager,
}

impl Default for QueryClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            defaults: QueryDefaults::default(),
            cache_config: QueryCacheConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            online: OnlineManager::default(),
            focus: FocusManager::default(),
        }
    }

    /// Client-wide query defaults.
    pub fn default_options(mut self, defaults: QueryDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Callbacks run after every settled fetch.
    pub fn cache_config(mut self, config: QueryCacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    /// Capacity of the cache event channel.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Share a connectivity signal.
    pub fn online_manager(mut self, online: OnlineManager) -> Self {
        self.online = online;
        self
    }

    /// Share a focus signal.
    pub fn focus_manager(mut self, focus: FocusManager) -> Self {
        self.focus = focus;
        self
    }

    /// Build the client.
    pub fn build(self) -> QueryClient {
        QueryClient {
            cache: QueryCache::with_parts(self.cache_config, self.online.clone(), self.event_capacity),
            defaults: Arc::new(RwLock::new(ClientDefaults {
                client: self.defaults,
                by_prefix: Vec::new(),
            })),
            online: self.online,
            focus: self.focus,
        }
    }
}
