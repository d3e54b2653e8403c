//! Query and observer options, and how defaults are resolved.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;
use crate::key::QueryKey;
use crate::retryer::{NetworkMode, RetryConfig, RetryDelay, RetryPolicy};
use crate::state::{erased_eq, DataEq, ErasedData};

/// Default retention window of unobserved queries.
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(5 * 60);

/// Values that can be cached.
///
/// `PartialEq` drives structural sharing: a refetch producing an equal value
/// keeps the previously cached `Arc`.
pub trait QueryData: PartialEq + Send + Sync + 'static {}

impl<T> QueryData for T where T: PartialEq + Send + Sync + 'static {}

/// Passed to every query function invocation.
#[derive(Debug, Clone)]
pub struct QueryFnContext {
    /// Key of the query being fetched.
    pub query_key: QueryKey,
    /// Fires when the fetch is cancelled.
    pub cancellation: CancellationToken,
}

/// Fetches the value of a query.
///
/// Implemented for every `Fn(QueryFnContext) -> impl Future<Output = Result<T, QueryError>>`.
#[async_trait]
pub trait QueryFn<T>: Send + Sync + 'static {
    /// Perform one fetch attempt.
    async fn call(&self, ctx: QueryFnContext) -> Result<T, QueryError>;
}

#[async_trait]
impl<T, F, Fut> QueryFn<T> for F
where
    T: Send + 'static,
    F: Fn(QueryFnContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
{
    async fn call(&self, ctx: QueryFnContext) -> Result<T, QueryError> {
        self(ctx).await
    }
}

pub(crate) type ErasedQueryFn =
    Arc<dyn Fn(QueryFnContext) -> BoxFuture<'static, Result<ErasedData, QueryError>> + Send + Sync>;

fn erase_query_fn<T: QueryData>(query_fn: Arc<dyn QueryFn<T>>) -> ErasedQueryFn {
    Arc::new(move |ctx| {
        let query_fn = query_fn.clone();
        Box::pin(async move {
            let data = query_fn.call(ctx).await?;
            Ok(Arc::new(data) as ErasedData)
        })
    })
}

/// Data a query starts with before its first fetch.
pub enum InitialData<T> {
    /// A ready value.
    Value(Arc<T>),
    /// Computed when the query is created; `None` means no initial data.
    Lazy(Arc<dyn Fn() -> Option<T> + Send + Sync>),
}

impl<T> Clone for InitialData<T> {
    fn clone(&self) -> Self {
        match self {
            InitialData::Value(v) => InitialData::Value(v.clone()),
            InitialData::Lazy(f) => InitialData::Lazy(f.clone()),
        }
    }
}

impl<T: Send + Sync + 'static> InitialData<T> {
    fn produce(&self) -> Option<ErasedData> {
        match self {
            InitialData::Value(v) => Some(v.clone() as ErasedData),
            InitialData::Lazy(f) => f().map(|v| Arc::new(v) as ErasedData),
        }
    }
}

/// When a refetch trigger actually refetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RefetchOn {
    /// Never refetch on this trigger.
    Never,
    /// Refetch if the data is stale.
    #[default]
    IfStale,
    /// Always refetch.
    Always,
}

impl From<bool> for RefetchOn {
    fn from(refetch: bool) -> Self {
        if refetch {
            RefetchOn::IfStale
        } else {
            RefetchOn::Never
        }
    }
}

/// Optional defaults, layered client-wide and per key prefix.
#[derive(Debug, Clone, Default)]
pub struct QueryDefaults {
    /// Time before fetched data goes stale. `Duration::MAX` never goes stale.
    pub stale_time: Option<Duration>,
    /// Retention of unobserved queries. `Duration::MAX` disables collection.
    pub gc_time: Option<Duration>,
    /// Retry policy.
    pub retry: Option<RetryPolicy>,
    /// Backoff between retries.
    pub retry_delay: Option<RetryDelay>,
    /// Connectivity requirements.
    pub network_mode: Option<NetworkMode>,
    /// Refetch when an observer mounts.
    pub refetch_on_mount: Option<RefetchOn>,
    /// Refetch when the application regains focus.
    pub refetch_on_window_focus: Option<RefetchOn>,
    /// Refetch when connectivity returns.
    pub refetch_on_reconnect: Option<RefetchOn>,
    /// Fetch on mount even if the query holds an error.
    pub retry_on_mount: Option<bool>,
    /// Keep the previous `Arc` when refetched data is equal.
    pub structural_sharing: Option<bool>,
}

impl QueryDefaults {
    /// Fill unset fields from `fallback`.
    #[must_use]
    pub fn or(self, fallback: &QueryDefaults) -> QueryDefaults {
        QueryDefaults {
            stale_time: self.stale_time.or(fallback.stale_time),
            gc_time: self.gc_time.or(fallback.gc_time),
            retry: self.retry.or_else(|| fallback.retry.clone()),
            retry_delay: self.retry_delay.or_else(|| fallback.retry_delay.clone()),
            network_mode: self.network_mode.or(fallback.network_mode),
            refetch_on_mount: self.refetch_on_mount.or(fallback.refetch_on_mount),
            refetch_on_window_focus: self
                .refetch_on_window_focus
                .or(fallback.refetch_on_window_focus),
            refetch_on_reconnect: self.refetch_on_reconnect.or(fallback.refetch_on_reconnect),
            retry_on_mount: self.retry_on_mount.or(fallback.retry_on_mount),
            structural_sharing: self.structural_sharing.or(fallback.structural_sharing),
        }
    }

    pub(crate) fn resolve(self) -> ResolvedOptions {
        ResolvedOptions {
            stale_time: self.stale_time.unwrap_or(Duration::ZERO),
            gc_time: self.gc_time.unwrap_or(DEFAULT_GC_TIME),
            retry: RetryConfig {
                retry: self.retry.unwrap_or_default(),
                retry_delay: self.retry_delay.unwrap_or_default(),
                network_mode: self.network_mode.unwrap_or_default(),
            },
            refetch_on_mount: self.refetch_on_mount.unwrap_or_default(),
            refetch_on_window_focus: self.refetch_on_window_focus.unwrap_or_default(),
            refetch_on_reconnect: self.refetch_on_reconnect.unwrap_or_default(),
            retry_on_mount: self.retry_on_mount.unwrap_or(true),
            structural_sharing: self.structural_sharing.unwrap_or(true),
        }
    }
}

/// Options with every default applied.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub retry: RetryConfig,
    pub refetch_on_mount: RefetchOn,
    pub refetch_on_window_focus: RefetchOn,
    pub refetch_on_reconnect: RefetchOn,
    pub retry_on_mount: bool,
    pub structural_sharing: bool,
}

/// Everything the cache needs to fetch one query, with the value type erased.
#[derive(Clone)]
pub(crate) struct ErasedQueryOptions {
    pub key: QueryKey,
    pub query_fn: Option<ErasedQueryFn>,
    pub resolved: ResolvedOptions,
    pub initial_data: Option<Arc<dyn Fn() -> Option<ErasedData> + Send + Sync>>,
    pub initial_data_updated_at: Option<Instant>,
    pub data_eq: DataEq,
    pub type_name: &'static str,
}

/// Options of a single query.
///
/// ```
/// use std::time::Duration;
/// use query_cache::{query_key, QueryOptions, RetryPolicy};
///
/// let options = QueryOptions::new(query_key!["todos"], |_ctx| async {
///     Ok(vec!["write docs".to_string()])
/// })
/// .stale_time(Duration::from_secs(30))
/// .retry(RetryPolicy::Never);
/// assert_eq!(options.key(), &query_key!["todos"]);
/// ```
pub struct QueryOptions<T> {
    pub(crate) key: QueryKey,
    pub(crate) query_fn: Option<Arc<dyn QueryFn<T>>>,
    pub(crate) initial_data: Option<InitialData<T>>,
    pub(crate) initial_data_updated_at: Option<Instant>,
    pub(crate) defaults: QueryDefaults,
}

impl<T> Clone for QueryOptions<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            query_fn: self.query_fn.clone(),
            initial_data: self.initial_data.clone(),
            initial_data_updated_at: self.initial_data_updated_at,
            defaults: self.defaults.clone(),
        }
    }
}

impl<T> fmt::Debug for QueryOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("key", &self.key)
            .field("has_query_fn", &self.query_fn.is_some())
            .field("has_initial_data", &self.initial_data.is_some())
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl<T: QueryData> QueryOptions<T> {
    /// Options for `key` fetched by the async closure `query_fn`.
    pub fn new<F, Fut>(key: impl Into<QueryKey>, query_fn: F) -> Self
    where
        F: Fn(QueryFnContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        Self::with_query_fn(key, query_fn)
    }

    /// Options for `key` fetched by any [`QueryFn`] implementation.
    pub fn with_query_fn(key: impl Into<QueryKey>, query_fn: impl QueryFn<T>) -> Self {
        Self {
            key: key.into(),
            query_fn: Some(Arc::new(query_fn)),
            initial_data: None,
            initial_data_updated_at: None,
            defaults: QueryDefaults::default(),
        }
    }

    /// Options for `key` without a query function.
    ///
    /// Useful for queries only written through `set_query_data`; fetching
    /// them fails with [`QueryError::MissingQueryFn`].
    pub fn without_fn(key: impl Into<QueryKey>) -> Self {
        Self {
            key: key.into(),
            query_fn: None,
            initial_data: None,
            initial_data_updated_at: None,
            defaults: QueryDefaults::default(),
        }
    }

    /// The query key.
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Replace the key, keeping every other option.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.key = key.into();
        self
    }

    /// Time before fetched data goes stale.
    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.defaults.stale_time = Some(stale_time);
        self
    }

    /// Retention window once unobserved.
    #[must_use]
    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.defaults.gc_time = Some(gc_time);
        self
    }

    /// Retry policy.
    #[must_use]
    pub fn retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.defaults.retry = Some(retry.into());
        self
    }

    /// Backoff between retries.
    #[must_use]
    pub fn retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.defaults.retry_delay = Some(retry_delay);
        self
    }

    /// Connectivity requirements.
    #[must_use]
    pub fn network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.defaults.network_mode = Some(network_mode);
        self
    }

    /// Toggle structural sharing of refetched data.
    #[must_use]
    pub fn structural_sharing(mut self, enabled: bool) -> Self {
        self.defaults.structural_sharing = Some(enabled);
        self
    }

    /// Seed a newly created query with `data`.
    #[must_use]
    pub fn initial_data(mut self, data: T) -> Self {
        self.initial_data = Some(InitialData::Value(Arc::new(data)));
        self
    }

    /// Seed a newly created query lazily.
    #[must_use]
    pub fn initial_data_fn(mut self, f: impl Fn() -> Option<T> + Send + Sync + 'static) -> Self {
        self.initial_data = Some(InitialData::Lazy(Arc::new(f)));
        self
    }

    /// Timestamp recorded for the initial data. Defaults to creation time.
    #[must_use]
    pub fn initial_data_updated_at(mut self, at: Instant) -> Self {
        self.initial_data_updated_at = Some(at);
        self
    }

    pub(crate) fn erase(&self, fallback: &QueryDefaults) -> ErasedQueryOptions {
        ErasedQueryOptions {
            key: self.key.clone(),
            query_fn: self.query_fn.clone().map(erase_query_fn),
            resolved: self.defaults.clone().or(fallback).resolve(),
            initial_data: self.initial_data.clone().map(|initial| {
                Arc::new(move || initial.produce())
                    as Arc<dyn Fn() -> Option<ErasedData> + Send + Sync>
            }),
            initial_data_updated_at: self.initial_data_updated_at,
            data_eq: erased_eq::<T>,
            type_name: std::any::type_name::<T>(),
        }
    }
}

/// Data shown while a query has none.
pub enum PlaceholderData<T> {
    /// No placeholder.
    None,
    /// A fixed value, passed through `select`.
    Static(Arc<T>),
    /// The previous key's result while the new key is loading.
    KeepPrevious,
}

impl<T> Clone for PlaceholderData<T> {
    fn clone(&self) -> Self {
        match self {
            PlaceholderData::None => PlaceholderData::None,
            PlaceholderData::Static(v) => PlaceholderData::Static(v.clone()),
            PlaceholderData::KeepPrevious => PlaceholderData::KeepPrevious,
        }
    }
}

pub(crate) type Selector<T, D> = Arc<dyn Fn(&Arc<T>) -> Arc<D> + Send + Sync>;

/// Options of a [`QueryObserver`](crate::QueryObserver).
///
/// `D` is the type produced by `select`; without a selector it equals `T`.
pub struct QueryObserverOptions<T, D = T> {
    pub(crate) query: QueryOptions<T>,
    pub(crate) enabled: bool,
    pub(crate) select: Selector<T, D>,
    pub(crate) has_select: bool,
    pub(crate) placeholder_data: PlaceholderData<T>,
    pub(crate) refetch_interval: Option<Duration>,
    pub(crate) refetch_interval_in_background: bool,
    pub(crate) observer_defaults: QueryDefaults,
}

impl<T, D> Clone for QueryObserverOptions<T, D> {
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
            enabled: self.enabled,
            select: self.select.clone(),
            has_select: self.has_select,
            placeholder_data: self.placeholder_data.clone(),
            refetch_interval: self.refetch_interval,
            refetch_interval_in_background: self.refetch_interval_in_background,
            observer_defaults: self.observer_defaults.clone(),
        }
    }
}

impl<T: QueryData> From<QueryOptions<T>> for QueryObserverOptions<T, T> {
    fn from(query: QueryOptions<T>) -> Self {
        Self::new(query)
    }
}

impl<T: QueryData> QueryObserverOptions<T, T> {
    /// Observe `query` without transforming its data.
    pub fn new(query: QueryOptions<T>) -> Self {
        Self {
            query,
            enabled: true,
            select: Arc::new(|data: &Arc<T>| data.clone()),
            has_select: false,
            placeholder_data: PlaceholderData::None,
            refetch_interval: None,
            refetch_interval_in_background: false,
            observer_defaults: QueryDefaults::default(),
        }
    }

    /// Transform the data seen by this observer.
    ///
    /// The selector reruns only when the cached data changes; equal outputs
    /// keep their previous `Arc`. A static placeholder is passed through the
    /// selector too.
    pub fn select<D: QueryData>(
        self,
        select: impl Fn(&T) -> D + Send + Sync + 'static,
    ) -> QueryObserverOptions<T, D> {
        QueryObserverOptions {
            query: self.query,
            enabled: self.enabled,
            select: Arc::new(move |data: &Arc<T>| Arc::new(select(data))),
            has_select: true,
            placeholder_data: self.placeholder_data,
            refetch_interval: self.refetch_interval,
            refetch_interval_in_background: self.refetch_interval_in_background,
            observer_defaults: self.observer_defaults,
        }
    }
}

impl<T: QueryData, D: QueryData> QueryObserverOptions<T, D> {
    /// The underlying query options.
    pub fn query(&self) -> &QueryOptions<T> {
        &self.query
    }

    /// The query key.
    pub fn key(&self) -> &QueryKey {
        &self.query.key
    }

    /// Replace the key, keeping every other option.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.query.key = key.into();
        self
    }

    /// Disable or enable automatic fetching.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Show `value` while the query has no data.
    #[must_use]
    pub fn placeholder_data(mut self, value: T) -> Self {
        self.placeholder_data = PlaceholderData::Static(Arc::new(value));
        self
    }

    /// Keep showing the previous key's data while a new key loads.
    #[must_use]
    pub fn keep_previous_data(mut self) -> Self {
        self.placeholder_data = PlaceholderData::KeepPrevious;
        self
    }

    /// Refetch every `interval` while mounted.
    #[must_use]
    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    /// Keep the interval running while the application is unfocused.
    #[must_use]
    pub fn refetch_interval_in_background(mut self, enabled: bool) -> Self {
        self.refetch_interval_in_background = enabled;
        self
    }

    /// Refetch when the observer mounts.
    #[must_use]
    pub fn refetch_on_mount(mut self, refetch: impl Into<RefetchOn>) -> Self {
        self.observer_defaults.refetch_on_mount = Some(refetch.into());
        self
    }

    /// Refetch when focus returns.
    #[must_use]
    pub fn refetch_on_window_focus(mut self, refetch: impl Into<RefetchOn>) -> Self {
        self.observer_defaults.refetch_on_window_focus = Some(refetch.into());
        self
    }

    /// Refetch when connectivity returns.
    #[must_use]
    pub fn refetch_on_reconnect(mut self, refetch: impl Into<RefetchOn>) -> Self {
        self.observer_defaults.refetch_on_reconnect = Some(refetch.into());
        self
    }

    /// Fetch on mount even when the query holds an error.
    #[must_use]
    pub fn retry_on_mount(mut self, retry: bool) -> Self {
        self.observer_defaults.retry_on_mount = Some(retry);
        self
    }

    /// Time before fetched data goes stale.
    #[must_use]
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.query = self.query.stale_time(stale_time);
        self
    }

    /// Retention window once unobserved.
    #[must_use]
    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.query = self.query.gc_time(gc_time);
        self
    }

    /// Retry policy.
    #[must_use]
    pub fn retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.query = self.query.retry(retry);
        self
    }

    pub(crate) fn layered_defaults(&self) -> QueryDefaults {
        self.observer_defaults.clone().or(&self.query.defaults)
    }
}
