//! Per-consumer views of a query.
//!
//! A [`QueryObserver`] binds to the query of its current key, derives a
//! [`QueryObserverResult`] from the query state and its own options, and
//! tells its listeners whenever that result changes. The result carries a
//! [`Thenable`] a rendering layer can suspend on.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slab::Slab;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::trace;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::options::{
    ErasedQueryOptions, PlaceholderData, QueryData, QueryObserverOptions, RefetchOn,
    ResolvedOptions,
};
use crate::query::{downcast_data, Query, QueryListener};
use crate::state::{ErasedData, FetchStatus, QueryState, QueryStatus};
use crate::thenable::{Thenable, ThenableState};

/// What an observer shows its consumer.
pub struct QueryObserverResult<D> {
    /// Key the result was derived for.
    pub key: QueryKey,
    /// Data/error availability, `Success` while placeholder data is shown.
    pub status: QueryStatus,
    /// Network activity.
    pub fetch_status: FetchStatus,
    /// Selected data, or placeholder data.
    pub data: Option<Arc<D>>,
    /// Last settled error.
    pub error: Option<QueryError>,
    /// When data was last written.
    pub data_updated_at: Option<Instant>,
    /// When the error was recorded.
    pub error_updated_at: Option<Instant>,
    /// Failed attempts in the current fetch.
    pub failure_count: u32,
    /// Error of the latest failed attempt.
    pub failure_reason: Option<QueryError>,
    /// `data` is a placeholder, not fetched data.
    pub is_placeholder_data: bool,
    /// The data needs revalidation.
    pub is_stale: bool,
    /// The query has settled at least once.
    pub is_fetched: bool,
    /// Settles with the real data or error of the current key.
    pub promise: Thenable<D>,
}

impl<D> Clone for QueryObserverResult<D> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            status: self.status,
            fetch_status: self.fetch_status,
            data: self.data.clone(),
            error: self.error.clone(),
            data_updated_at: self.data_updated_at,
            error_updated_at: self.error_updated_at,
            failure_count: self.failure_count,
            failure_reason: self.failure_reason.clone(),
            is_placeholder_data: self.is_placeholder_data,
            is_stale: self.is_stale,
            is_fetched: self.is_fetched,
            promise: self.promise.clone(),
        }
    }
}

impl<D> fmt::Debug for QueryObserverResult<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserverResult")
            .field("key", &self.key)
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("has_data", &self.data.is_some())
            .field("error", &self.error)
            .field("is_placeholder_data", &self.is_placeholder_data)
            .field("is_stale", &self.is_stale)
            .field("promise", &self.promise)
            .finish()
    }
}

fn same_arc<D>(a: &Option<Arc<D>>, b: &Option<Arc<D>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

fn same_error(a: &Option<QueryError>, b: &Option<QueryError>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.ptr_eq(b),
        (None, None) => true,
        _ => false,
    }
}

impl<D> QueryObserverResult<D> {
    /// No data and no error yet.
    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    /// Data is available.
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    /// The latest fetch failed.
    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    /// A fetch is running.
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    /// A fetch is waiting for connectivity.
    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }

    /// The first fetch is running.
    pub fn is_loading(&self) -> bool {
        self.is_pending() && self.is_fetching()
    }

    /// A fetch is running for a query that is no longer pending.
    pub fn is_refetching(&self) -> bool {
        self.is_fetching() && !self.is_pending()
    }

    /// The fetch failed without any data to fall back to.
    pub fn is_load_error(&self) -> bool {
        self.is_error() && self.data.is_none()
    }

    /// A refetch failed while data remains available.
    pub fn is_refetch_error(&self) -> bool {
        self.is_error() && self.data.is_some()
    }

    fn shallow_eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.status == other.status
            && self.fetch_status == other.fetch_status
            && same_arc(&self.data, &other.data)
            && same_error(&self.error, &other.error)
            && self.data_updated_at == other.data_updated_at
            && self.error_updated_at == other.error_updated_at
            && self.failure_count == other.failure_count
            && same_error(&self.failure_reason, &other.failure_reason)
            && self.is_placeholder_data == other.is_placeholder_data
            && self.is_stale == other.is_stale
            && self.is_fetched == other.is_fetched
            && self.promise.ptr_eq(&other.promise)
    }
}

type Listener<D> = Arc<dyn Fn(&QueryObserverResult<D>) + Send + Sync>;

/// Detaches a listener when dropped.
///
/// Dropping the last subscription of an observer unmounts it.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Unsubscribe now.
    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

struct SelectMemo<D> {
    raw: ErasedData,
    options_version: u64,
    output: Arc<D>,
}

struct PlaceholderMemo<T, D> {
    input: Arc<T>,
    output: Arc<D>,
}

struct ObserverState<T, D> {
    options: QueryObserverOptions<T, D>,
    options_version: u64,
    resolved: ResolvedOptions,
    erased: ErasedQueryOptions,
    query: Query,
    slot: Option<usize>,
    current: Option<QueryObserverResult<D>>,
    last_notified: Option<QueryObserverResult<D>>,
    memo_key: Option<(u64, u64)>,
    select_memo: Option<SelectMemo<D>>,
    placeholder_memo: Option<PlaceholderMemo<T, D>>,
    last_data: Option<Arc<D>>,
    thenable: Thenable<D>,
    interval: Option<AbortHandle>,
}

impl<T: QueryData, D: QueryData> ObserverState<T, D> {
    fn select(&mut self, raw: ErasedData) -> Result<Arc<D>, QueryError> {
        if let Some(memo) = &self.select_memo {
            if Arc::ptr_eq(&memo.raw, &raw) && memo.options_version == self.options_version {
                return Ok(memo.output.clone());
            }
        }
        let typed = downcast_data::<T>(self.query.fingerprint(), raw.clone())?;
        let mut output = (self.options.select)(&typed);
        if self.options.has_select {
            if let Some(memo) = &self.select_memo {
                if *memo.output == *output {
                    output = memo.output.clone();
                }
            }
        }
        self.select_memo = Some(SelectMemo {
            raw,
            options_version: self.options_version,
            output: output.clone(),
        });
        Ok(output)
    }

    fn placeholder(&mut self) -> Option<Arc<D>> {
        match &self.options.placeholder_data {
            PlaceholderData::None => None,
            PlaceholderData::KeepPrevious => self.last_data.clone(),
            PlaceholderData::Static(input) => {
                if let Some(memo) = &self.placeholder_memo {
                    if Arc::ptr_eq(&memo.input, input) {
                        return Some(memo.output.clone());
                    }
                }
                let output = (self.options.select)(input);
                self.placeholder_memo = Some(PlaceholderMemo {
                    input: input.clone(),
                    output: output.clone(),
                });
                Some(output)
            }
        }
    }

    fn is_stale(&self, state: &QueryState) -> bool {
        self.options.enabled && state.is_stale_by_time(self.resolved.stale_time)
    }

    fn derive(&mut self) -> QueryObserverResult<D> {
        let state = self.query.state();
        let memo_key = (state.epoch, self.options_version);
        if self.memo_key == Some(memo_key) {
            if let Some(current) = &self.current {
                if current.key == *self.query.key() {
                    let mut result = current.clone();
                    result.is_stale = self.is_stale(&state);
                    return result;
                }
            }
        }
        self.memo_key = Some(memo_key);

        let mut status = state.status;
        let mut error = state.error.clone();
        let mut data = None;
        if let Some(raw) = state.data.clone() {
            match self.select(raw) {
                Ok(selected) => data = Some(selected),
                Err(mismatch) => {
                    status = QueryStatus::Error;
                    error = Some(mismatch);
                }
            }
        }

        let mut is_placeholder_data = false;
        if data.is_none() && status == QueryStatus::Pending {
            if let Some(placeholder) = self.placeholder() {
                data = Some(placeholder);
                status = QueryStatus::Success;
                is_placeholder_data = true;
            }
        }

        if data.is_some() {
            self.last_data = data.clone();
        }

        self.settle_thenable(status, &data, &error, is_placeholder_data);

        QueryObserverResult {
            key: self.query.key().clone(),
            status,
            fetch_status: state.fetch_status,
            data,
            error,
            data_updated_at: state.data_updated_at,
            error_updated_at: state.error_updated_at,
            failure_count: state.fetch_failure_count,
            failure_reason: state.fetch_failure_reason.clone(),
            is_placeholder_data,
            is_stale: self.is_stale(&state),
            is_fetched: state.data_update_count > 0 || state.error_update_count > 0,
            promise: self.thenable.clone(),
        }
    }

    /// Keep the thenable while the result it settled with still holds;
    /// replace it when data or error identity moves on.
    fn settle_thenable(
        &mut self,
        status: QueryStatus,
        data: &Option<Arc<D>>,
        error: &Option<QueryError>,
        is_placeholder_data: bool,
    ) {
        let recreate = match self.thenable.peek() {
            ThenableState::Pending => false,
            ThenableState::Fulfilled(value) => {
                status == QueryStatus::Error
                    || is_placeholder_data
                    || !data.as_ref().is_some_and(|data| Arc::ptr_eq(data, &value))
            }
            ThenableState::Rejected(reason) => {
                status != QueryStatus::Error
                    || !error.as_ref().is_some_and(|error| error.ptr_eq(&reason))
            }
        };
        if recreate {
            self.thenable = Thenable::pending();
        }
        if is_placeholder_data {
            return;
        }
        if status == QueryStatus::Error {
            if let Some(error) = error {
                self.thenable.reject(error.clone());
            }
        } else if let Some(data) = data {
            self.thenable.resolve(data.clone());
        }
    }
}

struct ObserverInner<T, D> {
    client: QueryClient,
    state: Mutex<ObserverState<T, D>>,
    listeners: Mutex<Slab<Listener<D>>>,
}

/// Watches one query on behalf of one consumer.
///
/// ```no_run
/// # async fn demo() {
/// use query_cache::{query_key, QueryClient, QueryObserverOptions, QueryOptions};
///
/// let client = QueryClient::new();
/// let observer = client.watch_query(QueryObserverOptions::new(QueryOptions::new(
///     query_key!["todos"],
///     |_ctx| async { Ok(vec!["a".to_string()]) },
/// )));
/// let _subscription = observer.subscribe(|result| println!("{:?}", result.data));
/// let todos = observer.get_current_result().promise.wait().await;
/// # }
/// ```
pub struct QueryObserver<T, D = T> {
    inner: Arc<ObserverInner<T, D>>,
}

impl<T, D> Clone for QueryObserver<T, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, D> fmt::Debug for QueryObserver<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("QueryObserver")
            .field("key", state.query.key())
            .field("mounted", &state.slot.is_some())
            .field("listeners", &self.inner.listeners.lock().len())
            .finish()
    }
}

impl<T: QueryData, D: QueryData> QueryObserver<T, D> {
    /// Create an unmounted observer.
    ///
    /// The observer attaches to its query, and fetches if needed, once the
    /// first listener subscribes.
    pub fn new(client: &QueryClient, options: QueryObserverOptions<T, D>) -> Self {
        let fallback = client.defaults_for(options.key());
        let resolved = options.layered_defaults().or(&fallback).resolve();
        let erased = options.query.erase(&fallback);
        let query = client.get_query_cache().build(&erased);
        query.set_options(&erased);

        let observer = Self {
            inner: Arc::new(ObserverInner {
                client: client.clone(),
                state: Mutex::new(ObserverState {
                    options,
                    options_version: 0,
                    resolved,
                    erased,
                    query,
                    slot: None,
                    current: None,
                    last_notified: None,
                    memo_key: None,
                    select_memo: None,
                    placeholder_memo: None,
                    last_data: None,
                    thenable: Thenable::pending(),
                    interval: None,
                }),
                listeners: Mutex::new(Slab::new()),
            }),
        };
        observer.inner.refresh(None);
        observer
    }

    /// The current result, recomputed from the query if it changed.
    ///
    /// Repeated reads without intervening changes return the same promise.
    pub fn get_current_result(&self) -> QueryObserverResult<D> {
        let mut state = self.inner.state.lock();
        let result = state.derive();
        state.current = Some(result.clone());
        result
    }

    /// The query currently observed.
    pub fn query(&self) -> Query {
        self.inner.state.lock().query.clone()
    }

    /// The current options.
    pub fn options(&self) -> QueryObserverOptions<T, D> {
        self.inner.state.lock().options.clone()
    }

    /// Returns `true` if any listener is subscribed.
    pub fn has_listeners(&self) -> bool {
        !self.inner.listeners.lock().is_empty()
    }

    /// Call `listener` with every changed result.
    ///
    /// The first subscription mounts the observer: it attaches to the query
    /// and fetches if the data is missing or stale.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryObserverResult<D>) + Send + Sync + 'static,
    ) -> Subscription {
        let (id, first) = {
            let mut listeners = self.inner.listeners.lock();
            let id = listeners.insert(Arc::new(listener));
            (id, listeners.len() == 1)
        };
        if first {
            self.inner.mount(&self.inner);
        }
        let inner = self.inner.clone();
        Subscription {
            unsubscribe: Some(Box::new(move || inner.unsubscribe(id))),
        }
    }

    /// Replace the options.
    ///
    /// A changed key rebinds the observer to another query; a mounted
    /// observer then fetches if that query's data is missing or stale.
    pub fn set_options(&self, options: QueryObserverOptions<T, D>) {
        let fallback = self.inner.client.defaults_for(options.key());
        let resolved = options.layered_defaults().or(&fallback).resolve();
        let erased = options.query.erase(&fallback);

        let (previous, next, slot, was_enabled, enabled, interval_changed) = {
            let mut state = self.inner.state.lock();
            let was_enabled = state.options.enabled;
            let interval_changed = state.options.refetch_interval != options.refetch_interval
                || state.options.enabled != options.enabled;
            let enabled = options.enabled;
            state.options = options;
            state.options_version += 1;
            state.resolved = resolved;
            state.erased = erased.clone();
            state.placeholder_memo = None;
            (
                state.query.clone(),
                self.inner.client.get_query_cache().build(&erased),
                state.slot,
                was_enabled,
                enabled,
                interval_changed,
            )
        };
        next.set_options(&erased);

        let key_changed = previous != next;
        if key_changed {
            trace!(from = %previous.key(), to = %next.key(), "observer changed key");
            let slot = slot.map(|slot| {
                previous.remove_observer(slot);
                next.add_observer(self.inner.listener_handle(&self.inner))
            });
            let mut state = self.inner.state.lock();
            state.query = next.clone();
            state.slot = slot;
        }

        if slot.is_some() {
            let newly_enabled = enabled && !was_enabled;
            if (key_changed || newly_enabled) && self.inner.is_stale() {
                drop(next.fetch(Some(&erased), false));
            }
            if key_changed || interval_changed {
                self.inner.restart_interval(&self.inner);
            }
        }
        self.inner.refresh(None);
    }

    /// Refetch and return the result once the fetch settles.
    ///
    /// Fetch errors are reported through the result.
    pub async fn refetch(&self) -> QueryObserverResult<D> {
        let (query, erased) = {
            let state = self.inner.state.lock();
            (state.query.clone(), state.erased.clone())
        };
        let _ = query.fetch(Some(&erased), true).await;
        self.inner.refresh(None);
        self.get_current_result()
    }
}

impl<T: QueryData, D: QueryData> ObserverInner<T, D> {
    fn listener_handle(&self, this: &Arc<Self>) -> Weak<dyn QueryListener> {
        let weak: Weak<Self> = Arc::downgrade(this);
        weak
    }

    fn mount(&self, this: &Arc<Self>) {
        let query = self.bind_cached_query();
        let slot = query.add_observer(self.listener_handle(this));
        let (erased, fetch) = {
            let mut state = self.state.lock();
            state.slot = Some(slot);
            (state.erased.clone(), self.should_fetch_on_mount(&state))
        };
        if fetch {
            drop(query.fetch(Some(&erased), false));
        }
        self.restart_interval(this);
        self.refresh(None);
    }

    /// The cached query for the current key.
    ///
    /// An unmounted observer's query may have been collected; the observer
    /// then moves to the entry the cache holds now.
    fn bind_cached_query(&self) -> Query {
        let (current, erased) = {
            let state = self.state.lock();
            (state.query.clone(), state.erased.clone())
        };
        let cached = self.client.get_query_cache().build(&erased);
        if cached == current {
            return current;
        }
        trace!(key = %cached.key(), "observer rebound to a rebuilt query");
        cached.set_options(&erased);
        let mut state = self.state.lock();
        state.query = cached.clone();
        state.options_version += 1;
        cached
    }

    fn unmount(&self) {
        let (query, slot, interval) = {
            let mut state = self.state.lock();
            (state.query.clone(), state.slot.take(), state.interval.take())
        };
        if let Some(interval) = interval {
            interval.abort();
        }
        if let Some(slot) = slot {
            query.remove_observer(slot);
        }
    }

    fn unsubscribe(&self, id: usize) {
        let last = {
            let mut listeners = self.listeners.lock();
            listeners.try_remove(id).is_some() && listeners.is_empty()
        };
        if last {
            self.unmount();
        }
    }

    fn should_fetch_on_mount(&self, state: &ObserverState<T, D>) -> bool {
        if !state.options.enabled {
            return false;
        }
        let query_state = state.query.state();
        let load = query_state.data_updated_at.is_none()
            && !(query_state.status == QueryStatus::Error && !state.resolved.retry_on_mount);
        load || (query_state.data.is_some()
            && Self::should_fetch_on(state, &query_state, state.resolved.refetch_on_mount))
    }

    fn should_fetch_on(
        state: &ObserverState<T, D>,
        query_state: &QueryState,
        trigger: RefetchOn,
    ) -> bool {
        if !state.options.enabled {
            return false;
        }
        match trigger {
            RefetchOn::Never => false,
            RefetchOn::Always => true,
            RefetchOn::IfStale => state.is_stale(query_state),
        }
    }

    fn restart_interval(&self, this: &Arc<Self>) {
        let mut state = self.state.lock();
        if let Some(interval) = state.interval.take() {
            interval.abort();
        }
        let Some(period) = state.options.refetch_interval else {
            return;
        };
        if state.slot.is_none() || !state.options.enabled || period.is_zero() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let in_background = state.options.refetch_interval_in_background;
        let weak = Arc::downgrade(this);
        let task = runtime.spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if in_background || inner.client.focus_manager().is_focused() {
                    let (query, erased) = {
                        let state = inner.state.lock();
                        (state.query.clone(), state.erased.clone())
                    };
                    drop(query.fetch(Some(&erased), false));
                }
            }
        });
        state.interval = Some(task.abort_handle());
    }

    /// Recompute the result and notify listeners if it changed.
    ///
    /// With `fingerprint`, updates for any other query are discarded.
    fn refresh(&self, fingerprint: Option<&str>) {
        let (result, listeners) = {
            let mut state = self.state.lock();
            if let Some(fingerprint) = fingerprint {
                if fingerprint != state.query.fingerprint() {
                    trace!(fingerprint, "discarding update for a previous key");
                    return;
                }
            }
            let next = state.derive();
            state.current = Some(next.clone());
            let changed = state
                .last_notified
                .as_ref()
                .map_or(true, |notified| !notified.shallow_eq(&next));
            state.last_notified = Some(next.clone());
            if !changed {
                return;
            }
            let listeners: Vec<Listener<D>> = self
                .listeners
                .lock()
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect();
            (next, listeners)
        };
        for listener in listeners {
            listener(&result);
        }
    }
}

impl<T: QueryData, D: QueryData> QueryListener for ObserverInner<T, D> {
    fn on_query_update(&self, fingerprint: &str) {
        self.refresh(Some(fingerprint));
    }

    fn is_enabled(&self) -> bool {
        self.state.lock().options.enabled
    }

    fn is_stale(&self) -> bool {
        let state = self.state.lock();
        let query_state = state.query.state();
        state.is_stale(&query_state)
    }

    fn should_fetch_on_window_focus(&self) -> bool {
        let state = self.state.lock();
        let query_state = state.query.state();
        Self::should_fetch_on(&state, &query_state, state.resolved.refetch_on_window_focus)
    }

    fn should_fetch_on_reconnect(&self) -> bool {
        let state = self.state.lock();
        let query_state = state.query.state();
        Self::should_fetch_on(&state, &query_state, state.resolved.refetch_on_reconnect)
    }
}
