//! A single cache slot and its fetch lifecycle.
//!
//! A [`Query`] owns the state of one fingerprint, at most one in-flight fetch,
//! and the registry of attached observers. Every state transition goes
//! through [`reduce`](crate::state) under the entity lock; observers and cache
//! subscribers are notified after the lock is released, once per transition.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use slab::Slab;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::cache::{CacheShared, QueryCacheEvent};
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::manager::OnlineManager;
use crate::options::{ErasedQueryOptions, QueryFnContext};
use crate::retryer::{NetworkMode, RetryHooks, Retryer};
use crate::state::{reduce, Action, ActionKind, ErasedData, FetchStatus, QueryState};

/// Deduplicated outcome of one fetch, awaitable by any number of callers.
pub(crate) type FetchFuture = Shared<BoxFuture<'static, Result<ErasedData, QueryError>>>;

/// Receives state changes of the queries an observer is attached to.
pub(crate) trait QueryListener: Send + Sync {
    /// The query identified by `fingerprint` changed state.
    fn on_query_update(&self, fingerprint: &str);

    fn is_enabled(&self) -> bool;

    fn is_stale(&self) -> bool;

    fn should_fetch_on_window_focus(&self) -> bool;

    fn should_fetch_on_reconnect(&self) -> bool;
}

/// How [`Query::cancel`] treats the interrupted fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOptions {
    /// Restore the state from before the fetch started, keeping any data
    /// written since.
    pub revert: bool,
    /// Skip notifying observers and cache subscribers.
    pub silent: bool,
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self {
            revert: true,
            silent: false,
        }
    }
}

struct ActiveFetch {
    generation: u64,
    token: CancellationToken,
    revert: QueryState,
    result: FetchFuture,
}

struct QueryCore {
    state: QueryState,
    options: ErasedQueryOptions,
    gc_time: Duration,
    generation: u64,
    active: Option<ActiveFetch>,
    gc_task: Option<AbortHandle>,
}

struct QueryInner {
    key: QueryKey,
    cache: Weak<CacheShared>,
    online: OnlineManager,
    core: Mutex<QueryCore>,
    observers: Mutex<Slab<Weak<dyn QueryListener>>>,
}

/// Handle to one cache entry.
///
/// Handles are cheap to clone and compare by identity.
#[derive(Clone)]
pub struct Query {
    inner: Arc<QueryInner>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.inner.key)
            .field("state", &self.inner.core.lock().state)
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Query {}

fn initial_state(options: &ErasedQueryOptions) -> QueryState {
    match options.initial_data.as_ref().and_then(|produce| produce()) {
        Some(data) => QueryState::with_initial_data(
            data,
            options.initial_data_updated_at.unwrap_or_else(Instant::now),
        ),
        None => QueryState::empty(),
    }
}

impl Query {
    pub(crate) fn new(
        options: ErasedQueryOptions,
        cache: Weak<CacheShared>,
        online: OnlineManager,
    ) -> Self {
        let state = initial_state(&options);
        Self {
            inner: Arc::new(QueryInner {
                key: options.key.clone(),
                cache,
                online,
                core: Mutex::new(QueryCore {
                    state,
                    gc_time: options.resolved.gc_time,
                    options,
                    generation: 0,
                    active: None,
                    gc_task: None,
                }),
                observers: Mutex::new(Slab::new()),
            }),
        }
    }

    /// The query key.
    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    /// Canonical fingerprint of the key.
    pub fn fingerprint(&self) -> &str {
        self.inner.key.fingerprint()
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> QueryState {
        self.inner.core.lock().state.clone()
    }

    /// Typed snapshot of the cached data.
    pub fn data<T: Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>, QueryError> {
        let data = self.inner.core.lock().state.data.clone();
        data.map(|data| downcast_data(self.fingerprint(), data))
            .transpose()
    }

    /// Number of attached observers.
    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }

    /// Retention window applied once unobserved.
    pub fn gc_time(&self) -> Duration {
        self.inner.core.lock().gc_time
    }

    /// Returns `true` if any attached observer is enabled.
    pub fn is_active(&self) -> bool {
        self.listeners().iter().any(|listener| listener.is_enabled())
    }

    /// Returns `true` if observers are attached and none is enabled.
    pub fn is_disabled(&self) -> bool {
        self.observer_count() > 0 && !self.is_active()
    }

    /// Staleness as seen by the attached observers, or by missing or
    /// invalidated data when unobserved.
    pub fn is_stale(&self) -> bool {
        let listeners = self.listeners();
        if !listeners.is_empty() {
            return listeners.iter().any(|listener| listener.is_stale());
        }
        let core = self.inner.core.lock();
        core.state.data.is_none() || core.state.is_invalidated
    }

    /// Returns `true` if the data is older than `stale_time`.
    pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        self.inner.core.lock().state.is_stale_by_time(stale_time)
    }

    /// Mark the data stale regardless of its age.
    pub fn invalidate(&self) {
        {
            let mut core = self.inner.core.lock();
            if core.state.is_invalidated {
                return;
            }
            reduce(&mut core.state, Action::Invalidate);
        }
        self.notify(ActionKind::Invalidate);
    }

    /// Cancel the in-flight fetch.
    ///
    /// Returns `false` if nothing was fetching. Callers awaiting the fetch
    /// receive [`QueryError::Cancelled`]; cached data and errors are never
    /// overwritten by a cancelled fetch.
    pub fn cancel(&self, options: CancelOptions) -> bool {
        {
            let mut core = self.inner.core.lock();
            let Some(active) = Self::abort_active(&mut core) else {
                return false;
            };
            let mut next = core.state.clone();
            next.fetch_status = FetchStatus::Idle;
            if options.revert {
                next.fetch_failure_count = active.revert.fetch_failure_count;
                next.fetch_failure_reason = active.revert.fetch_failure_reason.clone();
                // Data written while fetching is newer than the revert point.
                if next.data_update_count == active.revert.data_update_count {
                    next.status = active.revert.status;
                    next.error = active.revert.error.clone();
                }
            }
            reduce(&mut core.state, Action::SetState(Box::new(next)));
            if self.observer_count() == 0 {
                self.schedule_gc_locked(&mut core);
            }
        }
        debug!(key = %self.inner.key, "cancelled fetch");
        if !options.silent {
            self.notify(ActionKind::SetState);
        }
        true
    }

    /// Restore the state the query was created with.
    pub fn reset(&self) {
        {
            let mut core = self.inner.core.lock();
            Self::abort_active(&mut core);
            let next = initial_state(&core.options);
            reduce(&mut core.state, Action::SetState(Box::new(next)));
        }
        self.notify(ActionKind::SetState);
    }

    fn abort_active(core: &mut QueryCore) -> Option<ActiveFetch> {
        let active = core.active.take()?;
        core.generation += 1;
        active.token.cancel();
        Some(active)
    }

    pub(crate) fn is_fetching(&self) -> bool {
        self.inner.core.lock().state.fetch_status != FetchStatus::Idle
    }

    /// Apply the options of a caller, keeping the existing query function
    /// when the caller has none.
    pub(crate) fn set_options(&self, options: &ErasedQueryOptions) {
        let mut core = self.inner.core.lock();
        if core.options.type_name != options.type_name {
            warn!(
                key = %self.inner.key,
                cached = core.options.type_name,
                requested = options.type_name,
                "query used with another data type"
            );
        }
        let query_fn = options
            .query_fn
            .clone()
            .or_else(|| core.options.query_fn.clone());
        core.gc_time = core.gc_time.max(options.resolved.gc_time);
        core.options = ErasedQueryOptions {
            query_fn,
            ..options.clone()
        };
    }

    /// Start a fetch, or join the one in flight.
    ///
    /// With `cancel_refetch`, an in-flight fetch of a query that already has
    /// data is replaced by a new one.
    pub(crate) fn fetch(
        &self,
        options: Option<&ErasedQueryOptions>,
        cancel_refetch: bool,
    ) -> FetchFuture {
        if let Some(options) = options {
            self.set_options(options);
        }

        let action;
        let result;
        {
            let mut core = self.inner.core.lock();
            if core.active.is_some() && core.state.data_updated_at.is_some() && cancel_refetch {
                trace!(key = %self.inner.key, "replacing in-flight fetch");
                Self::abort_active(&mut core);
            }
            if let Some(active) = &core.active {
                trace!(key = %self.inner.key, "joining in-flight fetch");
                return active.result.clone();
            }

            let Some(query_fn) = core.options.query_fn.clone() else {
                warn!(key = %self.inner.key, "fetch requested without a query function");
                return ready(Err(QueryError::MissingQueryFn {
                    fingerprint: self.fingerprint().to_string(),
                }));
            };
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                warn!(key = %self.inner.key, "fetch requested outside a Tokio runtime");
                return ready(Err(QueryError::NoRuntime));
            };

            core.generation += 1;
            let generation = core.generation;
            let token = CancellationToken::new();
            let config = core.options.resolved.retry.clone();
            let paused = config.network_mode == NetworkMode::Online && !self.inner.online.is_online();
            let revert = core.state.clone();

            let (tx, rx) = oneshot::channel();
            result = rx
                .map(|received| received.unwrap_or(Err(QueryError::Cancelled)))
                .boxed()
                .shared();

            let start = Action::Fetch { paused };
            action = start.kind();
            reduce(&mut core.state, start);
            core.active = Some(ActiveFetch {
                generation,
                token: token.clone(),
                revert,
                result: result.clone(),
            });
            if let Some(gc) = core.gc_task.take() {
                gc.abort();
            }

            debug!(key = %self.inner.key, generation, "starting fetch");
            let query = self.clone();
            runtime.spawn(async move {
                let hooks = Arc::new(FetchHooks {
                    query: query.clone(),
                    generation,
                });
                let retryer = Retryer::new(config)
                    .with_token(token.clone())
                    .with_online_manager(query.inner.online.clone())
                    .with_hooks(hooks);
                let key = query.inner.key.clone();
                let outcome = retryer
                    .run(|| {
                        query_fn(QueryFnContext {
                            query_key: key.clone(),
                            cancellation: token.clone(),
                        })
                    })
                    .await;
                let settled = query.settle(generation, outcome);
                let _ = tx.send(settled);
            });
        }
        self.notify(action);
        result
    }

    /// Record the outcome of fetch `generation`.
    ///
    /// Outcomes of superseded fetches are discarded.
    fn settle(
        &self,
        generation: u64,
        outcome: Result<ErasedData, QueryError>,
    ) -> Result<ErasedData, QueryError> {
        let action;
        let settled;
        {
            let mut core = self.inner.core.lock();
            if core.active.as_ref().map(|active| active.generation) != Some(generation) {
                trace!(key = %self.inner.key, generation, "discarding superseded fetch");
                return Err(QueryError::Cancelled);
            }
            core.active = None;

            let next = match outcome {
                Ok(data) => Action::Success {
                    data,
                    updated_at: Instant::now(),
                    manual: false,
                    data_eq: core
                        .options
                        .resolved
                        .structural_sharing
                        .then_some(core.options.data_eq),
                },
                Err(error) if error.is_cancelled() => {
                    let mut next = core.state.clone();
                    next.fetch_status = FetchStatus::Idle;
                    Action::SetState(Box::new(next))
                }
                Err(error) => Action::Error { error },
            };
            action = next.kind();
            reduce(&mut core.state, next);

            settled = match action {
                ActionKind::Success => core.state.data.clone().ok_or(QueryError::Cancelled),
                ActionKind::Error => Err(core
                    .state
                    .error
                    .clone()
                    .unwrap_or(QueryError::Cancelled)),
                _ => Err(QueryError::Cancelled),
            };

            if self.observer_count() == 0 {
                self.schedule_gc_locked(&mut core);
            }
        }

        match &settled {
            Ok(_) => debug!(key = %self.inner.key, generation, "fetch succeeded"),
            Err(error) => debug!(key = %self.inner.key, generation, %error, "fetch failed"),
        }

        if let Some(cache) = self.inner.cache.upgrade() {
            match &settled {
                Ok(data) => cache.run_success_callbacks(self, data),
                Err(error) if !error.is_cancelled() => cache.run_error_callbacks(self, error),
                Err(_) => {}
            }
        }
        self.notify(action);
        settled
    }

    /// Write data directly, as a successful fetch would.
    ///
    /// Does not change the fetch status. Returns the stored value, which is
    /// the previous `Arc` if structural sharing found the values equal.
    pub(crate) fn set_data(&self, data: ErasedData, updated_at: Option<Instant>) -> ErasedData {
        let stored;
        {
            let mut core = self.inner.core.lock();
            let data_eq = core
                .options
                .resolved
                .structural_sharing
                .then_some(core.options.data_eq);
            reduce(
                &mut core.state,
                Action::Success {
                    data: data.clone(),
                    updated_at: updated_at.unwrap_or_else(Instant::now),
                    manual: true,
                    data_eq,
                },
            );
            stored = core.state.data.clone().unwrap_or(data);
            if self.observer_count() == 0 && core.active.is_none() {
                self.schedule_gc_locked(&mut core);
            }
        }
        self.notify(ActionKind::Success);
        stored
    }

    /// Current data, still erased.
    pub(crate) fn raw_data(&self) -> Option<ErasedData> {
        self.inner.core.lock().state.data.clone()
    }

    pub(crate) fn add_observer(&self, listener: Weak<dyn QueryListener>) -> usize {
        let (id, observers) = {
            let mut observers = self.inner.observers.lock();
            let id = observers.insert(listener);
            (id, observers.len())
        };
        if let Some(gc) = self.inner.core.lock().gc_task.take() {
            gc.abort();
        }
        trace!(key = %self.inner.key, observers, "observer attached");
        if let Some(cache) = self.inner.cache.upgrade() {
            cache.emit(QueryCacheEvent::ObserverAdded {
                query: self.clone(),
                observers,
            });
        }
        id
    }

    pub(crate) fn remove_observer(&self, id: usize) {
        let observers = {
            let mut observers = self.inner.observers.lock();
            if observers.try_remove(id).is_none() {
                return;
            }
            observers.len()
        };
        trace!(key = %self.inner.key, observers, "observer detached");
        if observers == 0 {
            self.schedule_gc();
        }
        if let Some(cache) = self.inner.cache.upgrade() {
            cache.emit(QueryCacheEvent::ObserverRemoved {
                query: self.clone(),
                observers,
            });
        }
    }

    pub(crate) fn on_focus(&self) {
        if self
            .listeners()
            .iter()
            .any(|listener| listener.should_fetch_on_window_focus())
        {
            drop(self.fetch(None, false));
        }
    }

    pub(crate) fn on_online(&self) {
        if self
            .listeners()
            .iter()
            .any(|listener| listener.should_fetch_on_reconnect())
        {
            drop(self.fetch(None, false));
        }
    }

    /// Stop the in-flight fetch and any pending collection before removal.
    pub(crate) fn destroy(&self) {
        let mut core = self.inner.core.lock();
        Self::abort_active(&mut core);
        if let Some(gc) = core.gc_task.take() {
            gc.abort();
        }
    }

    pub(crate) fn schedule_gc(&self) {
        let mut core = self.inner.core.lock();
        self.schedule_gc_locked(&mut core);
    }

    fn schedule_gc_locked(&self, core: &mut QueryCore) {
        if let Some(gc) = core.gc_task.take() {
            gc.abort();
        }
        let gc_time = core.gc_time;
        if gc_time == Duration::MAX {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let task = runtime.spawn(async move {
            tokio::time::sleep(gc_time).await;
            if let Some(inner) = weak.upgrade() {
                Query { inner }.optional_remove();
            }
        });
        core.gc_task = Some(task.abort_handle());
    }

    fn optional_remove(&self) {
        if self.observer_count() > 0 || self.is_fetching() {
            return;
        }
        if let Some(cache) = self.inner.cache.upgrade() {
            debug!(key = %self.inner.key, "collecting unused query");
            cache.remove_query(self);
        }
    }

    fn dispatch_for(&self, generation: u64, action: Action) {
        let kind = action.kind();
        {
            let mut core = self.inner.core.lock();
            if core.active.as_ref().map(|active| active.generation) != Some(generation) {
                return;
            }
            reduce(&mut core.state, action);
        }
        self.notify(kind);
    }

    fn listeners(&self) -> Vec<Arc<dyn QueryListener>> {
        self.inner
            .observers
            .lock()
            .iter()
            .filter_map(|(_, listener)| listener.upgrade())
            .collect()
    }

    /// Notify every attached observer of one transition, then cache subscribers.
    fn notify(&self, action: ActionKind) {
        for listener in self.listeners() {
            listener.on_query_update(self.fingerprint());
        }
        if let Some(cache) = self.inner.cache.upgrade() {
            cache.emit(QueryCacheEvent::Updated {
                query: self.clone(),
                action,
            });
        }
    }
}

struct FetchHooks {
    query: Query,
    generation: u64,
}

impl RetryHooks for FetchHooks {
    fn on_fail(&self, failure_count: u32, error: &QueryError) {
        self.query.dispatch_for(
            self.generation,
            Action::Failed {
                failure_count,
                error: error.clone(),
            },
        );
    }

    fn on_pause(&self) {
        self.query.dispatch_for(self.generation, Action::Pause);
    }

    fn on_continue(&self) {
        self.query.dispatch_for(self.generation, Action::Continue);
    }
}

fn ready(result: Result<ErasedData, QueryError>) -> FetchFuture {
    futures::future::ready(result).boxed().shared()
}

/// Downcast erased data to the type a caller expects.
pub(crate) fn downcast_data<T: Send + Sync + 'static>(
    fingerprint: &str,
    data: ErasedData,
) -> Result<Arc<T>, QueryError> {
    data.downcast::<T>().map_err(|_| {
        warn!(fingerprint, expected = std::any::type_name::<T>(), "cached data has another type");
        QueryError::TypeMismatch {
            fingerprint: fingerprint.to_string(),
            expected: std::any::type_name::<T>(),
        }
    })
}
