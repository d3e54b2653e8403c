//! Query state snapshots and the transitions applied to them.

use std::any::Any;
use std::sync::Arc;

use tokio::time::Instant;

use crate::error::QueryError;

/// Type-erased cached value.
pub type ErasedData = Arc<dyn Any + Send + Sync>;

/// Function comparing two erased values for structural sharing.
pub(crate) type DataEq = fn(&ErasedData, &ErasedData) -> bool;

/// Whether any usable data or error exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// No data yet and no settled failure.
    Pending,
    /// The latest settlement produced data.
    Success,
    /// The latest fetch failed after exhausting retries.
    Error,
}

/// Whether a network operation is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchStatus {
    /// No fetch in flight.
    Idle,
    /// A fetch attempt or backoff is in progress.
    Fetching,
    /// A fetch is waiting for connectivity.
    Paused,
}

/// Snapshot of one query entity.
///
/// Both `data` and `error` are kept independently: a failed refetch leaves the
/// last good data in place.
#[derive(Clone)]
pub struct QueryState {
    pub(crate) data: Option<ErasedData>,
    /// When data was last written.
    pub data_updated_at: Option<Instant>,
    /// Number of data writes.
    pub data_update_count: u32,
    /// Last settled fetch error, cleared by the next success.
    pub error: Option<QueryError>,
    /// When the error was recorded.
    pub error_updated_at: Option<Instant>,
    /// Number of settled errors.
    pub error_update_count: u32,
    /// Failed attempts in the current fetch.
    pub fetch_failure_count: u32,
    /// Error of the latest failed attempt.
    pub fetch_failure_reason: Option<QueryError>,
    /// Data was explicitly marked stale.
    pub is_invalidated: bool,
    /// Data/error availability.
    pub status: QueryStatus,
    /// Network activity.
    pub fetch_status: FetchStatus,
    /// Bumped on every transition.
    pub epoch: u64,
    /// Bumped only when the data value changes identity.
    pub data_version: u64,
}

impl QueryState {
    /// A state with no data.
    pub fn empty() -> Self {
        Self {
            data: None,
            data_updated_at: None,
            data_update_count: 0,
            error: None,
            error_updated_at: None,
            error_update_count: 0,
            fetch_failure_count: 0,
            fetch_failure_reason: None,
            is_invalidated: false,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            epoch: 0,
            data_version: 0,
        }
    }

    /// A state seeded with initial data.
    pub(crate) fn with_initial_data(data: ErasedData, updated_at: Instant) -> Self {
        Self {
            data: Some(data),
            data_updated_at: Some(updated_at),
            status: QueryStatus::Success,
            data_version: 1,
            ..Self::empty()
        }
    }

    /// Typed access to the cached data.
    ///
    /// Returns `None` if there is no data or it is not a `T`.
    pub fn data<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.data.clone().and_then(|data| data.downcast::<T>().ok())
    }

    /// Returns `true` if data is present.
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// The erased data value.
    pub fn erased_data(&self) -> Option<&ErasedData> {
        self.data.as_ref()
    }

    /// Returns `true` if the data is older than `stale_time`, missing or invalidated.
    ///
    /// `Duration::MAX` never goes stale by time.
    pub fn is_stale_by_time(&self, stale_time: std::time::Duration) -> bool {
        if self.is_invalidated {
            return true;
        }
        let Some(updated_at) = self.data_updated_at else {
            return true;
        };
        match updated_at.checked_add(stale_time) {
            Some(fresh_until) => Instant::now() >= fresh_until,
            None => false,
        }
    }
}

impl std::fmt::Debug for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryState")
            .field("has_data", &self.data.is_some())
            .field("data_updated_at", &self.data_updated_at)
            .field("error", &self.error)
            .field("status", &self.status)
            .field("fetch_status", &self.fetch_status)
            .field("fetch_failure_count", &self.fetch_failure_count)
            .field("is_invalidated", &self.is_invalidated)
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Transition kinds, reported in cache events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// A fetch started.
    Fetch,
    /// An attempt failed and will be retried.
    Failed,
    /// The fetch is waiting for connectivity.
    Pause,
    /// The fetch resumed.
    Continue,
    /// Data was written.
    Success,
    /// The fetch failed for good.
    Error,
    /// Data was marked stale.
    Invalidate,
    /// State was replaced wholesale (cancel, reset).
    SetState,
}

pub(crate) enum Action {
    Fetch { paused: bool },
    Failed { failure_count: u32, error: QueryError },
    Pause,
    Continue,
    Success {
        data: ErasedData,
        updated_at: Instant,
        manual: bool,
        data_eq: Option<DataEq>,
    },
    Error { error: QueryError },
    Invalidate,
    SetState(Box<QueryState>),
}

impl Action {
    pub(crate) fn kind(&self) -> ActionKind {
        match self {
            Action::Fetch { .. } => ActionKind::Fetch,
            Action::Failed { .. } => ActionKind::Failed,
            Action::Pause => ActionKind::Pause,
            Action::Continue => ActionKind::Continue,
            Action::Success { .. } => ActionKind::Success,
            Action::Error { .. } => ActionKind::Error,
            Action::Invalidate => ActionKind::Invalidate,
            Action::SetState(_) => ActionKind::SetState,
        }
    }
}

/// Apply `action` to `state`.
pub(crate) fn reduce(state: &mut QueryState, action: Action) {
    match action {
        Action::Fetch { paused } => {
            state.fetch_failure_count = 0;
            state.fetch_failure_reason = None;
            state.fetch_status = if paused {
                FetchStatus::Paused
            } else {
                FetchStatus::Fetching
            };
            if state.data_updated_at.is_none() {
                state.error = None;
                state.status = QueryStatus::Pending;
            }
        }
        Action::Failed {
            failure_count,
            error,
        } => {
            state.fetch_failure_count = failure_count;
            state.fetch_failure_reason = Some(error);
        }
        Action::Pause => state.fetch_status = FetchStatus::Paused,
        Action::Continue => state.fetch_status = FetchStatus::Fetching,
        Action::Success {
            data,
            updated_at,
            manual,
            data_eq,
        } => {
            let shared = match (&state.data, data_eq) {
                (Some(old), Some(eq)) if eq(old, &data) => Some(old.clone()),
                _ => None,
            };
            match shared {
                Some(old) => state.data = Some(old),
                None => {
                    state.data = Some(data);
                    state.data_version += 1;
                }
            }
            state.data_updated_at = Some(updated_at);
            state.data_update_count += 1;
            state.error = None;
            state.is_invalidated = false;
            state.status = QueryStatus::Success;
            if !manual {
                state.fetch_status = FetchStatus::Idle;
                state.fetch_failure_count = 0;
                state.fetch_failure_reason = None;
            }
        }
        Action::Error { error } => {
            state.error = Some(error.clone());
            state.error_updated_at = Some(Instant::now());
            state.error_update_count += 1;
            state.fetch_failure_count += 1;
            state.fetch_failure_reason = Some(error);
            state.fetch_status = FetchStatus::Idle;
            state.status = QueryStatus::Error;
        }
        Action::Invalidate => state.is_invalidated = true,
        Action::SetState(next) => {
            let epoch = state.epoch;
            let data_version = state.data_version;
            let data_changed = match (&state.data, &next.data) {
                (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
                (None, None) => false,
                _ => true,
            };
            *state = *next;
            state.epoch = epoch;
            state.data_version = if data_changed {
                data_version + 1
            } else {
                data_version
            };
        }
    }
    state.epoch += 1;
}

/// Structural equality for erased values of type `T`.
pub(crate) fn erased_eq<T: PartialEq + 'static>(a: &ErasedData, b: &ErasedData) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
