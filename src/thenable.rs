//! Suspension handles handed to rendering layers.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::QueryError;

/// Settlement of a [`Thenable`].
pub enum ThenableState<D> {
    /// Not settled yet.
    Pending,
    /// Settled with data.
    Fulfilled(Arc<D>),
    /// Settled with an error.
    Rejected(QueryError),
}

impl<D> Clone for ThenableState<D> {
    fn clone(&self) -> Self {
        match self {
            ThenableState::Pending => ThenableState::Pending,
            ThenableState::Fulfilled(data) => ThenableState::Fulfilled(data.clone()),
            ThenableState::Rejected(error) => ThenableState::Rejected(error.clone()),
        }
    }
}

impl<D> fmt::Debug for ThenableState<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThenableState::Pending => write!(f, "Pending"),
            ThenableState::Fulfilled(_) => write!(f, "Fulfilled(..)"),
            ThenableState::Rejected(e) => write!(f, "Rejected({})", e),
        }
    }
}

/// Short form of [`ThenableState`] without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThenableStatus {
    /// Not settled yet.
    Pending,
    /// Settled with data.
    Fulfilled,
    /// Settled with an error.
    Rejected,
}

struct Inner<D> {
    state: Mutex<ThenableState<D>>,
    settled: Notify,
}

/// A promise-like handle that settles at most once.
///
/// Clones share the same settlement. An observer hands out the same instance
/// until its result changes, so consumers can compare handles with
/// [`ptr_eq`](Thenable::ptr_eq) to avoid suspending twice.
pub struct Thenable<D> {
    inner: Arc<Inner<D>>,
}

impl<D> Clone for Thenable<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D> fmt::Debug for Thenable<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Thenable")
            .field(&*self.inner.state.lock())
            .finish()
    }
}

impl<D> Thenable<D> {
    /// A thenable that has not settled.
    pub fn pending() -> Self {
        Self::with_state(ThenableState::Pending)
    }

    /// A thenable already fulfilled with `data`.
    pub fn fulfilled(data: Arc<D>) -> Self {
        Self::with_state(ThenableState::Fulfilled(data))
    }

    /// A thenable already rejected with `error`.
    pub fn rejected(error: QueryError) -> Self {
        Self::with_state(ThenableState::Rejected(error))
    }

    fn with_state(state: ThenableState<D>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                settled: Notify::new(),
            }),
        }
    }

    /// Fulfil a pending thenable. Returns `false` if it had already settled.
    pub fn resolve(&self, data: Arc<D>) -> bool {
        self.settle(ThenableState::Fulfilled(data))
    }

    /// Reject a pending thenable. Returns `false` if it had already settled.
    pub fn reject(&self, error: QueryError) -> bool {
        self.settle(ThenableState::Rejected(error))
    }

    fn settle(&self, next: ThenableState<D>) -> bool {
        {
            let mut state = self.inner.state.lock();
            if !matches!(*state, ThenableState::Pending) {
                return false;
            }
            *state = next;
        }
        self.inner.settled.notify_waiters();
        true
    }

    /// Current settlement.
    pub fn status(&self) -> ThenableStatus {
        match &*self.inner.state.lock() {
            ThenableState::Pending => ThenableStatus::Pending,
            ThenableState::Fulfilled(_) => ThenableStatus::Fulfilled,
            ThenableState::Rejected(_) => ThenableStatus::Rejected,
        }
    }

    /// Snapshot of the settlement, payload included.
    pub fn peek(&self) -> ThenableState<D> {
        self.inner.state.lock().clone()
    }

    /// Returns `true` if both handles are the same thenable.
    pub fn ptr_eq(&self, other: &Thenable<D>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wait for settlement.
    ///
    /// A thenable that never settles never completes; callers wanting to give
    /// up should race it against a timeout.
    pub async fn wait(&self) -> Result<Arc<D>, QueryError> {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            // Register before checking so a settlement in between is not missed.
            notified.as_mut().enable();
            match self.peek() {
                ThenableState::Fulfilled(data) => return Ok(data),
                ThenableState::Rejected(error) => return Err(error),
                ThenableState::Pending => notified.await,
            }
        }
    }
}
