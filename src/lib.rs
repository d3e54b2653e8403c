//! Query-Cache: an asynchronous data cache for client applications.
//!
//! Give it a structured key and an async fetch function; it returns cached
//! results, deduplicates concurrent fetches of the same key, tracks staleness,
//! retries failures and evicts entries nobody watches anymore.
//!
//! # Key Features
//!
//! - **Structured keys**: [`QueryKey`]s are JSON sequences with canonical
//!   fingerprints, so object member order never splits a cache slot
//! - **Deduplication**: at most one fetch per key is in flight; every caller
//!   awaits the same outcome
//! - **Staleness and retention**: `stale_time` decides when data is
//!   revalidated, `gc_time` when unobserved queries are evicted
//! - **Observers**: [`QueryObserver`]s derive a per-consumer view with
//!   `select`, placeholder data and a [`Thenable`] to suspend on
//! - **Retries**: configurable [`RetryPolicy`] and [`RetryDelay`], paused
//!   while offline and cancelled promptly
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use query_cache::{query_key, QueryClient, QueryObserverOptions, QueryOptions};
//!
//! let client = QueryClient::new();
//! let options = QueryOptions::new(query_key!["todo", 1], |ctx| async move {
//!     Ok(format!("todo for {}", ctx.query_key))
//! });
//!
//! let observer = client.watch_query(QueryObserverOptions::new(options));
//! let subscription = observer.subscribe(|result| {
//!     if let Some(todo) = &result.data {
//!         println!("{todo}");
//!     }
//! });
//!
//! let todo = observer.get_current_result().promise.wait().await.unwrap();
//! assert_eq!(todo.as_str(), r#"todo for ["todo",1]"#);
//! drop(subscription);
//! # }
//! ```

mod cache;
mod client;
mod error;
mod filter;
mod key;
mod manager;
mod observer;
mod options;
mod query;
pub mod retryer;
mod state;
mod thenable;

pub use cache::{QueryCache, QueryCacheConfig, QueryCacheEvent, DEFAULT_EVENT_CAPACITY};
pub use client::{QueryClient, QueryClientBuilder, RefetchOptions};
pub use error::QueryError;
pub use filter::{QueryFilters, QueryTypeFilter};
pub use key::{fingerprint_parts, partial_match, KeyError, QueryKey};
pub use manager::{FocusManager, OnlineManager};
pub use observer::{QueryObserver, QueryObserverResult, Subscription};
pub use options::{
    InitialData, PlaceholderData, QueryData, QueryDefaults, QueryFn, QueryFnContext,
    QueryObserverOptions, QueryOptions, RefetchOn, DEFAULT_GC_TIME,
};
pub use query::{CancelOptions, Query};
pub use retryer::{NetworkMode, RetryDelay, RetryPolicy};
pub use state::{ActionKind, ErasedData, FetchStatus, QueryState, QueryStatus};
pub use thenable::{Thenable, ThenableState, ThenableStatus};

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}
