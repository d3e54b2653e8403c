//! Tests for QueryClient bulk operations, direct cache writes and events.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use query_cache::{
    query_key, ActionKind, QueryCacheEvent, QueryClient, QueryDefaults, QueryError, QueryFilters,
    QueryKey, QueryObserverOptions, QueryOptions, QueryStatus, RefetchOptions, RetryPolicy,
};

fn counted(key: QueryKey, calls: Arc<AtomicU32>, delay: Duration) -> QueryOptions<u32> {
    QueryOptions::new(key, move |_ctx| {
        let calls = calls.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(delay).await;
            Ok(n)
        }
    })
    .retry(RetryPolicy::Never)
}

// =============================================================================
// Invalidation and refetching
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_invalidate_refetches_only_active_queries() {
    let client = QueryClient::new();
    let active_calls = Arc::new(AtomicU32::new(0));
    let idle_calls = Arc::new(AtomicU32::new(0));

    let observer = client.watch_query(QueryObserverOptions::new(
        counted(query_key!["todos", 1], active_calls.clone(), Duration::ZERO)
            .stale_time(Duration::MAX),
    ));
    let _sub = observer.subscribe(|_| {});
    client
        .fetch_query(
            counted(query_key!["todos", 2], idle_calls.clone(), Duration::ZERO)
                .stale_time(Duration::MAX),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(active_calls.load(Ordering::SeqCst), 1);

    client
        .invalidate_queries(QueryFilters::key(query_key!["todos"]))
        .await
        .unwrap();

    assert_eq!(active_calls.load(Ordering::SeqCst), 2);
    assert_eq!(idle_calls.load(Ordering::SeqCst), 1);
    assert!(!client.get_query_state(&query_key!["todos", 1]).unwrap().is_invalidated);
    assert!(client.get_query_state(&query_key!["todos", 2]).unwrap().is_invalidated);
    assert_eq!(observer.get_current_result().data.as_deref(), Some(&2));
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_respects_prefix() {
    let client = QueryClient::new();
    client.set_query_data(query_key!["todos", {"page": 1}], 1u32);
    client.set_query_data(query_key!["users"], 2u32);

    client
        .invalidate_queries(QueryFilters::key(query_key!["todos"]))
        .await
        .unwrap();

    assert!(client.get_query_state(&query_key!["todos", {"page": 1}]).unwrap().is_invalidated);
    assert!(!client.get_query_state(&query_key!["users"]).unwrap().is_invalidated);
}

#[tokio::test(start_paused = true)]
async fn test_refetch_queries_reports_errors_on_request() {
    let client = QueryClient::new();
    client
        .prefetch_query(QueryOptions::new(query_key!["broken"], |_ctx| async {
            Err::<u32, QueryError>(anyhow::anyhow!("still broken").into())
        }))
        .await;
    assert_eq!(
        client.get_query_state(&query_key!["broken"]).unwrap().status,
        QueryStatus::Error
    );

    client
        .refetch_queries(QueryFilters::all(), RefetchOptions::default())
        .await
        .unwrap();
    let err = client
        .refetch_queries(
            QueryFilters::all(),
            RefetchOptions {
                throw_on_error: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("still broken"));
}

#[tokio::test(start_paused = true)]
async fn test_is_fetching_counts_running_fetches() {
    let client = QueryClient::new();
    for n in 0..3u32 {
        let options = counted(query_key!["slow", n], Arc::default(), Duration::from_secs(1));
        let client = client.clone();
        tokio::spawn(async move { client.prefetch_query(options).await });
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(client.is_fetching(&QueryFilters::all()), 3);
    assert_eq!(client.is_fetching(&QueryFilters::exact(query_key!["slow", 1])), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(client.is_fetching(&QueryFilters::all()), 0);
}

// =============================================================================
// Direct reads and writes
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_set_query_data_notifies_observers() {
    let client = QueryClient::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    client.set_query_data(query_key!["count"], 1u32);

    let observer = client.watch_query(
        QueryObserverOptions::new(QueryOptions::<u32>::without_fn(query_key!["count"]))
            .stale_time(Duration::MAX),
    );
    let _sub = observer.subscribe({
        let seen = seen.clone();
        move |result| {
            if let Some(data) = result.data.as_deref() {
                seen.lock().push(*data);
            }
        }
    });

    client.update_query_data(query_key!["count"], |n: Option<&u32>| n.map(|n| n + 1));
    client.set_query_data(query_key!["count"], 10u32);

    assert_eq!(*seen.lock(), vec![2, 10]);
    let state = client.get_query_state(&query_key!["count"]).unwrap();
    assert_eq!(state.data_update_count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_ensure_query_data_uses_cache() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    client.set_query_data(query_key!["have"], 5u32);

    let cached = client
        .ensure_query_data(counted(query_key!["have"], calls.clone(), Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(*cached, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let fetched = client
        .ensure_query_data(counted(query_key!["missing"], calls.clone(), Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(*fetched, 1);
}

#[tokio::test(start_paused = true)]
async fn test_get_query_data_checks_type() {
    let client = QueryClient::new();
    client.set_query_data(query_key!["n"], 1u32);

    assert_eq!(
        client.get_query_data::<u32>(&query_key!["n"]).unwrap().as_deref(),
        Some(&1)
    );
    assert!(matches!(
        client.get_query_data::<String>(&query_key!["n"]),
        Err(QueryError::TypeMismatch { .. })
    ));
    assert!(client.get_query_data::<u32>(&query_key!["absent"]).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_fetch_without_query_fn_fails() {
    let client = QueryClient::new();
    let err = client
        .fetch_query(QueryOptions::<u32>::without_fn(query_key!["nofn"]))
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::MissingQueryFn { .. }));

    let state = client.get_query_state(&query_key!["nofn"]).unwrap();
    assert_eq!(state.status, QueryStatus::Pending);
    assert_eq!(state.error_update_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_initial_data_and_reset() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = counted(query_key!["seeded"], calls.clone(), Duration::ZERO)
        .initial_data(5)
        .stale_time(Duration::MAX);

    assert_eq!(*client.fetch_query(options).await.unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    client.set_query_data(query_key!["seeded"], 9u32);
    client
        .reset_queries(QueryFilters::key(query_key!["seeded"]))
        .await
        .unwrap();
    assert_eq!(
        client.get_query_data::<u32>(&query_key!["seeded"]).unwrap().as_deref(),
        Some(&5)
    );
}

#[tokio::test(start_paused = true)]
async fn test_prefix_defaults_apply_to_fetches() {
    let client = QueryClient::new();
    client.set_query_defaults(
        query_key!["config"],
        QueryDefaults {
            stale_time: Some(Duration::MAX),
            ..Default::default()
        },
    );
    let calls = Arc::new(AtomicU32::new(0));
    let options = counted(query_key!["config", "theme"], calls.clone(), Duration::ZERO);

    client.fetch_query(options.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    client.fetch_query(options).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Removal
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_remove_queries_skips_observed() {
    let client = QueryClient::new();
    client.set_query_data(query_key!["free"], 1u32);
    let observer = client.watch_query(
        QueryObserverOptions::new(QueryOptions::<u32>::without_fn(query_key!["held"]))
            .enabled(false),
    );
    let _sub = observer.subscribe(|_| {});

    assert_eq!(client.remove_queries(&QueryFilters::all()), 1);
    assert_eq!(client.get_query_cache().len(), 1);
    assert!(client.get_query_state(&query_key!["held"]).is_some());

    client.set_query_data(query_key!["free"], 1u32);
    client.clear();
    assert_eq!(client.get_query_cache().len(), 1);
}

// =============================================================================
// Events
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_cache_events_follow_fetch_lifecycle() {
    let client = QueryClient::new();
    let mut events = client.get_query_cache().subscribe();

    client
        .fetch_query(counted(query_key!["evt"], Arc::default(), Duration::ZERO))
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.query().key(), &query_key!["evt"]);
        kinds.push(match event {
            QueryCacheEvent::Added { .. } => "added",
            QueryCacheEvent::Updated {
                action: ActionKind::Fetch,
                ..
            } => "fetch",
            QueryCacheEvent::Updated {
                action: ActionKind::Success,
                ..
            } => "success",
            _ => "other",
        });
    }
    assert_eq!(kinds, vec!["added", "fetch", "success"]);
}
