//! Tests for fetching through the client: deduplication, staleness, retries,
//! cancellation and garbage collection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use query_cache::{
    query_key, CancelOptions, FetchStatus, OnlineManager, QueryCacheConfig, QueryClient,
    QueryError, QueryFilters, QueryKey, QueryOptions, QueryStatus, RetryDelay, RetryPolicy,
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
// Deduplication
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_fetch_query_calls_share_one_fetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = counted(query_key!["todos"], calls.clone(), Duration::from_millis(50));

    let (a, b, c) = futures::join!(
        client.fetch_query(options.clone()),
        client.fetch_query(options.clone()),
        client.fetch_query(options),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&b, &c));
}

#[tokio::test(start_paused = true)]
async fn test_equivalent_keys_share_one_entry() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));

    let first = counted(
        query_key!["search", {"q": "rust", "page": 1}],
        calls.clone(),
        Duration::from_millis(10),
    )
    .stale_time(Duration::MAX);
    let second = first
        .clone()
        .with_key(query_key!["search", {"page": 1, "q": "rust"}]);

    client.fetch_query(first).await.unwrap();
    client.fetch_query(second).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.get_query_cache().len(), 1);
}

// =============================================================================
// Staleness
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_fresh_data_is_served_without_fetching() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = counted(query_key!["fresh"], calls.clone(), Duration::ZERO)
        .stale_time(Duration::from_secs(10))
        .gc_time(Duration::MAX);

    assert_eq!(*client.fetch_query(options.clone()).await.unwrap(), 1);
    assert_eq!(*client.fetch_query(options.clone()).await.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(*client.fetch_query(options).await.unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalidated_data_is_refetched() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = counted(query_key!["inv"], calls.clone(), Duration::ZERO).stale_time(Duration::MAX);

    client.fetch_query(options.clone()).await.unwrap();
    client
        .invalidate_queries(QueryFilters::key(query_key!["inv"]))
        .await
        .unwrap();
    assert!(client.get_query_state(&query_key!["inv"]).unwrap().is_invalidated);

    assert_eq!(*client.fetch_query(options).await.unwrap(), 2);
    assert!(!client.get_query_state(&query_key!["inv"]).unwrap().is_invalidated);
}

// =============================================================================
// Retries and errors
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_retries_until_policy_gives_up() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::new(query_key!["flaky"], {
        let calls = calls.clone();
        move |_ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<u32, QueryError>(anyhow::anyhow!("service unavailable").into())
            }
        }
    })
    .retry(RetryPolicy::Count(2))
    .retry_delay(RetryDelay::Fixed(Duration::from_millis(100)));

    let err = client.fetch_query(options).await.unwrap_err();
    assert!(err.to_string().contains("service unavailable"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let state = client.get_query_state(&query_key!["flaky"]).unwrap();
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.fetch_status, FetchStatus::Idle);
    assert_eq!(state.fetch_failure_count, 3);
    assert_eq!(state.error_update_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_imperative_fetch_does_not_retry_by_default() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let options = QueryOptions::new(query_key!["once"], {
        let calls = calls.clone();
        move |_ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<u32, QueryError>(anyhow::anyhow!("nope").into())
            }
        }
    });

    assert!(client.fetch_query(options).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_success_clears_error_but_error_keeps_data() {
    let client = QueryClient::new();
    let fail = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let options = QueryOptions::new(query_key!["toggle"], {
        let fail = fail.clone();
        move |_ctx| {
            let fail = fail.load(Ordering::SeqCst);
            async move {
                if fail {
                    Err(QueryError::from(anyhow::anyhow!("down")))
                } else {
                    Ok(7u32)
                }
            }
        }
    })
    .retry(RetryPolicy::Never);

    client.fetch_query(options.clone()).await.unwrap();
    fail.store(true, Ordering::SeqCst);
    assert!(client.fetch_query(options.clone()).await.is_err());

    let state = client.get_query_state(&query_key!["toggle"]).unwrap();
    assert_eq!(state.status, QueryStatus::Error);
    assert!(state.error.is_some());
    assert_eq!(state.data::<u32>().as_deref(), Some(&7));

    fail.store(false, Ordering::SeqCst);
    client.fetch_query(options).await.unwrap();
    let state = client.get_query_state(&query_key!["toggle"]).unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert!(state.error.is_none());
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancel_restores_prior_data() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let key = query_key!["cancel"];
    client.set_query_data(key.clone(), 100u32);

    let fetch = tokio::spawn({
        let client = client.clone();
        let options = counted(key.clone(), calls.clone(), Duration::from_secs(5));
        async move { client.fetch_query(options).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.is_fetching(&QueryFilters::all()), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let cancelled = client.cancel_queries(&QueryFilters::key(key.clone()), CancelOptions::default());
    assert_eq!(cancelled, 1);
    assert!(matches!(fetch.await.unwrap(), Err(QueryError::Cancelled)));

    let state = client.get_query_state(&key).unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.fetch_status, FetchStatus::Idle);
    assert_eq!(state.data::<u32>().as_deref(), Some(&100));
    assert_eq!(client.is_fetching(&QueryFilters::all()), 0);

    // The entry stays usable after a cancel.
    client.set_query_data(key.clone(), 101u32);
    let refetched = client
        .fetch_query(counted(key.clone(), calls.clone(), Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(*refetched, 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_without_fetch_is_noop() {
    let client = QueryClient::new();
    client.set_query_data(query_key!["idle"], 1u32);
    assert_eq!(
        client.cancel_queries(&QueryFilters::all(), CancelOptions::default()),
        0
    );
}

// =============================================================================
// Connectivity
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_fetch_pauses_while_offline() {
    let online = OnlineManager::new(false);
    let client = QueryClient::builder().online_manager(online.clone()).build();
    let calls = Arc::new(AtomicU32::new(0));
    let options = counted(query_key!["offline"], calls.clone(), Duration::ZERO);

    let fetch = tokio::spawn({
        let client = client.clone();
        async move { client.fetch_query(options).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;

    let state = client.get_query_state(&query_key!["offline"]).unwrap();
    assert_eq!(state.fetch_status, FetchStatus::Paused);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(client.is_fetching(&QueryFilters::all()), 0);

    client.set_online(true);
    assert_eq!(*fetch.await.unwrap().unwrap(), 1);
    let state = client.get_query_state(&query_key!["offline"]).unwrap();
    assert_eq!(state.fetch_status, FetchStatus::Idle);
}

// =============================================================================
// Garbage collection and callbacks
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_unobserved_entry_is_collected_after_gc_time() {
    let client = QueryClient::new();
    let options = counted(query_key!["gc"], Arc::default(), Duration::ZERO).gc_time(Duration::from_secs(2));

    client.fetch_query(options).await.unwrap();
    assert!(client.get_query_data::<u32>(&query_key!["gc"]).unwrap().is_some());

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(client.get_query_cache().is_empty());
    assert!(client.get_query_data::<u32>(&query_key!["gc"]).unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cache_callbacks() {
    let successes = Arc::new(AtomicU32::new(0));
    let errors = Arc::new(AtomicU32::new(0));
    let settled = Arc::new(AtomicU32::new(0));
    let config = QueryCacheConfig::default()
        .on_success({
            let successes = successes.clone();
            move |_query, _data| {
                successes.fetch_add(1, Ordering::SeqCst);
            }
        })
        .on_error({
            let errors = errors.clone();
            move |_query, _error| {
                errors.fetch_add(1, Ordering::SeqCst);
            }
        })
        .on_settled({
            let settled = settled.clone();
            move |_query, _data, _error| {
                settled.fetch_add(1, Ordering::SeqCst);
            }
        });
    let client = QueryClient::builder().cache_config(config).build();

    client
        .fetch_query(counted(query_key!["ok"], Arc::default(), Duration::ZERO))
        .await
        .unwrap();
    let failing = QueryOptions::new(query_key!["bad"], |_ctx| async {
        Err::<u32, QueryError>(anyhow::anyhow!("bad").into())
    });
    client.prefetch_query(failing).await;

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(settled.load(Ordering::SeqCst), 2);
}
