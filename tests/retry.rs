//! Retry Integration Tests
//!
//! Attempt counts and backoff timing, on paused tokio time.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use common::{generous_limits, open_cache, ScriptedFetcher, ScriptedModel, ScriptedSearch};
use newsfan::core::progress::ProgressSink;
use newsfan::core::{CallContext, RateLimiters, RetryPolicy};
use newsfan::domain::{CallError, RemoteCall, RemoteResponse};

#[tokio::test(start_paused = true)]
async fn test_always_transient_is_called_max_attempts_times() {
    let policy = RetryPolicy::default();
    let attempts = AtomicU32::new(0);
    let counter = &attempts;
    let started = Instant::now();

    let result = policy
        .run("search:always-500", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, CallError>(RemoteResponse::<Vec<String>>::status(500))
        })
        .await;

    assert_eq!(attempts.load(Ordering::SeqCst), policy.max_attempts);
    assert_eq!(
        result.unwrap_err(),
        CallError::RetriesExhausted {
            attempts: 10,
            status: 500
        }
    );
    // 3s doubling nine times: 3 * (2^9 - 1) seconds of backoff
    assert!(started.elapsed() >= policy.worst_case_delay());
    assert!(started.elapsed() < policy.worst_case_delay() + Duration::from_secs(1));
    assert_eq!(policy.worst_case_delay(), Duration::from_secs(1533));
}

#[tokio::test(start_paused = true)]
async fn test_recovers_after_transient_statuses() {
    let policy = RetryPolicy::default();
    let attempts = AtomicU32::new(0);
    let counter = &attempts;
    let started = Instant::now();

    let response = policy
        .run("llm:flaky", move || async move {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok::<_, CallError>(match attempt {
                1 => RemoteResponse::status(429),
                2 => RemoteResponse::status(503),
                _ => RemoteResponse::ok("done".to_string()),
            })
        })
        .await
        .unwrap();

    assert_eq!(response.into_result().unwrap(), "done");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    // 3s after the first failure, 6s after the second
    assert!(started.elapsed() >= Duration::from_secs(9));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_non_transient_status_is_not_retried() {
    let policy = RetryPolicy::default();
    let attempts = AtomicU32::new(0);
    let counter = &attempts;

    let response = policy
        .run("search:missing", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, CallError>(RemoteResponse::<String>::status(404))
        })
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(response.into_result(), Err(CallError::Status { code: 404 }));
}

#[tokio::test(start_paused = true)]
async fn test_each_attempt_is_admitted_and_failures_are_not_cached() {
    let dir = tempfile::TempDir::new().unwrap();
    let cache = open_cache(&dir);
    let search = Arc::new(ScriptedSearch::failing(503));
    let limiters = Arc::new(RateLimiters::from_settings(&generous_limits()).unwrap());
    let policy = RetryPolicy {
        max_attempts: 4,
        ..RetryPolicy::default()
    };

    let ctx = CallContext::new(
        common::providers(
            search.clone(),
            Arc::new(ScriptedFetcher::new(&[])),
            Arc::new(ScriptedModel::new(vec![])),
        ),
        cache.clone(),
        policy,
        limiters.clone(),
        ProgressSink::disconnected(),
    );
    let call = RemoteCall::Search {
        term: "rates".to_string(),
    };

    let err = ctx.execute(&call).await.unwrap_err();
    assert!(matches!(err, CallError::RetriesExhausted { attempts: 4, .. }));
    assert_eq!(search.calls(), 4);
    assert_eq!(
        limiters
            .limiter(newsfan::domain::Lane::Search)
            .admitted_in_window(),
        4
    );
    assert_eq!(cache.get(&call.cache_key()).unwrap(), None);
}
