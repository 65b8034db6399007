//! Rate Limiter Integration Tests
//!
//! Window admission and reset timing, on paused tokio time.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use newsfan::core::{Admission, LimitSettings, RateLimiter, RateLimiters};
use newsfan::domain::Lane;

/// Acquire `n` times concurrently, returning each admission's offset from start
async fn admit_all(limiter: &RateLimiter, n: usize) -> Vec<Duration> {
    let started = Instant::now();
    let handles: Vec<_> = (0..n)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter.acquire().await;
                started.elapsed()
            })
        })
        .collect();

    let mut offsets = Vec::with_capacity(n);
    for handle in handles {
        offsets.push(handle.await.unwrap());
    }
    offsets.sort();
    offsets
}

#[tokio::test(start_paused = true)]
async fn test_first_window_admits_limit_without_waiting() {
    let limiter = RateLimiter::start("search", 4, Duration::from_secs(1)).unwrap();

    let offsets = admit_all(&limiter, 4).await;

    assert!(offsets.iter().all(|offset| *offset == Duration::ZERO));
    assert_eq!(limiter.admitted_in_window(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_excess_requests_wait_for_resets() {
    let period = Duration::from_secs(1);
    let limiter = RateLimiter::start("llm", 3, period).unwrap();

    // ceil(7 / 3) - 1 = 2 resets are needed before the last admission
    let offsets = admit_all(&limiter, 7).await;

    assert_eq!(offsets.iter().filter(|o| **o < period).count(), 3);
    assert_eq!(
        offsets
            .iter()
            .filter(|o| **o >= period && **o < period * 2)
            .count(),
        3
    );
    let last = *offsets.last().unwrap();
    assert!(last >= period * 2, "last admission at {:?}", last);
    assert!(last < period * 2 + Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn test_resets_stop_when_limiter_dropped() {
    let limiter = RateLimiter::start("search", 1, Duration::from_millis(200)).unwrap();
    assert!(limiter.try_acquire());
    drop(limiter);

    // The background task exits on its next tick instead of running forever
    tokio::time::sleep(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_lanes_are_independent() {
    let settings = LimitSettings {
        search_per_sec: 1,
        llm_per_sec: 1,
        reset_interval_ms: 60_000,
        poll_interval_ms: 100,
    };
    let limiters = Arc::new(RateLimiters::from_settings(&settings).unwrap());
    limiters.start_resets();

    limiters.admit(Lane::Search).await.unwrap();
    // The llm lane still has its full window
    let started = Instant::now();
    limiters.admit(Lane::Llm).await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);

    assert!(!limiters.limiter(Lane::Search).try_acquire());
}

#[tokio::test(start_paused = true)]
async fn test_update_limit_applies_to_waiting_requests() {
    let limiter = RateLimiter::start("llm", 1, Duration::from_secs(60)).unwrap();
    assert!(limiter.try_acquire());

    let waiting = {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!waiting.is_finished());

    limiter.update_limit(2).unwrap();
    tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("admission after raising the limit")
        .unwrap();
    assert_eq!(limiter.admitted_in_window(), 2);
}
