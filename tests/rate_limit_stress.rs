//! Concurrency tests for the rate limiter
//!
//! All tests run on paused tokio time, so waits are exact and instant.

use cloudcache::metrics::NoopMetrics;
use cloudcache::rate_limit::{RateBudget, RateLimiter};
use futures::future::join_all;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn limiter(capacity: u32, window: Duration) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(
        vec![RateBudget::new("ec2", capacity, window)],
        Arc::new(NoopMetrics),
    ))
}

/// Grant instants, relative to `origin`, of `callers` concurrent acquires
async fn grant_offsets(limiter: Arc<RateLimiter>, callers: usize) -> Vec<Duration> {
    let origin = Instant::now();
    let tasks: Vec<_> = (0..callers)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter.acquire("ec2", "1234").await.unwrap();
                origin.elapsed()
            })
        })
        .collect();

    let mut offsets: Vec<Duration> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    offsets.sort();
    offsets
}

/// Largest number of grants inside any window starting at a grant
fn busiest_window(offsets: &[Duration], window: Duration) -> usize {
    offsets
        .iter()
        .map(|start| {
            offsets
                .iter()
                .filter(|t| **t >= *start && **t < *start + window)
                .count()
        })
        .max()
        .unwrap_or(0)
}

mod concurrency_tests {
    use super::*;

    /// Five callers against 2 per second: two go at once, three wait
    #[tokio::test(start_paused = true)]
    async fn test_five_callers_two_per_second() {
        let limiter = limiter(2, Duration::from_secs(1));

        let waits: Vec<Duration> = join_all((0..5).map(|_| {
            let limiter = limiter.clone();
            async move { limiter.acquire("ec2", "1234").await.unwrap().waited }
        }))
        .await;

        let immediate = waits.iter().filter(|w| w.is_zero()).count();
        let delayed = waits.iter().filter(|w| **w >= Duration::from_secs(1)).count();
        assert_eq!(immediate, 2);
        assert_eq!(delayed, 3);
    }

    /// Accounts sharing a service budget never borrow from each other
    #[tokio::test(start_paused = true)]
    async fn test_accounts_are_isolated() {
        let limiter = limiter(1, Duration::from_secs(10));

        let first = limiter.acquire("ec2", "1111").await.unwrap();
        let second = limiter.acquire("ec2", "2222").await.unwrap();
        assert!(first.waited.is_zero());
        assert!(second.waited.is_zero());
    }

    /// Many spawned callers never exceed the budget in any window
    #[tokio::test(start_paused = true)]
    async fn test_spawned_callers_respect_window() {
        let window = Duration::from_millis(250);
        let offsets = grant_offsets(limiter(3, window), 20).await;

        assert_eq!(offsets.len(), 20);
        assert!(busiest_window(&offsets, window) <= 3);
        // 20 grants at 3 per window need at least six further windows
        assert!(*offsets.last().unwrap() >= window * 6);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// For any budget and any number of callers, no window holds more than N grants
    #[test]
    fn prop_no_window_exceeds_capacity(
        capacity in 1u32..5,
        window_ms in 10u64..500,
        callers in 10usize..40,
    ) {
        let window = Duration::from_millis(window_ms);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        let offsets = runtime.block_on(grant_offsets(limiter(capacity, window), callers));

        prop_assert_eq!(offsets.len(), callers);
        prop_assert!(busiest_window(&offsets, window) <= capacity as usize);
    }
}
