//! Integration tests for request coordination
//!
//! Tests cover:
//! - Debounced bursts collapsing into one deduplicated fetch
//! - Identifier reuse with a different result type
//! - clear_all rejecting pending debounce and batch-window callers

use chain_read_sdk::cache_key::RequestParams;
use chain_read_sdk::errors::ReadError;
use chain_read_sdk::request_coordinator::RequestCoordinator;
use chain_read_sdk::scheduler::TaskScheduler;
use chain_read_sdk::settings::Requests;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn coordinator() -> (RequestCoordinator, Arc<TaskScheduler>) {
    let scheduler = Arc::new(TaskScheduler::new());
    let coordinator = RequestCoordinator::new(Arc::clone(&scheduler), Requests::default());
    (coordinator, scheduler)
}

fn balance_params(user: &str) -> RequestParams {
    RequestParams::new().with("chainId", 8453).with("userAddress", user)
}

#[tokio::test(start_paused = true)]
async fn test_debounced_burst_runs_one_fetch() {
    let (coordinator, scheduler) = coordinator();
    let fetches = Arc::new(AtomicUsize::new(0));
    let wait = coordinator.default_debounce();

    let mut handles = Vec::new();
    for n in 0..5u64 {
        let c = coordinator.clone();
        let fetches = fetches.clone();
        handles.push(tokio::spawn(async move {
            c.debounce_and_dedupe(
                "balances",
                &balance_params("0xBEEF"),
                move || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, ReadError>(n)
                },
                wait,
            )
            .await
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), Ok(4));
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.pending_count(), 0);

    let stats = coordinator.stats();
    assert_eq!(stats.debounced, 0);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reusing_identifier_with_other_type_is_rejected() {
    let (coordinator, _scheduler) = coordinator();
    let params = balance_params("0xbeef");

    let (first, second) = tokio::join!(
        coordinator.deduplicate("balances", &params, || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<u64, ReadError>(1)
        }),
        async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            coordinator
                .deduplicate("balances", &params, || async { Ok::<String, ReadError>("1".to_string()) })
                .await
        },
    );

    assert_eq!(first, Ok(1));
    assert!(matches!(second, Err(ReadError::InvalidInput(_))));
}

#[tokio::test(start_paused = true)]
async fn test_clear_all_rejects_pending_callers() {
    let (coordinator, scheduler) = coordinator();

    let debounced = {
        let c = coordinator.clone();
        tokio::spawn(async move {
            c.debounce(
                "search",
                &balance_params("0x1"),
                || async { Ok::<_, ReadError>(1u8) },
                Duration::from_secs(1),
            )
            .await
        })
    };
    let windowed = {
        let c = coordinator.clone();
        tokio::spawn(async move {
            c.batch_window(
                "prices",
                7u64,
                |items: Vec<u64>| async move { Ok::<_, ReadError>(items) },
                Duration::from_secs(1),
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(scheduler.pending_count(), 2);

    coordinator.clear_all();

    assert!(matches!(debounced.await.unwrap(), Err(ReadError::Cancelled(_))));
    assert!(matches!(windowed.await.unwrap(), Err(ReadError::Cancelled(_))));
    assert_eq!(scheduler.pending_count(), 0);
}
