//! Integration tests for per-chain call batching
//!
//! Tests cover:
//! - Slicing of a large queue into max-size multicalls
//! - Per-call decode isolation
//! - Batch-wide transport failures
//! - Address deduplication in the batch helpers

mod common;

use chain_read_sdk::call_batcher::CallBatcher;
use chain_read_sdk::chains::ChainRegistry;
use chain_read_sdk::contracts::{BalanceOfCall, BalanceOfReturn, DecimalsCall, DecimalsReturn, SymbolCall, SymbolReturn};
use chain_read_sdk::errors::ReadError;
use chain_read_sdk::multicall::Multicall;
use chain_read_sdk::rpc_pool::RpcLoadBalancer;
use chain_read_sdk::scheduler::TaskScheduler;
use chain_read_sdk::settings::{Batching, Rpc};
use common::{addr, mock_settings, primary_url, MockTransport};
use ethers::types::U256;
use std::sync::Arc;

fn batcher_with(mock: Arc<MockTransport>) -> CallBatcher {
    let scheduler = Arc::new(TaskScheduler::new());
    let registry = Arc::new(ChainRegistry::new(mock_settings().networks()));
    let balancer = Arc::new(RpcLoadBalancer::new(
        registry,
        mock,
        Arc::clone(&scheduler),
        Rpc::default(),
    ));
    CallBatcher::new(Multicall::new(balancer), scheduler, Batching::default())
}

#[tokio::test]
async fn test_250_calls_become_three_aggregates() {
    let mock = MockTransport::new();
    let token = addr(0xaa);
    mock.add_token(token, "USDC", 6);
    for i in 1..=250u64 {
        mock.set_balance(token, addr(0x1000 + i), i * 10);
    }
    let batcher = batcher_with(mock.clone());

    let handles: Vec<_> = (1..=250u64)
        .map(|i| {
            let batcher = batcher.clone();
            tokio::spawn(async move {
                batcher
                    .batched_call::<_, BalanceOfReturn>(1, token, BalanceOfCall { account: addr(0x1000 + i) })
                    .await
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let balance = handle.await.unwrap().unwrap();
        assert_eq!(balance.0, U256::from((i as u64 + 1) * 10), "call {} got another call's result", i);
    }
    assert_eq!(mock.aggregate_sizes(), vec![100, 100, 50]);

    let stats = batcher.stats();
    assert_eq!(stats.total_batches, 3);
    assert_eq!(stats.total_calls, 250);
}

#[tokio::test]
async fn test_decode_failure_only_fails_its_call() {
    let mock = MockTransport::new();
    let good = addr(0xaa);
    let unknown = addr(0xbb);
    mock.add_token(good, "WETH", 18);
    let batcher = batcher_with(mock.clone());

    let (symbol, broken, decimals) = tokio::join!(
        batcher.batched_call::<_, SymbolReturn>(1, good, SymbolCall),
        batcher.batched_call::<_, SymbolReturn>(1, unknown, SymbolCall),
        batcher.batched_call::<_, DecimalsReturn>(1, good, DecimalsCall),
    );

    assert_eq!(symbol.unwrap().0, "WETH");
    assert_eq!(decimals.unwrap().0, 18);
    let err = broken.unwrap_err();
    assert!(err.is_decode(), "expected decode error, got {:?}", err);
    assert_eq!(mock.aggregate_sizes(), vec![3]);
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_rejects_the_whole_batch() {
    let mock = MockTransport::new();
    mock.add_token(addr(0xaa), "HYPE", 18);
    // la cadena 999 no tiene fallback
    mock.fail_url(&primary_url(999));
    let batcher = batcher_with(mock.clone());

    let (a, b) = tokio::join!(
        batcher.batched_call::<_, SymbolReturn>(999, addr(0xaa), SymbolCall),
        batcher.batched_call::<_, DecimalsReturn>(999, addr(0xaa), DecimalsCall),
    );
    for outcome in [a.map(|_| ()), b.map(|_| ())] {
        match outcome {
            Err(ReadError::AllEndpointsFailed { chain_id, .. }) => assert_eq!(chain_id, 999),
            other => panic!("expected AllEndpointsFailed, got {:?}", other),
        }
    }
    assert_eq!(mock.aggregate_count(), 1);
}

#[tokio::test]
async fn test_unsupported_chain_fails_before_queueing() {
    let mock = MockTransport::new();
    let batcher = batcher_with(mock.clone());

    let err = batcher
        .batched_call::<_, SymbolReturn>(42, addr(0xaa), SymbolCall)
        .await
        .unwrap_err();
    assert_eq!(err, ReadError::UnsupportedChain(42));
    assert!(batcher.stats().queues.is_empty());
    assert_eq!(mock.aggregate_count(), 0);
}

#[tokio::test]
async fn test_helpers_deduplicate_addresses() {
    let mock = MockTransport::new();
    let (dai, usdc) = (addr(0xda1), addr(0x05dc));
    let user = addr(0xbeef);
    mock.add_token(dai, "DAI", 18);
    mock.add_token(usdc, "USDC", 6);
    mock.set_balance(usdc, user, 2_500_000);
    let batcher = batcher_with(mock.clone());

    let info = batcher.batch_get_token_info(1, &[dai, usdc, dai]).await.unwrap();
    assert_eq!(info.len(), 2);
    assert_eq!(info[0].address, dai);
    assert_eq!(info[0].symbol.as_deref(), Some("DAI"));
    assert_eq!(info[1].decimals, Some(6));
    assert_eq!(mock.aggregate_sizes(), vec![4]);

    let balances = batcher
        .batch_get_balances(1, &[usdc, addr(0x404), usdc], user)
        .await
        .unwrap();
    assert_eq!(balances.len(), 2);
    assert_eq!(balances[0].balance, U256::from(2_500_000u64));
    assert!(balances[0].error.is_none());
    // token desconocido: balance 0 con el error adjunto
    assert_eq!(balances[1].balance, U256::zero());
    assert!(balances[1].error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_clear_all_cancels_queued_calls() {
    let mock = MockTransport::new();
    mock.add_token(addr(0xaa), "WETH", 18);
    let batcher = batcher_with(mock.clone());

    let pending = {
        let batcher = batcher.clone();
        tokio::spawn(async move {
            batcher
                .batched_call::<_, SymbolReturn>(1, addr(0xaa), SymbolCall)
                .await
        })
    };
    tokio::task::yield_now().await;
    assert_eq!(batcher.stats().queues[0].queued, 1);

    assert_eq!(batcher.clear_all(), 1);
    assert!(matches!(pending.await.unwrap(), Err(ReadError::Cancelled(_))));
    assert_eq!(mock.aggregate_count(), 0);
}
