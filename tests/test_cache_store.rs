//! Integration tests for the two-layer cache
//!
//! Tests cover:
//! - TTL boundary
//! - Key canonicalization
//! - Chain-scoped eviction across stores
//! - File persistence across restarts
//! - Degradation when the persistent layer fails
//! - Invalidation racing an in-flight persistent read
//! - Recovery from a damaged store file

use async_trait::async_trait;
use chain_read_sdk::cache::CacheStore;
use chain_read_sdk::cache_key::{BalanceRequest, CacheKey, CacheRequest, RequestParams, StoreKind, TokenInfoRequest};
use chain_read_sdk::clock::ManualClock;
use chain_read_sdk::errors::PersistenceError;
use chain_read_sdk::persistence::{CacheEntry, FileStore, InMemoryStore, PersistentStore};
use chain_read_sdk::settings::CacheSettings;
use ethers::types::Address;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn cache_with(store: Arc<dyn PersistentStore>) -> (CacheStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let cache = CacheStore::new(&CacheSettings::default(), store, clock.clone());
    (cache, clock)
}

#[tokio::test]
async fn test_entry_expires_exactly_at_ttl() {
    let (cache, clock) = cache_with(Arc::new(InMemoryStore::new()));
    let params = RequestParams::new().with("tokenAddress", "0xabc").with("chainId", 1);
    let ttl = Duration::from_secs(30);
    cache.set(StoreKind::Balances, &params, &"5", Some(1)).await;

    clock.advance(Duration::from_millis(29_999));
    assert_eq!(cache.get(StoreKind::Balances, &params, ttl).await, Some(json!("5")));

    clock.advance(Duration::from_millis(1));
    assert_eq!(cache.get(StoreKind::Balances, &params, ttl).await, None);
}

#[test]
fn test_keys_ignore_order_and_case() {
    let a = RequestParams::new().with("b", 2).with("a", 1);
    let b = RequestParams::new().with("a", 1).with("b", 2);
    let c = RequestParams::new().with("A", 1).with("B", 2);
    assert_eq!(CacheKey::new(StoreKind::Prices, &a), CacheKey::new(StoreKind::Prices, &b));
    assert_eq!(CacheKey::new(StoreKind::Prices, &b), CacheKey::new(StoreKind::Prices, &c));
    assert_eq!(CacheKey::new(StoreKind::Prices, &a).as_str(), "prices:a:1|b:2");

    let token: Address = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".parse().unwrap();
    let request = TokenInfoRequest { token, chain_id: 1 };
    let by_hand = RequestParams::new()
        .with("chainId", 1)
        .with("tokenAddress", "0xA0B86991C6218B36C1D19D4A2E9EB0CE3606EB48");
    assert_eq!(request.cache_key(), CacheKey::new(StoreKind::TokenInfo, &by_hand));
}

#[tokio::test]
async fn test_invalidate_by_chain_spares_other_chains() {
    let (cache, _clock) = cache_with(Arc::new(InMemoryStore::new()));
    let token = Address::from_low_u64_be(0xaa);
    let user = Address::from_low_u64_be(0xbeef);

    for chain_id in [1u64, 8453] {
        cache
            .set_request(&TokenInfoRequest { token, chain_id }, &json!({"symbol": "USDC", "decimals": 6}))
            .await;
        cache
            .set_request(&BalanceRequest { token, user, chain_id }, "100")
            .await;
    }
    cache.invalidate_by_chain(1).await;

    let info_1: Option<serde_json::Value> = cache.get_request(&TokenInfoRequest { token, chain_id: 1 }).await;
    let balance_1: Option<String> = cache.get_request(&BalanceRequest { token, user, chain_id: 1 }).await;
    assert!(info_1.is_none());
    assert!(balance_1.is_none());

    let info_base: Option<serde_json::Value> = cache.get_request(&TokenInfoRequest { token, chain_id: 8453 }).await;
    let balance_base: Option<String> = cache.get_request(&BalanceRequest { token, user, chain_id: 8453 }).await;
    assert_eq!(info_base, Some(json!({"symbol": "USDC", "decimals": 6})));
    assert_eq!(balance_base.as_deref(), Some("100"));
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let params = RequestParams::new().with("name", "pools").with("chainId", 5000);

    {
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let (cache, _clock) = cache_with(store);
        cache.set(StoreKind::Metadata, &params, &json!(["a", "b"]), Some(5000)).await;
    }

    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let (cache, _clock) = cache_with(store);
    assert_eq!(cache.memory_len(), 0);
    assert_eq!(
        cache.get(StoreKind::Metadata, &params, Duration::from_secs(60)).await,
        Some(json!(["a", "b"]))
    );
    assert_eq!(cache.snapshot().persistent_hits, 1);
}

/// Backend that rejects everything.
struct BrokenStore;

#[async_trait]
impl PersistentStore for BrokenStore {
    async fn get(&self, _kind: StoreKind, _key: &str) -> Result<Option<CacheEntry>, PersistenceError> {
        Err(PersistenceError::Backend("disk on fire".to_string()))
    }

    async fn put(&self, _kind: StoreKind, _entry: CacheEntry) -> Result<(), PersistenceError> {
        Err(PersistenceError::Backend("disk on fire".to_string()))
    }

    async fn delete(&self, _kind: StoreKind, _key: &str) -> Result<(), PersistenceError> {
        Err(PersistenceError::Backend("disk on fire".to_string()))
    }

    async fn delete_by_chain(&self, _kind: StoreKind, _chain_tag: u64) -> Result<usize, PersistenceError> {
        Err(PersistenceError::Backend("disk on fire".to_string()))
    }

    async fn delete_older_than(&self, _kind: StoreKind, _cutoff_millis: i64) -> Result<usize, PersistenceError> {
        Err(PersistenceError::Backend("disk on fire".to_string()))
    }

    async fn clear(&self, _kind: StoreKind) -> Result<(), PersistenceError> {
        Err(PersistenceError::Backend("disk on fire".to_string()))
    }

    async fn count(&self, _kind: StoreKind) -> Result<usize, PersistenceError> {
        Err(PersistenceError::Backend("disk on fire".to_string()))
    }
}

#[tokio::test]
async fn test_persistent_failures_degrade_to_memory_and_misses() {
    let (cache, _clock) = cache_with(Arc::new(BrokenStore));
    let ttl = Duration::from_secs(60);
    let stored = RequestParams::new().with("id", 1);
    let missing = RequestParams::new().with("id", 2);

    cache.set(StoreKind::Prices, &stored, &json!(1.5), None).await;
    assert_eq!(cache.get(StoreKind::Prices, &stored, ttl).await, Some(json!(1.5)));
    assert_eq!(cache.get(StoreKind::Prices, &missing, ttl).await, None);

    cache.invalidate_by_chain(1).await;
    cache.clear_all().await;
    assert_eq!(cache.memory_len(), 0);

    let stats = cache.stats().await;
    assert!(stats.snapshot.persistent_errors >= 2);
    assert_eq!(stats.snapshot.misses, 1);
}

/// In-memory backend whose reads resolve only after a delay.
struct SlowStore {
    inner: InMemoryStore,
    delay: Duration,
}

#[async_trait]
impl PersistentStore for SlowStore {
    async fn get(&self, kind: StoreKind, key: &str) -> Result<Option<CacheEntry>, PersistenceError> {
        let found = self.inner.get(kind, key).await;
        tokio::time::sleep(self.delay).await;
        found
    }

    async fn put(&self, kind: StoreKind, entry: CacheEntry) -> Result<(), PersistenceError> {
        self.inner.put(kind, entry).await
    }

    async fn delete(&self, kind: StoreKind, key: &str) -> Result<(), PersistenceError> {
        self.inner.delete(kind, key).await
    }

    async fn delete_by_chain(&self, kind: StoreKind, chain_tag: u64) -> Result<usize, PersistenceError> {
        self.inner.delete_by_chain(kind, chain_tag).await
    }

    async fn delete_older_than(&self, kind: StoreKind, cutoff_millis: i64) -> Result<usize, PersistenceError> {
        self.inner.delete_older_than(kind, cutoff_millis).await
    }

    async fn clear(&self, kind: StoreKind) -> Result<(), PersistenceError> {
        self.inner.clear(kind).await
    }

    async fn count(&self, kind: StoreKind) -> Result<usize, PersistenceError> {
        self.inner.count(kind).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_wins_over_in_flight_read() {
    let store = Arc::new(SlowStore {
        inner: InMemoryStore::new(),
        delay: Duration::from_millis(20),
    });
    let settings = CacheSettings {
        memory_limit: 1,
        ..CacheSettings::default()
    };
    let cache = Arc::new(CacheStore::new(
        &settings,
        store,
        Arc::new(ManualClock::new(1_700_000_000_000)),
    ));
    let ttl = Duration::from_secs(60);
    let evicted = RequestParams::new().with("chainId", 1).with("tokenAddress", "0xa");
    let newer = RequestParams::new().with("chainId", 8453).with("tokenAddress", "0xb");

    cache.set(StoreKind::Balances, &evicted, &"7", Some(1)).await;
    cache.set(StoreKind::Balances, &newer, &"8", Some(8453)).await;
    assert_eq!(cache.memory_len(), 1);

    let reader = {
        let cache = Arc::clone(&cache);
        let evicted = evicted.clone();
        tokio::spawn(async move { cache.get(StoreKind::Balances, &evicted, ttl).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    cache.invalidate_by_chain(1).await;
    reader.await.unwrap();

    assert_eq!(cache.get(StoreKind::Balances, &evicted, ttl).await, None);
    assert_eq!(cache.get(StoreKind::Balances, &newer, ttl).await, Some(json!("8")));
}

#[tokio::test]
async fn test_damaged_store_file_is_recovered_by_clear_all() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::write(dir.path().join("balances.bin"), b"\x00\x00\x00\x7fgarbage")
        .await
        .unwrap();

    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let (cache, _clock) = cache_with(store);
    cache.clear_all().await;
    let params = RequestParams::new().with("chainId", 1).with("userAddress", "0xbeef");
    cache.set(StoreKind::Balances, &params, &"42", Some(1)).await;

    let stats = cache.stats().await;
    assert_eq!(stats.stores["balances"], 1);
    assert_eq!(stats.snapshot.persistent_errors, 0);

    let reopened = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let (cache, _clock) = cache_with(reopened);
    assert_eq!(
        cache.get(StoreKind::Balances, &params, Duration::from_secs(60)).await,
        Some(json!("42"))
    );
}
