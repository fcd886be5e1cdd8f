use indexmap::IndexMap;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache_key::{store_kind_of, CacheKey, CacheRequest, RequestParams, StoreKind};
use crate::clock::{Clock, SystemClock};
use crate::metrics;
use crate::persistence::{CacheEntry, InMemoryStore, PersistentStore};
use crate::scheduler::TaskScheduler;
use crate::settings::{CacheSettings, CacheTtls};
use crate::utils::lock;

/// Two-layer cache: a bounded in-memory map in front of a persistent store.
///
/// ## Layers
///
/// - **Memory**: at most `memory_limit` entries. When full, the entry inserted
///   first is evicted (FIFO, not LRU: reads do not refresh position).
/// - **Persistent**: unbounded, partitioned per [`StoreKind`] with a chain
///   index. Only `sweep_expired` shrinks it.
///
/// Validity is `now - timestamp < ttl` with the TTL supplied by the reader.
/// Persistent-layer failures are logged and count as misses; they never reach
/// the caller.
///
/// A persistent hit is copied back into memory only if no invalidation ran
/// while it was being read, so an entry removed by `invalidate`,
/// `invalidate_by_chain` or `clear_all` never comes back through a read that
/// was already in flight.
pub struct CacheStore {
    memory: Mutex<IndexMap<String, CacheEntry>>,
    memory_limit: usize,
    /// Bumped under the memory lock by every invalidation.
    generation: AtomicU64,
    persistent: Arc<dyn PersistentStore>,
    ttls: CacheTtls,
    clock: Arc<dyn Clock>,
    counters: CacheCounters,
}

#[derive(Default)]
struct CacheCounters {
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    persistent_errors: AtomicU64,
}

/// Counters readable without touching the persistent layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheSnapshot {
    pub memory_size: usize,
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub persistent_errors: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    #[serde(flatten)]
    pub snapshot: CacheSnapshot,
    /// Persistent entry count per store name.
    pub stores: BTreeMap<String, usize>,
}

impl CacheStore {
    pub fn new(
        settings: &CacheSettings,
        persistent: Arc<dyn PersistentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            memory: Mutex::new(IndexMap::new()),
            memory_limit: settings.memory_limit.max(1),
            generation: AtomicU64::new(0),
            persistent,
            ttls: settings.ttl.clone(),
            clock,
            counters: CacheCounters::default(),
        }
    }

    /// Memory-only persistence and the system clock.
    pub fn in_memory(settings: &CacheSettings) -> Self {
        Self::new(settings, Arc::new(InMemoryStore::new()), Arc::new(SystemClock))
    }

    /// Configured TTL for a store kind.
    pub fn ttl(&self, kind: StoreKind) -> Duration {
        self.ttls.ttl(kind)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn get(
        &self,
        kind: StoreKind,
        params: &RequestParams,
        ttl: Duration,
    ) -> Option<serde_json::Value> {
        let key = CacheKey::new(kind, params);
        let now = self.clock.now_millis();

        {
            let memory = lock(&self.memory);
            if let Some(entry) = memory.get(key.as_str()) {
                if entry.is_fresh(now, ttl) {
                    self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                    metrics::increment_cache_hit("memory");
                    return Some(entry.data.clone());
                }
            }
        }

        let generation = self.generation.load(Ordering::Acquire);
        match self.persistent.get(kind, key.as_str()).await {
            Ok(Some(entry)) if entry.is_fresh(now, ttl) => {
                self.counters.persistent_hits.fetch_add(1, Ordering::Relaxed);
                metrics::increment_cache_hit("persistent");
                let data = entry.data.clone();
                self.restore_memory(entry, generation);
                Some(data)
            }
            Ok(_) => {
                self.record_miss(kind);
                None
            }
            Err(e) => {
                self.record_persistent_error("get", &e);
                self.record_miss(kind);
                None
            }
        }
    }

    /// `get` deserialized into `T`; an undecodable entry reads as a miss.
    pub async fn get_as<T: DeserializeOwned>(
        &self,
        kind: StoreKind,
        params: &RequestParams,
        ttl: Duration,
    ) -> Option<T> {
        let value = self.get(kind, params, ttl).await?;
        match serde_json::from_value(value) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("⚠️ Cached {} entry has unexpected shape: {}", kind, e);
                None
            }
        }
    }

    pub async fn set<T: Serialize + ?Sized>(
        &self,
        kind: StoreKind,
        params: &RequestParams,
        data: &T,
        chain_tag: Option<u64>,
    ) {
        let data = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                warn!("⚠️ Skipping cache write for {}: {}", kind, e);
                return;
            }
        };
        let entry = CacheEntry {
            key: CacheKey::new(kind, params).to_string(),
            data,
            timestamp: self.clock.now_millis(),
            chain_tag,
        };

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.insert_memory(entry.clone());
        if let Err(e) = self.persistent.put(kind, entry).await {
            self.record_persistent_error("put", &e);
        }
    }

    /// Typed read using the request's store kind and the configured TTL.
    pub async fn get_request<R, T>(&self, request: &R) -> Option<T>
    where
        R: CacheRequest,
        T: DeserializeOwned,
    {
        let kind = request.store_kind();
        self.get_as(kind, &request.params(), self.ttl(kind)).await
    }

    /// Typed write tagged with the request's chain.
    pub async fn set_request<R, T>(&self, request: &R, data: &T)
    where
        R: CacheRequest,
        T: Serialize + ?Sized,
    {
        self.set(request.store_kind(), &request.params(), data, request.chain_tag())
            .await
    }

    pub async fn invalidate(&self, kind: StoreKind, params: &RequestParams) {
        let key = CacheKey::new(kind, params);
        self.evict_memory(|k, _| k != key.as_str());
        if let Err(e) = self.persistent.delete(kind, key.as_str()).await {
            self.record_persistent_error("delete", &e);
        }
        self.evict_memory(|k, _| k != key.as_str());
    }

    /// Drops every entry, in every store, tagged with `chain_tag`.
    pub async fn invalidate_by_chain(&self, chain_tag: u64) {
        let mut removed_memory = self.evict_memory(|_, entry| entry.chain_tag != Some(chain_tag));

        let mut removed_persistent = 0;
        for kind in StoreKind::ALL {
            match self.persistent.delete_by_chain(kind, chain_tag).await {
                Ok(n) => removed_persistent += n,
                Err(e) => self.record_persistent_error("delete_by_chain", &e),
            }
        }
        // lecturas que terminaron durante el borrado
        removed_memory += self.evict_memory(|_, entry| entry.chain_tag != Some(chain_tag));
        debug!(
            "🧹 Invalidated chain {}: {} memory, {} persistent entries",
            chain_tag, removed_memory, removed_persistent
        );
    }

    /// Removes entries older than their store kind's TTL from both layers.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now_millis();

        let removed_memory = {
            let mut memory = lock(&self.memory);
            let before = memory.len();
            memory.retain(|key, entry| {
                let kind = store_kind_of(key).unwrap_or(StoreKind::Metadata);
                entry.is_fresh(now, self.ttls.ttl(kind))
            });
            before - memory.len()
        };
        metrics::set_cache_size(self.memory_len());

        let mut removed_persistent = 0;
        for kind in StoreKind::ALL {
            let cutoff = now - self.ttl(kind).as_millis() as i64;
            match self.persistent.delete_older_than(kind, cutoff).await {
                Ok(n) => removed_persistent += n,
                Err(e) => self.record_persistent_error("sweep", &e),
            }
        }

        if removed_memory + removed_persistent > 0 {
            debug!(
                "🧹 Swept {} memory and {} persistent expired entries",
                removed_memory, removed_persistent
            );
        }
        removed_memory + removed_persistent
    }

    pub async fn clear_all(&self) {
        self.evict_memory(|_, _| false);
        for kind in StoreKind::ALL {
            if let Err(e) = self.persistent.clear(kind).await {
                self.record_persistent_error("clear", &e);
            }
        }
        self.evict_memory(|_, _| false);
        metrics::set_cache_size(0);
    }

    /// Registers the periodic expiry sweep.
    pub fn start_sweeper(self: &Arc<Self>, scheduler: &TaskScheduler, interval: Duration) {
        let cache = Arc::clone(self);
        scheduler.schedule_interval("cache:sweep", interval, move || {
            let cache = Arc::clone(&cache);
            async move {
                cache.sweep_expired().await;
            }
        });
    }

    pub fn memory_len(&self) -> usize {
        lock(&self.memory).len()
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let memory_hits = self.counters.memory_hits.load(Ordering::Relaxed);
        let persistent_hits = self.counters.persistent_hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = memory_hits + persistent_hits + misses;

        CacheSnapshot {
            memory_size: self.memory_len(),
            memory_hits,
            persistent_hits,
            misses,
            writes: self.counters.writes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            persistent_errors: self.counters.persistent_errors.load(Ordering::Relaxed),
            hit_rate: if lookups > 0 {
                (memory_hits + persistent_hits) as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let mut stores = BTreeMap::new();
        for kind in StoreKind::ALL {
            match self.persistent.count(kind).await {
                Ok(n) => {
                    stores.insert(kind.store_name().to_string(), n);
                }
                Err(e) => self.record_persistent_error("count", &e),
            }
        }
        CacheStats {
            snapshot: self.snapshot(),
            stores,
        }
    }

    fn insert_memory(&self, entry: CacheEntry) {
        let size = {
            let mut memory = lock(&self.memory);
            self.insert_locked(&mut memory, entry);
            memory.len()
        };
        metrics::set_cache_size(size);
    }

    /// Copies a persistent hit into memory unless an invalidation ran since
    /// `generation` was read or a newer write already landed.
    fn restore_memory(&self, entry: CacheEntry, generation: u64) {
        let size = {
            let mut memory = lock(&self.memory);
            if self.generation.load(Ordering::Acquire) != generation {
                debug!("Skipping memory restore of {}: invalidated during read", entry.key);
                return;
            }
            if let Some(current) = memory.get(&entry.key) {
                if current.timestamp >= entry.timestamp {
                    return;
                }
            }
            self.insert_locked(&mut memory, entry);
            memory.len()
        };
        metrics::set_cache_size(size);
    }

    fn insert_locked(&self, memory: &mut IndexMap<String, CacheEntry>, entry: CacheEntry) {
        if !memory.contains_key(&entry.key) && memory.len() >= self.memory_limit {
            if memory.shift_remove_index(0).is_some() {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        memory.insert(entry.key.clone(), entry);
    }

    /// Drops the memory entries `keep` rejects and starts a new generation.
    fn evict_memory(&self, mut keep: impl FnMut(&str, &CacheEntry) -> bool) -> usize {
        let size;
        let removed = {
            let mut memory = lock(&self.memory);
            self.generation.fetch_add(1, Ordering::AcqRel);
            let before = memory.len();
            memory.retain(|key, entry| keep(key, entry));
            size = memory.len();
            before - size
        };
        metrics::set_cache_size(size);
        removed
    }

    fn record_miss(&self, kind: StoreKind) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::increment_cache_miss(kind.store_name());
    }

    fn record_persistent_error(&self, operation: &str, error: &dyn std::fmt::Display) {
        self.counters.persistent_errors.fetch_add(1, Ordering::Relaxed);
        metrics::increment_cache_persistent_error(operation);
        warn!("⚠️ Persistent cache {} failed, degrading to miss: {}", operation, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn store_with_clock(limit: usize) -> (CacheStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let settings = CacheSettings {
            memory_limit: limit,
            ..CacheSettings::default()
        };
        let store = CacheStore::new(&settings, Arc::new(InMemoryStore::new()), clock.clone());
        (store, clock)
    }

    fn params(id: u64) -> RequestParams {
        RequestParams::new().with("id", id).with("chainId", 1)
    }

    #[tokio::test]
    async fn test_memory_layer_is_fifo_bounded() {
        let (store, _clock) = store_with_clock(2);
        for id in 0..3 {
            store.set(StoreKind::Prices, &params(id), &json!(id), Some(1)).await;
        }
        assert_eq!(store.memory_len(), 2);
        assert_eq!(store.snapshot().evictions, 1);

        // la primera entrada salio de memoria pero sigue en la capa persistente
        let ttl = Duration::from_secs(60);
        assert_eq!(store.get(StoreKind::Prices, &params(0), ttl).await, Some(json!(0)));
        assert_eq!(store.snapshot().persistent_hits, 1);
    }

    #[tokio::test]
    async fn test_overwrite_keeps_single_entry() {
        let (store, _clock) = store_with_clock(2);
        store.set(StoreKind::Prices, &params(1), &json!("a"), None).await;
        store.set(StoreKind::Prices, &params(1), &json!("b"), None).await;
        store.set(StoreKind::Prices, &params(2), &json!("c"), None).await;
        assert_eq!(store.memory_len(), 2);
        assert_eq!(store.snapshot().evictions, 0);
        assert_eq!(
            store.get(StoreKind::Prices, &params(1), Duration::from_secs(1)).await,
            Some(json!("b"))
        );
    }

    #[tokio::test]
    async fn test_sweep_uses_kind_ttl() {
        let (store, clock) = store_with_clock(10);
        store.set(StoreKind::Balances, &params(1), &json!("1"), Some(1)).await;
        store.set(StoreKind::TokenInfo, &params(1), &json!({"symbol": "DAI"}), Some(1)).await;

        clock.advance(Duration::from_secs(31));
        // una entrada por capa
        assert_eq!(store.sweep_expired().await, 2);
        assert_eq!(store.memory_len(), 1);
        let stats = store.stats().await;
        assert_eq!(stats.stores["balances"], 0);
        assert_eq!(stats.stores["token-info"], 1);
    }
}
