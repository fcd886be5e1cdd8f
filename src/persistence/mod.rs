//! Persistent cache layer.
//!
//! Entries are partitioned into one named store per [`StoreKind`], each with
//! a secondary index on chain tag so a network switch can drop a whole chain
//! at once. Backends:
//!
//! - [`InMemoryStore`]: process lifetime only, default and test backend
//! - [`FileStore`]: one bincode file per store under a directory
//! - `RedisStore`: shared store, behind the `redis` feature

mod file;
mod memory;
#[cfg(feature = "redis")]
mod redis_store;

pub use file::FileStore;
pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

use anyhow::Result;
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::cache_key::StoreKind;
use crate::errors::PersistenceError;
use crate::settings::{PersistentBackend, Persistence};

/// A cached value with its write time and optional chain tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub data: serde_json::Value,
    /// Epoch milliseconds of the write.
    pub timestamp: i64,
    pub chain_tag: Option<u64>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now_millis: i64, ttl: Duration) -> bool {
        now_millis - self.timestamp < ttl.as_millis() as i64
    }
}

/// Binary record. `data` travels as JSON text since bincode cannot
/// deserialize a self-describing `serde_json::Value`.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredEntry {
    key: String,
    data_json: String,
    timestamp: i64,
    chain_tag: Option<u64>,
}

impl StoredEntry {
    pub(crate) fn encode(entry: &CacheEntry) -> Result<Vec<u8>, PersistenceError> {
        Ok(bincode::serialize(&StoredEntry::from_entry(entry)?)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<CacheEntry, PersistenceError> {
        let record: StoredEntry = bincode::deserialize(bytes)?;
        record.into_entry()
    }

    fn from_entry(entry: &CacheEntry) -> Result<Self, PersistenceError> {
        Ok(StoredEntry {
            key: entry.key.clone(),
            data_json: serde_json::to_string(&entry.data)?,
            timestamp: entry.timestamp,
            chain_tag: entry.chain_tag,
        })
    }

    fn into_entry(self) -> Result<CacheEntry, PersistenceError> {
        Ok(CacheEntry {
            data: serde_json::from_str(&self.data_json)?,
            key: self.key,
            timestamp: self.timestamp,
            chain_tag: self.chain_tag,
        })
    }
}

/// Backend of the durable cache layer. Errors are reported, never retried;
/// the cache treats them as misses.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, kind: StoreKind, key: &str) -> Result<Option<CacheEntry>, PersistenceError>;

    async fn put(&self, kind: StoreKind, entry: CacheEntry) -> Result<(), PersistenceError>;

    async fn delete(&self, kind: StoreKind, key: &str) -> Result<(), PersistenceError>;

    /// Removes every entry of `kind` tagged with `chain_tag`.
    async fn delete_by_chain(&self, kind: StoreKind, chain_tag: u64) -> Result<usize, PersistenceError>;

    /// Removes every entry of `kind` written at or before `cutoff_millis`.
    async fn delete_older_than(&self, kind: StoreKind, cutoff_millis: i64) -> Result<usize, PersistenceError>;

    async fn clear(&self, kind: StoreKind) -> Result<(), PersistenceError>;

    async fn count(&self, kind: StoreKind) -> Result<usize, PersistenceError>;
}

/// One named store: entries by key plus the chain-tag index.
#[derive(Debug, Default)]
pub(crate) struct Partition {
    entries: HashMap<String, CacheEntry>,
    by_chain: HashMap<u64, HashSet<String>>,
}

impl Partition {
    pub(crate) fn from_entries(entries: impl IntoIterator<Item = CacheEntry>) -> Self {
        let mut partition = Partition::default();
        for entry in entries {
            partition.put(entry);
        }
        partition
    }

    pub(crate) fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).cloned()
    }

    pub(crate) fn put(&mut self, entry: CacheEntry) {
        self.unindex(&entry.key);
        if let Some(chain) = entry.chain_tag {
            self.by_chain
                .entry(chain)
                .or_default()
                .insert(entry.key.clone());
        }
        self.entries.insert(entry.key.clone(), entry);
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        self.unindex(key);
        self.entries.remove(key).is_some()
    }

    pub(crate) fn remove_by_chain(&mut self, chain_tag: u64) -> usize {
        let keys = self.by_chain.remove(&chain_tag).unwrap_or_default();
        keys.iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count()
    }

    pub(crate) fn remove_older_than(&mut self, cutoff_millis: i64) -> usize {
        let expired = self.expired_keys(cutoff_millis);
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    pub(crate) fn chain_keys(&self, chain_tag: u64) -> Vec<String> {
        self.by_chain
            .get(&chain_tag)
            .map(|keys| keys.iter().filter(|key| self.entries.contains_key(key.as_str())).cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn expired_keys(&self, cutoff_millis: i64) -> Vec<String> {
        self.entries
            .values()
            .filter(|entry| entry.timestamp <= cutoff_millis)
            .map(|entry| entry.key.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.by_chain.clear();
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    fn unindex(&mut self, key: &str) {
        let Some(chain) = self.entries.get(key).and_then(|e| e.chain_tag) else {
            return;
        };
        if let Some(keys) = self.by_chain.get_mut(&chain) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_chain.remove(&chain);
            }
        }
    }
}

/// Opens the backend selected in settings.
pub async fn open_store(settings: &Persistence) -> Result<Arc<dyn PersistentStore>> {
    match settings.backend {
        PersistentBackend::Memory => Ok(Arc::new(InMemoryStore::new())),
        PersistentBackend::File => {
            info!("💾 Persistent cache at {}", settings.path);
            Ok(Arc::new(FileStore::open(&settings.path).await?))
        }
        #[cfg(feature = "redis")]
        PersistentBackend::Redis => Ok(Arc::new(
            RedisStore::connect(&settings.redis_url, &settings.redis_namespace).await?,
        )),
        #[cfg(not(feature = "redis"))]
        PersistentBackend::Redis => Err(anyhow::anyhow!(
            "Redis feature not enabled. Enable with 'redis' feature flag."
        )),
    }
}
