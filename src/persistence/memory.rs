use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{CacheEntry, Partition, PersistentStore};
use crate::cache_key::StoreKind;
use crate::errors::PersistenceError;
use crate::utils::lock;

/// Persistent-store stand-in that lives as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    partitions: Mutex<HashMap<StoreKind, Partition>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_partition<R>(&self, kind: StoreKind, f: impl FnOnce(&mut Partition) -> R) -> R {
        let mut partitions = lock(&self.partitions);
        f(partitions.entry(kind).or_default())
    }
}

#[async_trait]
impl PersistentStore for InMemoryStore {
    async fn get(&self, kind: StoreKind, key: &str) -> Result<Option<CacheEntry>, PersistenceError> {
        Ok(self.with_partition(kind, |p| p.get(key)))
    }

    async fn put(&self, kind: StoreKind, entry: CacheEntry) -> Result<(), PersistenceError> {
        self.with_partition(kind, |p| p.put(entry));
        Ok(())
    }

    async fn delete(&self, kind: StoreKind, key: &str) -> Result<(), PersistenceError> {
        self.with_partition(kind, |p| p.remove(key));
        Ok(())
    }

    async fn delete_by_chain(&self, kind: StoreKind, chain_tag: u64) -> Result<usize, PersistenceError> {
        Ok(self.with_partition(kind, |p| p.remove_by_chain(chain_tag)))
    }

    async fn delete_older_than(&self, kind: StoreKind, cutoff_millis: i64) -> Result<usize, PersistenceError> {
        Ok(self.with_partition(kind, |p| p.remove_older_than(cutoff_millis)))
    }

    async fn clear(&self, kind: StoreKind) -> Result<(), PersistenceError> {
        self.with_partition(kind, |p| p.clear());
        Ok(())
    }

    async fn count(&self, kind: StoreKind) -> Result<usize, PersistenceError> {
        Ok(self.with_partition(kind, |p| p.len()))
    }
}
