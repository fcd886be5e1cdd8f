// Redis backend for the persistent cache layer.
// Layout per store kind:
//   {ns}:{store}:{key}          -> bincode StoredEntry
//   {ns}:{store}:keys           -> set of all keys
//   {ns}:{store}:chain:{id}     -> set of keys tagged with chain id
//   {ns}:{store}:chain-of       -> hash key -> chain id, source of truth for the sets

use anyhow::Context;
use async_trait::async_trait;
use log::info;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::BTreeSet;

use super::{CacheEntry, PersistentStore, StoredEntry};
use crate::cache_key::StoreKind;
use crate::errors::PersistenceError;

pub struct RedisStore {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisStore {
    pub async fn connect(url: &str, namespace: &str) -> anyhow::Result<Self> {
        let client = Client::open(url).context("Failed to create Redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        info!("✅ Redis cache store connected to {}", url);

        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn entry_key(&self, kind: StoreKind, key: &str) -> String {
        format!("{}:{}:{}", self.namespace, kind.store_name(), key)
    }

    fn keys_set(&self, kind: StoreKind) -> String {
        format!("{}:{}:keys", self.namespace, kind.store_name())
    }

    fn chain_set(&self, kind: StoreKind, chain_tag: u64) -> String {
        format!("{}:{}:chain:{}", self.namespace, kind.store_name(), chain_tag)
    }

    fn chain_index(&self, kind: StoreKind) -> String {
        format!("{}:{}:chain-of", self.namespace, kind.store_name())
    }

    /// Current chain tag of each key, in order.
    async fn chains_of(&self, kind: StoreKind, keys: &[String]) -> Result<Vec<Option<u64>>, PersistenceError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        Ok(redis::cmd("HMGET")
            .arg(self.chain_index(kind))
            .arg(keys)
            .query_async::<_, Vec<Option<u64>>>(&mut conn)
            .await?)
    }

    async fn delete_keys(&self, kind: StoreKind, keys: &[String]) -> Result<usize, PersistenceError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let chains = self.chains_of(kind, keys).await?;
        let redis_keys: Vec<String> = keys.iter().map(|k| self.entry_key(kind, k)).collect();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(redis_keys)
            .ignore()
            .srem(self.keys_set(kind), keys)
            .ignore()
            .hdel(self.chain_index(kind), keys)
            .ignore();
        for (key, chain) in keys.iter().zip(chains) {
            if let Some(chain) = chain {
                pipe.srem(self.chain_set(kind, chain), key).ignore();
            }
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(keys.len())
    }
}

#[async_trait]
impl PersistentStore for RedisStore {
    async fn get(&self, kind: StoreKind, key: &str) -> Result<Option<CacheEntry>, PersistenceError> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = conn.get(self.entry_key(kind, key)).await?;
        bytes.map(|b| StoredEntry::decode(&b)).transpose()
    }

    /// Moves the key between chain sets when its tag changed.
    async fn put(&self, kind: StoreKind, entry: CacheEntry) -> Result<(), PersistenceError> {
        let bytes = StoredEntry::encode(&entry)?;
        let index = self.chain_index(kind);
        let mut conn = self.conn.clone();
        let previous: Option<u64> = conn.hget(&index, &entry.key).await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(self.entry_key(kind, &entry.key), bytes)
            .ignore()
            .sadd(self.keys_set(kind), &entry.key)
            .ignore();
        if let Some(old) = previous.filter(|old| Some(*old) != entry.chain_tag) {
            pipe.srem(self.chain_set(kind, old), &entry.key).ignore();
        }
        match entry.chain_tag {
            Some(chain) => {
                pipe.sadd(self.chain_set(kind, chain), &entry.key)
                    .ignore()
                    .hset(&index, &entry.key, chain)
                    .ignore();
            }
            None => {
                pipe.hdel(&index, &entry.key).ignore();
            }
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, kind: StoreKind, key: &str) -> Result<(), PersistenceError> {
        self.delete_keys(kind, &[key.to_string()]).await.map(|_| ())
    }

    async fn delete_by_chain(&self, kind: StoreKind, chain_tag: u64) -> Result<usize, PersistenceError> {
        let mut conn = self.conn.clone();
        let set = self.chain_set(kind, chain_tag);
        let members: Vec<String> = conn.smembers(&set).await?;
        // el hash manda: un miembro viejo del set puede tener otra cadena
        let chains = self.chains_of(kind, &members).await?;
        let keys: Vec<String> = members
            .into_iter()
            .zip(chains)
            .filter(|(_, chain)| *chain == Some(chain_tag))
            .map(|(key, _)| key)
            .collect();
        let removed = self.delete_keys(kind, &keys).await?;
        conn.del::<_, ()>(set).await?;
        Ok(removed)
    }

    async fn delete_older_than(&self, kind: StoreKind, cutoff_millis: i64) -> Result<usize, PersistenceError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.smembers(self.keys_set(kind)).await?;
        let mut expired = Vec::new();
        for key in keys {
            match self.get(kind, &key).await? {
                Some(entry) if entry.timestamp > cutoff_millis => {}
                _ => expired.push(key),
            }
        }
        self.delete_keys(kind, &expired).await
    }

    async fn clear(&self, kind: StoreKind) -> Result<(), PersistenceError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.smembers(self.keys_set(kind)).await?;
        let chains: BTreeSet<u64> = conn
            .hvals::<_, Vec<u64>>(self.chain_index(kind))
            .await?
            .into_iter()
            .collect();

        let mut doomed: Vec<String> = keys.iter().map(|k| self.entry_key(kind, k)).collect();
        doomed.extend(chains.into_iter().map(|chain| self.chain_set(kind, chain)));
        doomed.push(self.keys_set(kind));
        doomed.push(self.chain_index(kind));
        conn.del::<_, ()>(doomed).await?;
        Ok(())
    }

    async fn count(&self, kind: StoreKind) -> Result<usize, PersistenceError> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(self.keys_set(kind)).await?)
    }
}
