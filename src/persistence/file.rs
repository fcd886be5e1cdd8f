use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{CacheEntry, Partition, PersistentStore, StoredEntry};
use crate::cache_key::StoreKind;
use crate::errors::PersistenceError;

/// Log records below this count are never compacted.
const COMPACT_MIN_RECORDS: usize = 256;

/// One framed record of a store log: `u32` little-endian length, then bincode.
#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    Put(StoredEntry),
    Remove(String),
}

/// Decoded partition plus the number of records its log holds.
#[derive(Debug, Default)]
struct LoadedPartition {
    partition: Partition,
    records: usize,
}

/// Directory-backed store: `<dir>/<store-name>.bin`, one append-only log per
/// store kind.
///
/// A log is replayed on first touch and kept decoded in memory afterwards;
/// writes append one record each. The log is rewritten as a snapshot once
/// dead records outnumber live entries. A damaged tail (torn write, foreign
/// bytes) is dropped with a warning, keeping the readable prefix.
pub struct FileStore {
    dir: PathBuf,
    partitions: Mutex<HashMap<StoreKind, LoadedPartition>>,
}

fn frame(record: &LogRecord, out: &mut Vec<u8>) -> Result<(), PersistenceError> {
    let body = bincode::serialize(record)?;
    let len = u32::try_from(body.len())
        .map_err(|_| PersistenceError::Backend(format!("log record of {} bytes", body.len())))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

/// Next framed record at `offset`, or `None` when the bytes there are not one.
fn next_record(bytes: &[u8], offset: usize) -> Option<(LogRecord, usize)> {
    let header = bytes.get(offset..offset.checked_add(4)?)?;
    let mut len = [0u8; 4];
    len.copy_from_slice(header);
    let end = (offset + 4).checked_add(u32::from_le_bytes(len) as usize)?;
    let body = bytes.get(offset + 4..end)?;
    let record = bincode::deserialize(body).ok()?;
    Some((record, end))
}

impl FileStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            partitions: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, kind: StoreKind) -> PathBuf {
        self.dir.join(format!("{}.bin", kind.store_name()))
    }

    async fn load(&self, kind: StoreKind) -> Result<LoadedPartition, PersistenceError> {
        let path = self.path_for(kind);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LoadedPartition::default()),
            Err(e) => return Err(e.into()),
        };

        let mut loaded = LoadedPartition::default();
        let mut offset = 0;
        while offset < bytes.len() {
            let Some((record, end)) = next_record(&bytes, offset) else {
                break;
            };
            match record {
                LogRecord::Put(stored) => match stored.into_entry() {
                    Ok(entry) => loaded.partition.put(entry),
                    Err(e) => warn!("⚠️ Dropping unreadable entry in {}: {}", path.display(), e),
                },
                LogRecord::Remove(key) => {
                    loaded.partition.remove(&key);
                }
            }
            loaded.records += 1;
            offset = end;
        }

        if offset < bytes.len() {
            warn!(
                "⚠️ {} is damaged after {} records ({} bytes dropped), keeping {} entries",
                path.display(),
                loaded.records,
                bytes.len() - offset,
                loaded.partition.len()
            );
            self.compact(kind, &mut loaded).await?;
        }
        debug!("📂 Loaded {} entries from {}", loaded.partition.len(), path.display());
        Ok(loaded)
    }

    /// Rewrites the log as one `Put` per live entry.
    async fn compact(&self, kind: StoreKind, loaded: &mut LoadedPartition) -> Result<(), PersistenceError> {
        let mut bytes = Vec::new();
        for entry in loaded.partition.entries() {
            frame(&LogRecord::Put(StoredEntry::from_entry(entry)?), &mut bytes)?;
        }

        let path = self.path_for(kind);
        let tmp = path.with_extension("bin.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        loaded.records = loaded.partition.len();
        debug!("🗜️ Compacted {} to {} records", path.display(), loaded.records);
        Ok(())
    }

    async fn append(&self, kind: StoreKind, records: &[LogRecord]) -> Result<(), PersistenceError> {
        let mut bytes = Vec::new();
        for record in records {
            frame(record, &mut bytes)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(kind))
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }

    /// Appends the records, then compacts when the log has grown past twice
    /// the live entries.
    async fn commit(
        &self,
        kind: StoreKind,
        loaded: &mut LoadedPartition,
        records: &[LogRecord],
    ) -> Result<(), PersistenceError> {
        self.append(kind, records).await?;
        loaded.records += records.len();
        if loaded.records > COMPACT_MIN_RECORDS && loaded.records > 2 * loaded.partition.len() {
            self.compact(kind, loaded).await?;
        }
        Ok(())
    }

    /// Appends a `Remove` per key and drops them from the partition.
    async fn remove_keys(
        &self,
        kind: StoreKind,
        loaded: &mut LoadedPartition,
        keys: Vec<String>,
    ) -> Result<usize, PersistenceError> {
        if keys.is_empty() {
            return Ok(0);
        }
        for key in &keys {
            loaded.partition.remove(key);
        }
        let removed = keys.len();
        let records: Vec<LogRecord> = keys.into_iter().map(LogRecord::Remove).collect();
        self.commit(kind, loaded, &records).await?;
        Ok(removed)
    }
}

/// Loaded partition for `kind`, replaying its log on first touch.
async fn loaded<'a>(
    store: &FileStore,
    partitions: &'a mut HashMap<StoreKind, LoadedPartition>,
    kind: StoreKind,
) -> Result<&'a mut LoadedPartition, PersistenceError> {
    if !partitions.contains_key(&kind) {
        let partition = store.load(kind).await?;
        partitions.insert(kind, partition);
    }
    Ok(partitions.entry(kind).or_default())
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn get(&self, kind: StoreKind, key: &str) -> Result<Option<CacheEntry>, PersistenceError> {
        let mut partitions = self.partitions.lock().await;
        Ok(loaded(self, &mut partitions, kind).await?.partition.get(key))
    }

    async fn put(&self, kind: StoreKind, entry: CacheEntry) -> Result<(), PersistenceError> {
        let record = LogRecord::Put(StoredEntry::from_entry(&entry)?);
        let mut partitions = self.partitions.lock().await;
        let partition = loaded(self, &mut partitions, kind).await?;
        partition.partition.put(entry);
        self.commit(kind, partition, &[record]).await
    }

    async fn delete(&self, kind: StoreKind, key: &str) -> Result<(), PersistenceError> {
        let mut partitions = self.partitions.lock().await;
        let partition = loaded(self, &mut partitions, kind).await?;
        if partition.partition.get(key).is_some() {
            self.remove_keys(kind, partition, vec![key.to_string()]).await?;
        }
        Ok(())
    }

    async fn delete_by_chain(&self, kind: StoreKind, chain_tag: u64) -> Result<usize, PersistenceError> {
        let mut partitions = self.partitions.lock().await;
        let partition = loaded(self, &mut partitions, kind).await?;
        let keys = partition.partition.chain_keys(chain_tag);
        self.remove_keys(kind, partition, keys).await
    }

    async fn delete_older_than(&self, kind: StoreKind, cutoff_millis: i64) -> Result<usize, PersistenceError> {
        let mut partitions = self.partitions.lock().await;
        let partition = loaded(self, &mut partitions, kind).await?;
        let keys = partition.partition.expired_keys(cutoff_millis);
        self.remove_keys(kind, partition, keys).await
    }

    /// Truncates the log without reading it, so a damaged file is always
    /// recoverable through a clear.
    async fn clear(&self, kind: StoreKind) -> Result<(), PersistenceError> {
        let mut partitions = self.partitions.lock().await;
        tokio::fs::write(self.path_for(kind), b"").await?;
        partitions.insert(kind, LoadedPartition::default());
        Ok(())
    }

    async fn count(&self, kind: StoreKind) -> Result<usize, PersistenceError> {
        let mut partitions = self.partitions.lock().await;
        Ok(loaded(self, &mut partitions, kind).await?.partition.len())
    }
}
