//! In-memory storage engine

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};

use ds_core::{ChunkRange, KeyPattern, ShardId};

use super::{EngineError, SizeEstimate, StorageEngine};

#[derive(Debug, Clone)]
struct IndexSpec {
    key: KeyPattern,
    unique: bool,
}

#[derive(Debug, Default)]
struct Collection {
    docs: Vec<Value>,
    indexes: Vec<IndexSpec>,
}

#[derive(Debug)]
struct ShardStore {
    up: bool,
    collections: HashMap<String, Collection>,
}

impl Default for ShardStore {
    fn default() -> Self {
        Self {
            up: true,
            collections: HashMap::new(),
        }
    }
}

/// Documents outside the range, or without a usable shard key, are not part
/// of any chunk and are never moved.
fn in_range(key_pattern: &KeyPattern, range: &ChunkRange, doc: &Value) -> bool {
    key_pattern
        .extract_key(doc)
        .map(|key| range.contains(&key))
        .unwrap_or(false)
}

fn matches_filter(doc: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields.iter().all(|(name, expected)| {
            doc.pointer(&format!("/{}", name.replace('.', "/"))) == Some(expected)
        }),
        None => false,
    }
}

/// Shards kept in process memory. Shards are created on first use.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    shards: RwLock<HashMap<ShardId, ShardStore>>,
    read_only: AtomicBool,
    /// Shards whose next write fails
    failing_writes: Mutex<HashSet<ShardId>>,
    write_delay_ms: AtomicU64,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_shard(&self, shard: &str) {
        self.shards.write().entry(shard.to_string()).or_default().up = false;
        info!("Shard {} stopped", shard);
    }

    pub fn start_shard(&self, shard: &str) {
        self.shards.write().entry(shard.to_string()).or_default().up = true;
        info!("Shard {} started", shard);
    }

    /// Fail the next write to `shard`
    pub fn fail_next_write(&self, shard: &str) {
        self.failing_writes.lock().insert(shard.to_string());
    }

    /// Delay applied before every write batch
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    async fn before_write(&self, shard: &str) -> Result<(), EngineError> {
        if self.is_read_only() {
            return Err(EngineError::ReadOnly);
        }
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing_writes.lock().remove(shard) {
            return Err(EngineError::WriteFailed {
                shard: shard.to_string(),
                reason: "injected write failure".into(),
            });
        }
        Ok(())
    }

    fn read<T>(
        &self,
        shard: &str,
        ns: &str,
        f: impl FnOnce(Option<&Collection>) -> T,
    ) -> Result<T, EngineError> {
        let shards = self.shards.read();
        match shards.get(shard) {
            Some(store) if !store.up => Err(EngineError::ShardUnavailable(shard.to_string())),
            Some(store) => Ok(f(store.collections.get(ns))),
            None => Ok(f(None)),
        }
    }

    fn write<T>(
        &self,
        shard: &str,
        ns: &str,
        f: impl FnOnce(&mut Collection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut shards = self.shards.write();
        let store = shards.entry(shard.to_string()).or_default();
        if !store.up {
            return Err(EngineError::ShardUnavailable(shard.to_string()));
        }
        f(store.collections.entry(ns.to_string()).or_default())
    }
}

fn check_unique(shard: &str, collection: &Collection, doc: &Value) -> Result<(), EngineError> {
    for index in collection.indexes.iter().filter(|i| i.unique) {
        let Ok(key) = index.key.extract_key(doc) else {
            continue;
        };
        let duplicate = collection
            .docs
            .iter()
            .any(|d| index.key.extract_key(d).map(|k| k == key).unwrap_or(false));
        if duplicate {
            return Err(EngineError::WriteFailed {
                shard: shard.to_string(),
                reason: format!("duplicate key {} for unique index {}", key, index.key),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    async fn read_range(
        &self,
        shard: &str,
        ns: &str,
        key_pattern: &KeyPattern,
        range: &ChunkRange,
    ) -> Result<Vec<Value>, EngineError> {
        self.read(
            shard,
            ns,
            |coll| {
                coll.map(|c| {
                    c.docs
                        .iter()
                        .filter(|d| in_range(key_pattern, range, d))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
            },
        )
    }

    async fn write_document(&self, shard: &str, ns: &str, doc: Value) -> Result<(), EngineError> {
        self.before_write(shard).await?;
        self.write(shard, ns, |coll| {
            check_unique(shard, coll, &doc)?;
            coll.docs.push(doc);
            Ok(())
        })
    }

    async fn write_documents(
        &self,
        shard: &str,
        ns: &str,
        docs: Vec<Value>,
    ) -> Result<usize, EngineError> {
        self.before_write(shard).await?;
        let count = docs.len();
        self.write(shard, ns, |coll| {
            coll.docs.extend(docs);
            Ok(())
        })?;
        debug!("Wrote {} documents to {} on {}", count, ns, shard);
        Ok(count)
    }

    async fn delete_range(
        &self,
        shard: &str,
        ns: &str,
        key_pattern: &KeyPattern,
        range: &ChunkRange,
    ) -> Result<usize, EngineError> {
        if self.is_read_only() {
            return Err(EngineError::ReadOnly);
        }
        let removed = self.write(shard, ns, |coll| {
            let before = coll.docs.len();
            coll.docs.retain(|d| !in_range(key_pattern, range, d));
            Ok(before - coll.docs.len())
        })?;
        debug!("Deleted {} documents of {} {} on {}", removed, ns, range, shard);
        Ok(removed)
    }

    async fn find_documents(
        &self,
        shard: &str,
        ns: &str,
        filter: &Value,
    ) -> Result<Vec<Value>, EngineError> {
        self.read(
            shard,
            ns,
            |coll| {
                coll.map(|c| {
                    c.docs
                        .iter()
                        .filter(|d| matches_filter(d, filter))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
            },
        )
    }

    async fn estimate_size(
        &self,
        shard: &str,
        ns: &str,
        key_pattern: &KeyPattern,
        range: &ChunkRange,
    ) -> Result<SizeEstimate, EngineError> {
        self.read(
            shard,
            ns,
            |coll| {
                let mut estimate = SizeEstimate::default();
                for doc in coll
                    .into_iter()
                    .flat_map(|c| c.docs.iter())
                    .filter(|d| in_range(key_pattern, range, d))
                {
                    estimate.documents += 1;
                    estimate.bytes += serde_json::to_vec(doc).map(|b| b.len()).unwrap_or(0) as u64;
                }
                estimate
            },
        )
    }

    async fn has_index(
        &self,
        shard: &str,
        ns: &str,
        key_pattern: &KeyPattern,
    ) -> Result<bool, EngineError> {
        self.read(
            shard,
            ns,
            |coll| {
                coll.map(|c| {
                    c.indexes
                        .iter()
                        .any(|i| i.key.fields().starts_with(key_pattern.fields()))
                })
                .unwrap_or(false)
            },
        )
    }

    async fn create_index(
        &self,
        shard: &str,
        ns: &str,
        key_pattern: &KeyPattern,
        unique: bool,
    ) -> Result<(), EngineError> {
        if self.is_read_only() {
            return Err(EngineError::ReadOnly);
        }
        self.write(shard, ns, |coll| {
            if !coll.indexes.iter().any(|i| i.key == *key_pattern) {
                coll.indexes.push(IndexSpec {
                    key: key_pattern.clone(),
                    unique,
                });
            }
            Ok(())
        })?;
        info!("Created index {} on {} ({})", key_pattern, ns, shard);
        Ok(())
    }

    async fn document_count(&self, shard: &str, ns: &str) -> Result<u64, EngineError> {
        self.read(shard, ns, |coll| coll.map(|c| c.docs.len() as u64).unwrap_or(0))
    }

    async fn is_up(&self, shard: &str) -> bool {
        self.shards.read().get(shard).map(|s| s.up).unwrap_or(true)
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }
}
