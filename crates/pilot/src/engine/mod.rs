//! Storage engine collaborator
//!
//! The control plane never touches documents directly; it reads, copies and
//! deletes key ranges on data shards through [`StorageEngine`].

mod memory;

pub use memory::MemoryEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ds_core::{ChunkRange, KeyError, KeyPattern, ShardId};

use crate::error::ErrorKind;

/// Storage engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Shard {0} is unavailable")]
    ShardUnavailable(ShardId),
    #[error("Storage engine is read-only")]
    ReadOnly,
    #[error("Write to shard {shard} failed: {reason}")]
    WriteFailed { shard: ShardId, reason: String },
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::ShardUnavailable(_) | EngineError::WriteFailed { .. } => {
                ErrorKind::ShardUnavailable
            }
            EngineError::ReadOnly => ErrorKind::Internal,
            EngineError::Key(_) => ErrorKind::Validation,
        }
    }
}

/// Size of a key range on one shard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeEstimate {
    pub bytes: u64,
    pub documents: u64,
}

/// Data shard access used by splits, migrations and the router
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Documents of `ns` on `shard` whose shard key falls in `range`
    async fn read_range(
        &self,
        shard: &str,
        ns: &str,
        key_pattern: &KeyPattern,
        range: &ChunkRange,
    ) -> Result<Vec<Value>, EngineError>;

    async fn write_document(&self, shard: &str, ns: &str, doc: Value) -> Result<(), EngineError>;

    /// Write a batch; the destination acknowledges the whole batch or nothing
    async fn write_documents(
        &self,
        shard: &str,
        ns: &str,
        docs: Vec<Value>,
    ) -> Result<usize, EngineError>;

    /// Delete the documents in `range`. Returns how many were removed.
    async fn delete_range(
        &self,
        shard: &str,
        ns: &str,
        key_pattern: &KeyPattern,
        range: &ChunkRange,
    ) -> Result<usize, EngineError>;

    /// Documents matching every field of `filter` by equality
    async fn find_documents(
        &self,
        shard: &str,
        ns: &str,
        filter: &Value,
    ) -> Result<Vec<Value>, EngineError>;

    async fn estimate_size(
        &self,
        shard: &str,
        ns: &str,
        key_pattern: &KeyPattern,
        range: &ChunkRange,
    ) -> Result<SizeEstimate, EngineError>;

    /// Whether an index on `shard` supports `key_pattern` (it is a prefix of
    /// the index key)
    async fn has_index(
        &self,
        shard: &str,
        ns: &str,
        key_pattern: &KeyPattern,
    ) -> Result<bool, EngineError>;

    async fn create_index(
        &self,
        shard: &str,
        ns: &str,
        key_pattern: &KeyPattern,
        unique: bool,
    ) -> Result<(), EngineError>;

    async fn document_count(&self, shard: &str, ns: &str) -> Result<u64, EngineError>;

    async fn is_up(&self, shard: &str) -> bool;

    fn is_read_only(&self) -> bool;
}
