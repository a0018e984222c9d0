//! In-process routing
//!
//! Lets a [`RangeRouter`](ds_router::RangeRouter) run against the local
//! config authority and storage engine. The executor plays the data shard
//! side: it checks the chunk version carried by every request against the
//! committed metadata before touching documents, and refuses writes into a
//! chunk that is being migrated.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use ds_core::ChunkMap;
use ds_router::{MetadataSource, RouterError, ShardError, ShardExecutor, ShardOp, ShardRequest};

use crate::authority::ConfigAuthority;
use crate::engine::{EngineError, StorageEngine};
use crate::scheduler::MigrationCoordinator;

#[async_trait]
impl MetadataSource for ConfigAuthority {
    async fn fetch_chunk_map(&self, ns: &str) -> Result<ChunkMap, RouterError> {
        self.chunk_map(ns)
            .await
            .map_err(|e| RouterError::Source(e.to_string()))
    }
}

/// Shard-side request handling backed by a [`StorageEngine`]
pub struct LocalShardExecutor {
    authority: Arc<ConfigAuthority>,
    migrations: Arc<MigrationCoordinator>,
    engine: Arc<dyn StorageEngine>,
}

impl LocalShardExecutor {
    pub fn new(
        authority: Arc<ConfigAuthority>,
        migrations: Arc<MigrationCoordinator>,
        engine: Arc<dyn StorageEngine>,
    ) -> Self {
        Self {
            authority,
            migrations,
            engine,
        }
    }
}

fn shard_error(shard: &str, e: EngineError) -> ShardError {
    match e {
        EngineError::ShardUnavailable(_) => ShardError::Unavailable(shard.to_string()),
        other => ShardError::Failed {
            shard: shard.to_string(),
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl ShardExecutor for LocalShardExecutor {
    async fn execute(&self, shard: &str, request: ShardRequest) -> Result<Value, ShardError> {
        let failed = |reason: String| ShardError::Failed {
            shard: shard.to_string(),
            reason,
        };
        let _permit = match request.op {
            ShardOp::Insert(_) => Some(self.migrations.write_permit().await),
            ShardOp::Find(_) => None,
        };

        let map = self
            .authority
            .chunk_map(&request.ns)
            .await
            .map_err(|e| failed(e.to_string()))?;
        let chunk = map
            .find_chunk(&request.key)
            .map_err(|e| failed(e.to_string()))?;

        // the chunk moved or changed since the router cached it
        let migrating = matches!(request.op, ShardOp::Insert(_))
            && self.migrations.is_locked(&request.ns, &chunk.id);
        if chunk.shard != shard || chunk.version != request.version || migrating {
            let actual = map.shard_version(shard).unwrap_or_default();
            debug!(
                "Rejecting {} request for {} on {}: {} vs {}",
                request.ns, request.key, shard, request.version, actual
            );
            return Err(ShardError::StaleVersion {
                shard: shard.to_string(),
                ns: request.ns,
                expected: request.version,
                actual,
            });
        }

        match request.op {
            ShardOp::Insert(doc) => {
                self.engine
                    .write_document(shard, &request.ns, doc)
                    .await
                    .map_err(|e| shard_error(shard, e))?;
                Ok(json!({ "inserted": 1, "shard": shard }))
            }
            ShardOp::Find(query) => {
                let docs = self
                    .engine
                    .find_documents(shard, &request.ns, &query)
                    .await
                    .map_err(|e| shard_error(shard, e))?;
                Ok(Value::Array(docs))
            }
        }
    }
}
