//! Replicated metadata commands

use chrono::{DateTime, Utc};
use ds_core::{Chunk, ChunkId, ChunkRange, KeyPattern, ShardKey};
use serde::{Deserialize, Serialize};

use super::{ShardId, ShardState};

/// Lock key for changes that do not belong to a namespace
pub const CLUSTER_LOCK_KEY: &str = "$cluster";

/// A single mutation of the cluster metadata.
///
/// Changes carry every input they need (including timestamps) so replaying
/// the log on any replica yields the same state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetadataChange {
    AddShard {
        id: ShardId,
        host: String,
        at: DateTime<Utc>,
    },
    SetShardState {
        id: ShardId,
        state: ShardState,
    },
    EnableSharding {
        db: String,
        primary: ShardId,
    },
    ShardCollection {
        ns: String,
        key_pattern: KeyPattern,
        unique: bool,
        /// Pre-split layout; empty means a single chunk on the primary shard
        initial_chunks: Vec<Chunk>,
    },
    SplitChunk {
        ns: String,
        chunk_id: ChunkId,
        split_point: ShardKey,
    },
    MigrateChunk {
        ns: String,
        chunk_id: ChunkId,
        /// Range the documents were copied for
        range: ChunkRange,
        from: ShardId,
        to: ShardId,
    },
    SetBalancerEnabled {
        enabled: bool,
        at: DateTime<Utc>,
    },
    RecordBeaconRegistration {
        at: DateTime<Utc>,
    },
}

impl MetadataChange {
    /// Changes with the same key are serialized against each other
    pub fn lock_key(&self) -> &str {
        match self {
            MetadataChange::ShardCollection { ns, .. }
            | MetadataChange::SplitChunk { ns, .. }
            | MetadataChange::MigrateChunk { ns, .. } => ns,
            _ => CLUSTER_LOCK_KEY,
        }
    }

    /// Short operation name for logs
    pub fn op_name(&self) -> &'static str {
        match self {
            MetadataChange::AddShard { .. } => "add_shard",
            MetadataChange::SetShardState { .. } => "set_shard_state",
            MetadataChange::EnableSharding { .. } => "enable_sharding",
            MetadataChange::ShardCollection { .. } => "shard_collection",
            MetadataChange::SplitChunk { .. } => "split_chunk",
            MetadataChange::MigrateChunk { .. } => "migrate_chunk",
            MetadataChange::SetBalancerEnabled { .. } => "set_balancer_enabled",
            MetadataChange::RecordBeaconRegistration { .. } => "record_beacon_registration",
        }
    }
}
