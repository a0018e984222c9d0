//! Database and collection catalog

use ds_core::KeyPattern;
use serde::{Deserialize, Serialize};

use super::ShardId;

/// Database entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Database name
    pub name: String,
    /// Shard holding the unsharded collections of this database
    pub primary: ShardId,
    /// Whether `enableSharding` has been run
    pub partitioned: bool,
}

/// Sharded collection entry. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    /// Namespace (`db.collection`)
    pub ns: String,
    /// Shard key pattern
    pub key_pattern: KeyPattern,
    /// Whether the shard key is enforced unique
    pub unique: bool,
}
