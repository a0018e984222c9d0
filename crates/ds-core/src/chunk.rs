//! Chunk definitions
//!
//! A chunk is a contiguous `[min, max)` range of one collection's shard key
//! space, owned by exactly one shard.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::ShardKey;

/// Shard ID
pub type ShardId = String;

/// Chunk ID, derived from the namespace and the chunk's lower bound
pub type ChunkId = String;

/// Chunk version, monotonically increasing within a namespace
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ChunkVersion(pub u64);

impl ChunkVersion {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Key range [min, max)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    /// Lower bound (inclusive)
    pub min: ShardKey,
    /// Upper bound (exclusive)
    pub max: ShardKey,
}

impl ChunkRange {
    pub fn new(min: ShardKey, max: ShardKey) -> Self {
        Self { min, max }
    }

    /// Check if key is within range
    pub fn contains(&self, key: &ShardKey) -> bool {
        *key >= self.min && *key < self.max
    }

    /// Check if key lies strictly between the bounds, i.e. is a valid split point
    pub fn strictly_contains(&self, key: &ShardKey) -> bool {
        *key > self.min && *key < self.max
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// Chunk information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Chunk ID
    pub id: ChunkId,
    /// Owning namespace (`db.collection`)
    pub ns: String,
    /// Covered key range
    pub range: ChunkRange,
    /// Owning shard
    pub shard: ShardId,
    /// Version of the last change to this chunk
    pub version: ChunkVersion,
}

impl Chunk {
    pub fn new(ns: &str, range: ChunkRange, shard: ShardId, version: ChunkVersion) -> Self {
        Self {
            id: Self::make_id(ns, &range.min),
            ns: ns.to_string(),
            range,
            shard,
            version,
        }
    }

    pub fn make_id(ns: &str, min: &ShardKey) -> ChunkId {
        format!("{}-{}", ns, min)
    }

    pub fn min(&self) -> &ShardKey {
        &self.range.min
    }

    pub fn max(&self) -> &ShardKey {
        &self.range.max
    }

    pub fn contains(&self, key: &ShardKey) -> bool {
        self.range.contains(key)
    }
}

/// Namespace parse error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid namespace '{0}': expected <database>.<collection>")]
pub struct InvalidNamespace(pub String);

/// Collection namespace `db.collection`
///
/// Database names may contain arbitrary symbols except `.` and NUL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn parse(ns: &str) -> Result<Self, InvalidNamespace> {
        let (db, coll) = ns
            .split_once('.')
            .ok_or_else(|| InvalidNamespace(ns.to_string()))?;
        if !Self::is_valid_db_name(db) || coll.is_empty() || coll.contains('\0') {
            return Err(InvalidNamespace(ns.to_string()));
        }
        Ok(Self {
            db: db.to_string(),
            coll: coll.to_string(),
        })
    }

    pub fn is_valid_db_name(db: &str) -> bool {
        !db.is_empty() && !db.contains('.') && !db.contains('\0')
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}
