//! Per-namespace chunk map
//!
//! Holds one collection's chunks sorted by lower bound and provides
//! O(log n) key -> chunk lookup. The same structure is the authoritative
//! layout inside the config server and the cached copy inside routers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunk::{Chunk, ChunkId, ChunkRange, ChunkVersion, ShardId};
use crate::key::{KeyError, KeyPattern, ShardKey};

/// Chunk map errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),
    #[error("No chunk covers key {0}")]
    KeyNotCovered(String),
    #[error("Split point {point} is not strictly inside chunk {range}")]
    SplitOutsideRange { point: String, range: String },
    #[error("Chunk layout broken: {0}")]
    Invariant(String),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Ordered, gap-free chunk layout of a single collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMap {
    /// Namespace (`db.collection`)
    pub ns: String,
    /// Shard key pattern of the collection
    pub key_pattern: KeyPattern,
    /// Highest chunk version in the collection
    pub collection_version: ChunkVersion,
    /// Chunks sorted by `min`
    chunks: Vec<Chunk>,
}

impl ChunkMap {
    /// Create a map from an arbitrary chunk list (sorted here)
    pub fn new(ns: &str, key_pattern: KeyPattern, mut chunks: Vec<Chunk>) -> Self {
        chunks.sort_by(|a, b| a.range.min.cmp(&b.range.min));
        let collection_version = chunks
            .iter()
            .map(|c| c.version)
            .max()
            .unwrap_or_default();
        Self {
            ns: ns.to_string(),
            key_pattern,
            collection_version,
            chunks,
        }
    }

    /// Single chunk covering the whole key space
    pub fn single(ns: &str, key_pattern: KeyPattern, owner: ShardId) -> Self {
        let range = ChunkRange::new(key_pattern.global_min(), key_pattern.global_max());
        let chunk = Chunk::new(ns, range, owner, ChunkVersion(1));
        Self::new(ns, key_pattern, vec![chunk])
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Index of the chunk containing `key`, using binary search.
    pub fn find_index(&self, key: &ShardKey) -> Result<usize, RoutingError> {
        self.key_pattern.validate(key)?;

        // rightmost chunk whose min <= key
        let idx = self.chunks.partition_point(|c| c.range.min <= *key);
        if idx > 0 && self.chunks[idx - 1].contains(key) {
            return Ok(idx - 1);
        }
        Err(RoutingError::KeyNotCovered(key.to_string()))
    }

    /// Find the chunk containing `key`
    pub fn find_chunk(&self, key: &ShardKey) -> Result<&Chunk, RoutingError> {
        self.find_index(key).map(|idx| &self.chunks[idx])
    }

    pub fn index_of(&self, chunk_id: &str) -> Result<usize, RoutingError> {
        self.chunks
            .iter()
            .position(|c| c.id == chunk_id)
            .ok_or_else(|| RoutingError::ChunkNotFound(chunk_id.to_string()))
    }

    pub fn chunk_by_id(&self, chunk_id: &str) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.id == chunk_id)
    }

    /// Chunk whose bounds are exactly `range`
    pub fn chunk_with_bounds(&self, range: &ChunkRange) -> Option<&Chunk> {
        self.find_chunk(&range.min)
            .ok()
            .filter(|c| c.range == *range)
    }

    /// Split the chunk at `idx` into `[min, point)` and `[point, max)`.
    ///
    /// Both halves keep the owner and get `version`.
    pub fn split_at(
        &mut self,
        idx: usize,
        point: ShardKey,
        version: ChunkVersion,
    ) -> Result<(Chunk, Chunk), RoutingError> {
        self.key_pattern.validate(&point)?;
        let chunk = self
            .chunks
            .get(idx)
            .ok_or_else(|| RoutingError::ChunkNotFound(format!("index {}", idx)))?;
        if !chunk.range.strictly_contains(&point) {
            return Err(RoutingError::SplitOutsideRange {
                point: point.to_string(),
                range: chunk.range.to_string(),
            });
        }

        let left = Chunk::new(
            &self.ns,
            ChunkRange::new(chunk.range.min.clone(), point.clone()),
            chunk.shard.clone(),
            version,
        );
        let right = Chunk::new(
            &self.ns,
            ChunkRange::new(point, chunk.range.max.clone()),
            chunk.shard.clone(),
            version,
        );

        self.chunks[idx] = left.clone();
        self.chunks.insert(idx + 1, right.clone());
        self.collection_version = self.collection_version.max(version);
        Ok((left, right))
    }

    /// Reassign the chunk at `idx` to `shard` with `version`
    pub fn set_owner(
        &mut self,
        idx: usize,
        shard: ShardId,
        version: ChunkVersion,
    ) -> Result<Chunk, RoutingError> {
        let chunk = self
            .chunks
            .get_mut(idx)
            .ok_or_else(|| RoutingError::ChunkNotFound(format!("index {}", idx)))?;
        chunk.shard = shard;
        chunk.version = version;
        let updated = chunk.clone();
        self.collection_version = self.collection_version.max(version);
        Ok(updated)
    }

    /// Verify the chunks exactly partition `[MinKey, MaxKey)`
    pub fn check_invariants(&self) -> Result<(), RoutingError> {
        let first = self
            .chunks
            .first()
            .ok_or_else(|| RoutingError::Invariant(format!("{} has no chunks", self.ns)))?;
        if first.range.min != self.key_pattern.global_min() {
            return Err(RoutingError::Invariant(format!(
                "first chunk starts at {} instead of MinKey",
                first.range.min
            )));
        }
        if let Some(last) = self.chunks.last() {
            if last.range.max != self.key_pattern.global_max() {
                return Err(RoutingError::Invariant(format!(
                    "last chunk ends at {} instead of MaxKey",
                    last.range.max
                )));
            }
        }
        for chunk in &self.chunks {
            if chunk.range.min >= chunk.range.max {
                return Err(RoutingError::Invariant(format!(
                    "chunk {} has empty range {}",
                    chunk.id, chunk.range
                )));
            }
            if chunk.version > self.collection_version {
                return Err(RoutingError::Invariant(format!(
                    "chunk {} version {} above collection version {}",
                    chunk.id, chunk.version, self.collection_version
                )));
            }
        }
        for pair in self.chunks.windows(2) {
            if pair[0].range.max != pair[1].range.min {
                let kind = if pair[0].range.max < pair[1].range.min {
                    "gap"
                } else {
                    "overlap"
                };
                return Err(RoutingError::Invariant(format!(
                    "{} between {} and {}",
                    kind, pair[0].range, pair[1].range
                )));
            }
        }
        Ok(())
    }

    /// Chunk count per shard; every shard in `shards` appears, even with 0
    pub fn chunk_counts<'a>(
        &self,
        shards: impl IntoIterator<Item = &'a ShardId>,
    ) -> BTreeMap<ShardId, usize> {
        let mut counts: BTreeMap<ShardId, usize> =
            shards.into_iter().map(|s| (s.clone(), 0)).collect();
        for chunk in &self.chunks {
            *counts.entry(chunk.shard.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn chunks_on<'a>(&'a self, shard: &'a str) -> impl Iterator<Item = &'a Chunk> + 'a {
        self.chunks.iter().filter(move |c| c.shard == shard)
    }

    /// Highest version among the chunks owned by `shard`
    pub fn shard_version(&self, shard: &str) -> Option<ChunkVersion> {
        self.chunks_on(shard).map(|c| c.version).max()
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.chunks.iter().map(|c| c.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyValue;
    use serde_json::json;

    fn key(i: i64) -> ShardKey {
        ShardKey::single(KeyValue::Int(i))
    }

    fn map() -> ChunkMap {
        let pattern = KeyPattern::from_json(&json!({"a": 1})).unwrap();
        ChunkMap::single("testDB.foo", pattern, "shard0000".to_string())
    }

    #[test]
    fn test_single_chunk_covers_everything() {
        let map = map();
        assert_eq!(map.len(), 1);
        map.check_invariants().unwrap();
        assert_eq!(map.find_chunk(&key(i64::MIN)).unwrap().shard, "shard0000");
        assert_eq!(
            map.find_chunk(&ShardKey::single(KeyValue::String("zzz".into())))
                .unwrap()
                .shard,
            "shard0000"
        );
    }

    #[test]
    fn test_split_and_binary_search() {
        let mut map = map();
        for (i, point) in [500, -100, 1000, 0].into_iter().enumerate() {
            let idx = map.find_index(&key(point)).unwrap();
            map.split_at(idx, key(point), ChunkVersion(i as u64 + 2)).unwrap();
            map.check_invariants().unwrap();
        }
        assert_eq!(map.len(), 5);
        assert_eq!(map.collection_version, ChunkVersion(5));

        assert_eq!(map.find_chunk(&key(-101)).unwrap().range.max, key(-100));
        assert_eq!(map.find_chunk(&key(-100)).unwrap().range.min, key(-100));
        assert_eq!(map.find_chunk(&key(499)).unwrap().range.min, key(0));
        assert_eq!(map.find_chunk(&key(500)).unwrap().range.max, key(1000));
        assert_eq!(map.find_chunk(&key(2000)).unwrap().range.min, key(1000));
    }

    #[test]
    fn test_split_rejects_boundary() {
        let mut map = map();
        map.split_at(0, key(500), ChunkVersion(2)).unwrap();
        let idx = map.find_index(&key(500)).unwrap();
        let err = map.split_at(idx, key(500), ChunkVersion(3)).unwrap_err();
        assert!(matches!(err, RoutingError::SplitOutsideRange { .. }));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_wrong_width_key() {
        let map = map();
        let wide = ShardKey::new(vec![KeyValue::Int(1), KeyValue::Int(2)]);
        assert!(matches!(
            map.find_chunk(&wide),
            Err(RoutingError::Key(KeyError::Incomparable { .. }))
        ));
    }

    #[test]
    fn test_invariant_detects_gap() {
        let pattern = KeyPattern::from_json(&json!({"a": 1})).unwrap();
        let chunks = vec![
            Chunk::new(
                "db.c",
                ChunkRange::new(ShardKey::min(1), key(0)),
                "s0".into(),
                ChunkVersion(1),
            ),
            Chunk::new(
                "db.c",
                ChunkRange::new(key(10), ShardKey::max(1)),
                "s0".into(),
                ChunkVersion(1),
            ),
        ];
        let map = ChunkMap::new("db.c", pattern, chunks);
        let err = map.check_invariants().unwrap_err();
        assert!(err.to_string().contains("gap"));
    }

    #[test]
    fn test_chunk_counts_include_empty_shards() {
        let mut map = map();
        map.split_at(0, key(0), ChunkVersion(2)).unwrap();
        map.set_owner(1, "shard0001".into(), ChunkVersion(3)).unwrap();
        let shards = vec!["shard0000".to_string(), "shard0001".into(), "shard0002".into()];
        let counts = map.chunk_counts(&shards);
        assert_eq!(counts["shard0000"], 1);
        assert_eq!(counts["shard0001"], 1);
        assert_eq!(counts["shard0002"], 0);
        assert_eq!(map.shard_version("shard0001"), Some(ChunkVersion(3)));
        assert_eq!(map.shard_version("shard0002"), None);
    }
}
