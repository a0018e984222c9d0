//! Chunk metadata store
//!
//! Owns every namespace's chunk layout. All mutations keep the chunks of a
//! namespace sorted, gap-free and non-overlapping over `[MinKey, MaxKey)`.

use std::collections::BTreeMap;

use ds_core::{
    Chunk, ChunkId, ChunkMap, ChunkRange, ChunkVersion, FieldKind, KeyPattern, KeyValue,
    RoutingError, ShardKey,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{MetadataError, ShardId};

/// Upper bound for `numInitialChunks`
pub const MAX_INITIAL_CHUNKS: usize = 8192;

/// Chunk layouts of all sharded namespaces
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadataStore {
    maps: BTreeMap<String, ChunkMap>,
}

impl ChunkMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the single `[MinKey, MaxKey)` chunk owned by `primary`
    pub fn initialize(
        &mut self,
        ns: &str,
        key_pattern: KeyPattern,
        primary: &ShardId,
    ) -> Result<Chunk, MetadataError> {
        if self.maps.contains_key(ns) {
            return Err(MetadataError::AlreadySharded(ns.to_string()));
        }
        let map = ChunkMap::single(ns, key_pattern, primary.clone());
        let chunk = map.chunks()[0].clone();
        self.maps.insert(ns.to_string(), map);
        debug!("Initialized {} with chunk {}", ns, chunk.range);
        Ok(chunk)
    }

    /// Create a namespace from a pre-split chunk list
    pub fn initialize_with_chunks(
        &mut self,
        ns: &str,
        key_pattern: KeyPattern,
        chunks: Vec<Chunk>,
    ) -> Result<(), MetadataError> {
        if self.maps.contains_key(ns) {
            return Err(MetadataError::AlreadySharded(ns.to_string()));
        }
        if let Some(foreign) = chunks.iter().find(|c| c.ns != ns) {
            return Err(MetadataError::InvalidOption(format!(
                "chunk {} belongs to {}",
                foreign.id, foreign.ns
            )));
        }
        for chunk in &chunks {
            key_pattern.validate(&chunk.range.min)?;
            key_pattern.validate(&chunk.range.max)?;
        }
        let map = ChunkMap::new(ns, key_pattern, chunks);
        map.check_invariants().map_err(MetadataError::Layout)?;
        debug!("Initialized {} with {} chunks", ns, map.len());
        self.maps.insert(ns.to_string(), map);
        Ok(())
    }

    /// Validate a split without applying it
    pub fn check_split(
        &self,
        ns: &str,
        chunk_id: &str,
        split_point: &ShardKey,
    ) -> Result<(), MetadataError> {
        let map = self.map(ns)?;
        map.key_pattern.validate(split_point)?;
        let chunk = map
            .chunk_by_id(chunk_id)
            .ok_or_else(|| MetadataError::chunk_not_found(ns, chunk_id))?;
        if !chunk.range.strictly_contains(split_point) {
            return Err(MetadataError::InvalidSplitPoint {
                ns: ns.to_string(),
                point: split_point.to_string(),
                reason: format!("not strictly inside {}", chunk.range),
            });
        }
        Ok(())
    }

    /// Replace a chunk with `[min, split_point)` and `[split_point, max)`.
    ///
    /// Both halves keep the owner and take the next collection version.
    pub fn apply_split(
        &mut self,
        ns: &str,
        chunk_id: &str,
        split_point: ShardKey,
    ) -> Result<(Chunk, Chunk), MetadataError> {
        self.check_split(ns, chunk_id, &split_point)?;
        let map = self.map_mut(ns)?;
        let idx = map
            .index_of(chunk_id)
            .map_err(|_| MetadataError::chunk_not_found(ns, chunk_id))?;
        let version = map.collection_version.next();
        let (left, right) = map
            .split_at(idx, split_point, version)
            .map_err(|e| split_error(ns, e))?;
        debug_assert_eq!(map.check_invariants(), Ok(()));
        debug!("Split {} into {} and {} at {}", chunk_id, left.range, right.range, version);
        Ok((left, right))
    }

    /// Validate a migration without applying it. The chunk must still be
    /// owned by `from` and cover exactly `range`.
    pub fn check_migration(
        &self,
        ns: &str,
        chunk_id: &str,
        range: &ChunkRange,
        from: &ShardId,
    ) -> Result<&Chunk, MetadataError> {
        let chunk = self.chunk(ns, chunk_id)?;
        if chunk.shard != *from {
            return Err(MetadataError::OwnershipMismatch {
                chunk: chunk_id.to_string(),
                expected: from.clone(),
                actual: chunk.shard.clone(),
            });
        }
        if chunk.range != *range {
            return Err(MetadataError::ChunkChanged {
                chunk: chunk_id.to_string(),
                expected: range.to_string(),
                actual: chunk.range.to_string(),
            });
        }
        Ok(chunk)
    }

    /// Transfer ownership of a chunk from `from` to `to`.
    ///
    /// Moving a chunk onto its current owner leaves it untouched.
    pub fn apply_migration(
        &mut self,
        ns: &str,
        chunk_id: &str,
        range: &ChunkRange,
        from: &ShardId,
        to: &ShardId,
    ) -> Result<Chunk, MetadataError> {
        let current = self.check_migration(ns, chunk_id, range, from)?.clone();
        if from == to {
            return Ok(current);
        }
        let map = self.map_mut(ns)?;
        let idx = map
            .index_of(chunk_id)
            .map_err(|_| MetadataError::chunk_not_found(ns, chunk_id))?;
        let version = map.collection_version.next();
        let chunk = map
            .set_owner(idx, to.clone(), version)
            .map_err(MetadataError::Layout)?;
        debug_assert_eq!(map.check_invariants(), Ok(()));
        debug!("Moved {} from {} to {} at {}", chunk_id, from, to, version);
        Ok(chunk)
    }

    /// Binary search for the chunk containing `key`
    pub fn find_chunk_containing(&self, ns: &str, key: &ShardKey) -> Result<&Chunk, MetadataError> {
        Ok(self.map(ns)?.find_chunk(key)?)
    }

    /// Chunks of `ns` ascending by `min`
    pub fn list_chunks(&self, ns: &str) -> Result<&[Chunk], MetadataError> {
        Ok(self.map(ns)?.chunks())
    }

    pub fn chunk(&self, ns: &str, chunk_id: &str) -> Result<&Chunk, MetadataError> {
        self.map(ns)?
            .chunk_by_id(chunk_id)
            .ok_or_else(|| MetadataError::chunk_not_found(ns, chunk_id))
    }

    pub fn chunk_map(&self, ns: &str) -> Option<&ChunkMap> {
        self.maps.get(ns)
    }

    pub fn contains(&self, ns: &str) -> bool {
        self.maps.contains_key(ns)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &String> {
        self.maps.keys()
    }

    pub fn chunk_ids(&self, ns: &str) -> Result<Vec<ChunkId>, MetadataError> {
        Ok(self.map(ns)?.chunk_ids())
    }

    fn map(&self, ns: &str) -> Result<&ChunkMap, MetadataError> {
        self.maps
            .get(ns)
            .ok_or_else(|| MetadataError::NotSharded(ns.to_string()))
    }

    fn map_mut(&mut self, ns: &str) -> Result<&mut ChunkMap, MetadataError> {
        self.maps
            .get_mut(ns)
            .ok_or_else(|| MetadataError::NotSharded(ns.to_string()))
    }
}

fn split_error(ns: &str, err: RoutingError) -> MetadataError {
    match err {
        RoutingError::SplitOutsideRange { point, range } => MetadataError::InvalidSplitPoint {
            ns: ns.to_string(),
            point,
            reason: format!("not strictly inside {}", range),
        },
        RoutingError::Key(e) => MetadataError::Key(e),
        other => MetadataError::Layout(other),
    }
}

/// Evenly pre-split the hashed key space into `count` chunks, assigned
/// round-robin over `shards`.
pub fn presplit_hashed(
    ns: &str,
    key_pattern: &KeyPattern,
    count: usize,
    shards: &[ShardId],
) -> Result<Vec<Chunk>, MetadataError> {
    let hashed_at = key_pattern
        .fields()
        .iter()
        .position(|f| f.kind == FieldKind::Hashed)
        .ok_or_else(|| {
            MetadataError::InvalidOption("numInitialChunks requires a hashed shard key".into())
        })?;
    if hashed_at != 0 {
        return Err(MetadataError::InvalidOption(
            "numInitialChunks requires the hashed field to lead the shard key".into(),
        ));
    }
    if count == 0 || count > MAX_INITIAL_CHUNKS {
        return Err(MetadataError::InvalidOption(format!(
            "numInitialChunks must be between 1 and {}, got {}",
            MAX_INITIAL_CHUNKS, count
        )));
    }
    if shards.is_empty() {
        return Err(MetadataError::NoShards);
    }

    let width = key_pattern.width();
    let step = (1i128 << 64) / count as i128;
    let mut bounds = Vec::with_capacity(count + 1);
    bounds.push(key_pattern.global_min());
    for k in 1..count {
        let hash = i64::MIN as i128 + step * k as i128;
        let mut values = vec![KeyValue::MinKey; width];
        values[0] = KeyValue::Int(hash as i64);
        bounds.push(ShardKey::new(values));
    }
    bounds.push(key_pattern.global_max());

    Ok(bounds
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            Chunk::new(
                ns,
                ChunkRange::new(pair[0].clone(), pair[1].clone()),
                shards[i % shards.len()].clone(),
                ChunkVersion(1),
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NS: &str = "testDB.foo";

    fn key(i: i64) -> ShardKey {
        ShardKey::single(KeyValue::Int(i))
    }

    fn store() -> ChunkMetadataStore {
        let mut store = ChunkMetadataStore::new();
        let pattern = KeyPattern::from_json(&json!({"a": 1})).unwrap();
        store
            .initialize(NS, pattern, &"shard0000".to_string())
            .unwrap();
        store
    }

    fn chunk_id_containing(store: &ChunkMetadataStore, k: i64) -> ChunkId {
        store.find_chunk_containing(NS, &key(k)).unwrap().id.clone()
    }

    #[test]
    fn test_initialize_once() {
        let mut store = store();
        let chunks = store.list_chunks(NS).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].range.min.is_global_min());
        assert!(chunks[0].range.max.is_global_max());
        assert_eq!(chunks[0].shard, "shard0000");

        let pattern = KeyPattern::from_json(&json!({"a": 1})).unwrap();
        let err = store
            .initialize(NS, pattern, &"shard0001".to_string())
            .unwrap_err();
        assert!(matches!(err, MetadataError::AlreadySharded(_)));
    }

    #[test]
    fn test_splits_keep_layout() {
        let mut store = store();
        let points = [500, -3, 1_000_000, 42, -1_000_000_000, 7];
        for (n, p) in points.iter().enumerate() {
            let id = chunk_id_containing(&store, *p);
            let before = store.chunk(NS, &id).unwrap().clone();
            let (left, right) = store.apply_split(NS, &id, key(*p)).unwrap();

            assert_eq!(left.range.min, before.range.min);
            assert_eq!(left.range.max, key(*p));
            assert_eq!(right.range.min, key(*p));
            assert_eq!(right.range.max, before.range.max);
            assert_eq!(left.shard, before.shard);
            assert!(left.version > before.version);
            assert_eq!(store.list_chunks(NS).unwrap().len(), n + 2);
        }

        let chunks = store.list_chunks(NS).unwrap();
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].range.max, pair[1].range.min);
            assert!(pair[0].range.min < pair[1].range.min);
        }
    }

    #[test]
    fn test_split_at_boundary_rejected() {
        let mut store = store();
        let id = chunk_id_containing(&store, 500);
        store.apply_split(NS, &id, key(500)).unwrap();
        let before = store.clone();

        let id = chunk_id_containing(&store, 500);
        let err = store.apply_split(NS, &id, key(500)).unwrap_err();
        assert!(matches!(err, MetadataError::InvalidSplitPoint { .. }));
        assert_eq!(store, before);

        // split point outside the named chunk
        let id = chunk_id_containing(&store, 0);
        let err = store.apply_split(NS, &id, key(600)).unwrap_err();
        assert!(matches!(err, MetadataError::InvalidSplitPoint { .. }));
        assert_eq!(store, before);
    }

    #[test]
    fn test_migration() {
        let mut store = store();
        let id = chunk_id_containing(&store, 500);
        store.apply_split(NS, &id, key(500)).unwrap();

        let id = chunk_id_containing(&store, 500);
        let chunk = store.chunk(NS, &id).unwrap().clone();
        let moved = store
            .apply_migration(NS, &id, &chunk.range, &"shard0000".into(), &"shard0001".into())
            .unwrap();
        assert_eq!(moved.shard, "shard0001");
        assert!(moved.version > chunk.version);
        assert_eq!(store.find_chunk_containing(NS, &key(10_000)).unwrap().shard, "shard0001");
        assert_eq!(store.find_chunk_containing(NS, &key(499)).unwrap().shard, "shard0000");

        // stale source
        let err = store
            .apply_migration(NS, &id, &chunk.range, &"shard0000".into(), &"shard0002".into())
            .unwrap_err();
        assert!(matches!(err, MetadataError::OwnershipMismatch { .. }));

        // onto the current owner
        let same = store
            .apply_migration(NS, &id, &chunk.range, &"shard0001".into(), &"shard0001".into())
            .unwrap();
        assert_eq!(same.version, moved.version);
    }

    #[test]
    fn test_migration_of_split_chunk_rejected() {
        let mut store = store();
        let id = chunk_id_containing(&store, 0);
        let copied = store.chunk(NS, &id).unwrap().range.clone();

        // the left half keeps the id but no longer covers the copied range
        store.apply_split(NS, &id, key(500)).unwrap();
        assert_eq!(chunk_id_containing(&store, 0), id);
        let before = store.clone();

        let err = store
            .apply_migration(NS, &id, &copied, &"shard0000".into(), &"shard0001".into())
            .unwrap_err();
        assert!(matches!(err, MetadataError::ChunkChanged { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::StaleMetadata);
        assert_eq!(store, before);
    }

    #[test]
    fn test_unknown_namespace() {
        let store = store();
        assert!(matches!(
            store.list_chunks("testDB.bar"),
            Err(MetadataError::NotSharded(_))
        ));
    }

    #[test]
    fn test_presplit_hashed_round_robin() {
        let pattern = KeyPattern::from_json(&json!({"a": "hashed"})).unwrap();
        let shards = vec!["shard0000".to_string(), "shard0001".to_string()];
        let chunks = presplit_hashed(NS, &pattern, 4, &shards).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[1].range.min, key(i64::MIN / 2));
        assert_eq!(chunks[2].range.min, key(0));
        assert_eq!(chunks[3].range.min, key(i64::MAX / 2 + 1));
        let owners: Vec<_> = chunks.iter().map(|c| c.shard.as_str()).collect();
        assert_eq!(owners, vec!["shard0000", "shard0001", "shard0000", "shard0001"]);

        let mut store = ChunkMetadataStore::new();
        store.initialize_with_chunks(NS, pattern, chunks).unwrap();
        assert_eq!(store.list_chunks(NS).unwrap().len(), 4);

        let ascending = KeyPattern::from_json(&json!({"a": 1})).unwrap();
        assert!(presplit_hashed(NS, &ascending, 4, &shards).is_err());
    }
}
