//! Split planner
//!
//! Every split, explicit or size triggered, ends in the same
//! `SplitChunk` commit, so the edge cases are identical for all modes: the
//! split point must lie strictly inside the chunk.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use ds_core::{Chunk, ChunkId, ChunkRange, KeyError, KeyPattern, ShardKey};

use crate::authority::{AuthorityError, ConfigAuthority};
use crate::config::SplitConfig;
use crate::engine::{EngineError, SizeEstimate, StorageEngine};
use crate::error::ErrorKind;
use crate::metadata::{MetadataChange, MetadataError};

/// Split errors
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    #[error("No valid split point in chunk {0}")]
    NoSplitPoint(ChunkId),
    #[error("Bounds {min} - {max} do not match a chunk of {ns}")]
    BoundsMismatch { ns: String, min: String, max: String },
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Authority(#[from] AuthorityError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl SplitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SplitError::NoSplitPoint(_) | SplitError::BoundsMismatch { .. } => {
                ErrorKind::Validation
            }
            SplitError::Metadata(e) => e.kind(),
            SplitError::Authority(e) => e.kind(),
            SplitError::Engine(e) => e.kind(),
        }
    }
}

impl From<KeyError> for SplitError {
    fn from(e: KeyError) -> Self {
        SplitError::Metadata(MetadataError::Key(e))
    }
}

/// How the caller chooses the split
#[derive(Debug, Clone)]
pub enum SplitRequest {
    /// Split at exactly this key
    Middle(Value),
    /// Split the chunk containing this document's key, at that key
    Find(Value),
    /// Split the chunk with exactly these bounds at its median
    Bounds(Value, Value),
}

/// The two halves of a committed split
#[derive(Debug, Clone, Serialize)]
pub struct SplitOutcome {
    pub left: Chunk,
    pub right: Chunk,
}

/// Median of `keys`, sampled down to `sample_size` first. Falls back to the
/// smallest key strictly inside `range` when the median sits on the lower
/// bound. `None` if no key qualifies.
pub fn median_split_point(
    mut keys: Vec<ShardKey>,
    sample_size: usize,
    range: &ChunkRange,
) -> Option<ShardKey> {
    if keys.len() > sample_size {
        let mut rng = rand::rng();
        let picked = rand::seq::index::sample(&mut rng, keys.len(), sample_size);
        keys = picked.into_iter().map(|i| keys[i].clone()).collect();
    }
    keys.sort();

    let median = keys.get(keys.len() / 2)?;
    if range.strictly_contains(median) {
        return Some(median.clone());
    }
    keys.into_iter().find(|k| range.strictly_contains(k))
}

/// Split planner
pub struct SplitPlanner {
    config: SplitConfig,
    authority: Arc<ConfigAuthority>,
    engine: Arc<dyn StorageEngine>,
}

impl SplitPlanner {
    pub fn new(
        config: SplitConfig,
        authority: Arc<ConfigAuthority>,
        engine: Arc<dyn StorageEngine>,
    ) -> Self {
        Self {
            config,
            authority,
            engine,
        }
    }

    /// Explicit split
    pub async fn split(&self, ns: &str, request: SplitRequest) -> Result<SplitOutcome, SplitError> {
        let map = self.authority.chunk_map(ns).await?;
        let pattern = &map.key_pattern;

        let (chunk, point) = match request {
            SplitRequest::Middle(bound) => {
                let point = pattern.parse_bound(&bound)?;
                let chunk = map.find_chunk(&point).map_err(MetadataError::from)?;
                (chunk.clone(), point)
            }
            SplitRequest::Find(query) => {
                let point = pattern.extract_key(&query)?;
                let chunk = map.find_chunk(&point).map_err(MetadataError::from)?;
                (chunk.clone(), point)
            }
            SplitRequest::Bounds(min, max) => {
                let range = ChunkRange::new(pattern.parse_bound(&min)?, pattern.parse_bound(&max)?);
                let chunk = map
                    .chunk_with_bounds(&range)
                    .cloned()
                    .ok_or_else(|| SplitError::BoundsMismatch {
                        ns: ns.to_string(),
                        min: range.min.to_string(),
                        max: range.max.to_string(),
                    })?;
                let point = self
                    .median_key(&chunk, pattern)
                    .await?
                    .ok_or_else(|| SplitError::NoSplitPoint(chunk.id.clone()))?;
                (chunk, point)
            }
        };

        self.apply(&chunk, point).await
    }

    /// Split every chunk whose estimated size or document count exceeds the
    /// configured limits. One split per chunk per pass.
    pub async fn auto_split_pass(&self) -> Result<Vec<SplitOutcome>, SplitError> {
        let state = self.authority.snapshot().await;
        let mut outcomes = Vec::new();

        for ns in state.chunks.namespaces() {
            let Some(map) = state.chunks.chunk_map(ns) else {
                continue;
            };
            for chunk in map.chunks() {
                let estimate = match self
                    .engine
                    .estimate_size(&chunk.shard, ns, &map.key_pattern, &chunk.range)
                    .await
                {
                    Ok(estimate) => estimate,
                    Err(e) => {
                        debug!("Skipping size check of {}: {}", chunk.id, e);
                        continue;
                    }
                };
                if !self.needs_split(&estimate) {
                    continue;
                }

                let Some(point) = self.median_key(chunk, &map.key_pattern).await? else {
                    debug!("Chunk {} is oversized but has no split point", chunk.id);
                    continue;
                };
                match self.apply(chunk, point).await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => warn!("Auto-split of {} failed: {}", chunk.id, e),
                }
            }
        }
        Ok(outcomes)
    }

    pub fn needs_split(&self, estimate: &SizeEstimate) -> bool {
        estimate.bytes > self.config.max_chunk_bytes
            || estimate.documents > self.config.max_chunk_documents
    }

    async fn median_key(
        &self,
        chunk: &Chunk,
        pattern: &KeyPattern,
    ) -> Result<Option<ShardKey>, SplitError> {
        let docs = self
            .engine
            .read_range(&chunk.shard, &chunk.ns, pattern, &chunk.range)
            .await?;
        let keys: Vec<ShardKey> = docs
            .iter()
            .filter_map(|doc| pattern.extract_key(doc).ok())
            .collect();
        Ok(median_split_point(
            keys,
            self.config.sample_size,
            &chunk.range,
        ))
    }

    async fn apply(&self, chunk: &Chunk, point: ShardKey) -> Result<SplitOutcome, SplitError> {
        self.authority
            .commit(MetadataChange::SplitChunk {
                ns: chunk.ns.clone(),
                chunk_id: chunk.id.clone(),
                split_point: point.clone(),
            })
            .await?;

        let map = self.authority.chunk_map(&chunk.ns).await?;
        let left = map
            .chunk_by_id(&chunk.id)
            .cloned()
            .ok_or_else(|| MetadataError::chunk_not_found(&chunk.ns, &chunk.id))?;
        let right = map.find_chunk(&point).map_err(MetadataError::from)?.clone();

        info!(
            "Split {} at {}: {} + {} ({})",
            chunk.id, point, left.range, right.range, right.version
        );
        Ok(SplitOutcome { left, right })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ds_core::KeyValue;

    fn key(i: i64) -> ShardKey {
        ShardKey::single(KeyValue::Int(i))
    }

    #[test]
    fn test_exact_median_for_small_chunks() {
        let range = ChunkRange::new(ShardKey::min(1), ShardKey::max(1));
        let keys = (0..11).rev().map(key).collect();
        assert_eq!(median_split_point(keys, 100, &range), Some(key(5)));
    }

    #[test]
    fn test_median_skips_lower_bound() {
        let range = ChunkRange::new(key(0), key(100));
        let keys = vec![key(0), key(0), key(0), key(0), key(7)];
        assert_eq!(median_split_point(keys, 100, &range), Some(key(7)));

        let keys = vec![key(0), key(0)];
        assert_eq!(median_split_point(keys, 100, &range), None);
        assert_eq!(median_split_point(Vec::new(), 100, &range), None);
    }

    #[test]
    fn test_sampled_median_is_inside_chunk() {
        let range = ChunkRange::new(key(0), key(10_000));
        let keys = (1..10_000).map(key).collect();
        let point = median_split_point(keys, 200, &range).unwrap();
        assert!(range.strictly_contains(&point));
        // a 200-key sample keeps the median well away from the edges
        assert!(point > key(2_000) && point < key(8_000));
    }
}
