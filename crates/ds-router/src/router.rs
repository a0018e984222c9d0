//! Range router

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use ds_core::{ChunkId, ChunkMap, ChunkVersion, KeyError, RoutingError, ShardId, ShardKey};

/// Errors reported by a data shard
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShardError {
    #[error("Shard {shard} is at {actual} for {ns}, request carried {expected}")]
    StaleVersion {
        shard: ShardId,
        ns: String,
        expected: ChunkVersion,
        actual: ChunkVersion,
    },
    #[error("Shard {0} is unavailable")]
    Unavailable(ShardId),
    #[error("Shard {shard} rejected the request: {reason}")]
    Failed { shard: ShardId, reason: String },
}

/// Router errors
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Routing metadata for {ns} still stale after {attempts} attempts")]
    StaleMetadata { ns: String, attempts: usize },
    #[error("Metadata source error: {0}")]
    Source(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Shard(ShardError),
}

impl RouterError {
    /// Whether the operation may succeed if simply retried
    pub fn is_retryable(&self) -> bool {
        match self {
            RouterError::StaleMetadata { .. } | RouterError::Http(_) => true,
            RouterError::Shard(e) => !matches!(e, ShardError::Failed { .. }),
            RouterError::Source(_) | RouterError::Routing(_) | RouterError::Key(_) => false,
        }
    }
}

/// Operation forwarded to the owning shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "doc", rename_all = "snake_case")]
pub enum ShardOp {
    Insert(Value),
    /// Equality query on the shard key
    Find(Value),
}

/// Request sent to a shard, tagged with the chunk version the router saw
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRequest {
    pub ns: String,
    pub key: ShardKey,
    pub version: ChunkVersion,
    pub op: ShardOp,
}

/// Where a key lives according to the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub shard: ShardId,
    pub chunk_id: ChunkId,
    pub version: ChunkVersion,
}

/// Authoritative chunk metadata
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch_chunk_map(&self, ns: &str) -> Result<ChunkMap, RouterError>;
}

/// Executes operations on data shards
#[async_trait]
pub trait ShardExecutor: Send + Sync {
    async fn execute(&self, shard: &str, request: ShardRequest) -> Result<Value, ShardError>;
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Attempts per operation, the first one included
    pub max_attempts: usize,
    /// Pause before retrying after a refresh
    pub retry_backoff: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(10),
        }
    }
}

/// Range router
pub struct RangeRouter {
    config: RouterConfig,
    source: Arc<dyn MetadataSource>,
    executor: Arc<dyn ShardExecutor>,
    /// Per-namespace routing tables; readers clone the `Arc` and release
    cache: RwLock<HashMap<String, Arc<ChunkMap>>>,
    refreshes: AtomicU64,
}

impl RangeRouter {
    pub fn new(
        config: RouterConfig,
        source: Arc<dyn MetadataSource>,
        executor: Arc<dyn ShardExecutor>,
    ) -> Self {
        Self {
            config,
            source,
            executor,
            cache: RwLock::new(HashMap::new()),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn cached(&self, ns: &str) -> Option<Arc<ChunkMap>> {
        self.cache.read().get(ns).cloned()
    }

    /// Collection version of the cached table
    pub fn cached_version(&self, ns: &str) -> Option<ChunkVersion> {
        self.cached(ns).map(|map| map.collection_version)
    }

    /// Number of metadata fetches so far
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Fetch `ns` from the source. The cache is replaced only by a table
    /// that is not older than the cached one.
    pub async fn refresh(&self, ns: &str) -> Result<Arc<ChunkMap>, RouterError> {
        // fetched without holding the cache lock
        let fresh = self.source.fetch_chunk_map(ns).await?;
        self.refreshes.fetch_add(1, Ordering::SeqCst);

        let mut cache = self.cache.write();
        if let Some(current) = cache.get(ns) {
            if current.collection_version > fresh.collection_version {
                debug!(
                    "Ignoring older routing table for {}: {} < {}",
                    ns, fresh.collection_version, current.collection_version
                );
                return Ok(current.clone());
            }
        }
        let fresh = Arc::new(fresh);
        info!(
            "Routing table for {} refreshed: {} chunks at {}",
            ns,
            fresh.len(),
            fresh.collection_version
        );
        cache.insert(ns.to_string(), fresh.clone());
        Ok(fresh)
    }

    /// Drop the cached table of `ns`
    pub fn invalidate(&self, ns: &str) {
        self.cache.write().remove(ns);
    }

    async fn table(&self, ns: &str) -> Result<Arc<ChunkMap>, RouterError> {
        match self.cached(ns) {
            Some(map) => Ok(map),
            None => self.refresh(ns).await,
        }
    }

    /// Resolve a shard key using the cache
    pub async fn route(&self, ns: &str, key: &ShardKey) -> Result<Route, RouterError> {
        let table = self.table(ns).await?;
        let chunk = table.find_chunk(key)?;
        Ok(Route {
            shard: chunk.shard.clone(),
            chunk_id: chunk.id.clone(),
            version: chunk.version,
        })
    }

    /// Resolve the shard key of a document using the cache
    pub async fn route_document(&self, ns: &str, doc: &Value) -> Result<Route, RouterError> {
        let table = self.table(ns).await?;
        let key = table.key_pattern.extract_key(doc)?;
        self.route(ns, &key).await
    }

    pub async fn insert(&self, ns: &str, doc: Value) -> Result<Value, RouterError> {
        let target = doc.clone();
        self.dispatch(ns, &target, ShardOp::Insert(doc)).await
    }

    /// Equality lookup on the shard key, sent to the single owning shard
    pub async fn find(&self, ns: &str, query: Value) -> Result<Value, RouterError> {
        let target = query.clone();
        self.dispatch(ns, &target, ShardOp::Find(query)).await
    }

    async fn dispatch(&self, ns: &str, target: &Value, op: ShardOp) -> Result<Value, RouterError> {
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            let table = self.table(ns).await?;
            let key = table.key_pattern.extract_key(target)?;
            let chunk = table.find_chunk(&key)?;
            let request = ShardRequest {
                ns: ns.to_string(),
                key,
                version: chunk.version,
                op: op.clone(),
            };

            match self.executor.execute(&chunk.shard, request).await {
                Ok(result) => return Ok(result),
                Err(ShardError::StaleVersion {
                    shard,
                    expected,
                    actual,
                    ..
                }) => {
                    debug!(
                        "Attempt {}/{} on {}: {} is at {}, router sent {}",
                        attempt, attempts, ns, shard, actual, expected
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_backoff).await;
                        self.refresh(ns).await?;
                    }
                }
                Err(e) => return Err(RouterError::Shard(e)),
            }
        }

        warn!("Giving up on {} after {} stale attempts", ns, attempts);
        Err(RouterError::StaleMetadata {
            ns: ns.to_string(),
            attempts,
        })
    }
}
