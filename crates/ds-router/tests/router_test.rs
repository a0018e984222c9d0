//! Router retry and cache behaviour against in-memory shards

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use ds_core::{ChunkMap, ChunkVersion, KeyPattern, KeyValue, ShardKey};
use ds_router::{
    MetadataSource, RangeRouter, RouterConfig, RouterError, ShardError, ShardExecutor, ShardOp,
    ShardRequest,
};

/// Authoritative layouts shared by the fake config server and fake shards
#[derive(Default)]
struct Cluster {
    maps: Mutex<HashMap<String, ChunkMap>>,
    /// Maps served by the config server lag behind while this is set
    serve_stale: Mutex<Option<ChunkMap>>,
    fetches: AtomicUsize,
    executed: Mutex<Vec<(String, ShardRequest)>>,
}

impl Cluster {
    fn new() -> Arc<Self> {
        let cluster = Arc::new(Self::default());
        for ns in ["db.a", "db.b"] {
            let pattern = KeyPattern::from_json(&json!({"x": 1})).unwrap();
            cluster
                .maps
                .lock()
                .insert(ns.to_string(), ChunkMap::single(ns, pattern, "s0".into()));
        }
        cluster
    }

    fn map(&self, ns: &str) -> ChunkMap {
        self.maps.lock()[ns].clone()
    }

    /// Split `ns` at `x = at` and hand the upper half to `to`
    fn split_and_move(&self, ns: &str, at: i64, to: &str) {
        let mut maps = self.maps.lock();
        let map = maps.get_mut(ns).unwrap();
        let point = ShardKey::single(KeyValue::Int(at));
        let idx = map.find_index(&point).unwrap();
        let next = map.collection_version.next();
        map.split_at(idx, point, next).unwrap();
        let next = map.collection_version.next();
        map.set_owner(idx + 1, to.to_string(), next).unwrap();
    }
}

struct Source(Arc<Cluster>);

#[async_trait]
impl MetadataSource for Source {
    async fn fetch_chunk_map(&self, ns: &str) -> Result<ChunkMap, RouterError> {
        self.0.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(stale) = self.0.serve_stale.lock().clone() {
            return Ok(stale);
        }
        Ok(self.0.map(ns))
    }
}

struct Shards(Arc<Cluster>);

#[async_trait]
impl ShardExecutor for Shards {
    async fn execute(&self, shard: &str, request: ShardRequest) -> Result<Value, ShardError> {
        let map = self.0.map(&request.ns);
        let chunk = map.find_chunk(&request.key).unwrap();
        if chunk.shard != shard || chunk.version != request.version {
            return Err(ShardError::StaleVersion {
                shard: shard.to_string(),
                ns: request.ns.clone(),
                expected: request.version,
                actual: map.shard_version(shard).unwrap_or_default(),
            });
        }
        self.0
            .executed
            .lock()
            .push((shard.to_string(), request.clone()));
        Ok(json!({"shard": shard}))
    }
}

fn router(cluster: &Arc<Cluster>) -> RangeRouter {
    RangeRouter::new(
        RouterConfig {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(1),
        },
        Arc::new(Source(cluster.clone())),
        Arc::new(Shards(cluster.clone())),
    )
}

#[tokio::test]
async fn test_routes_with_cached_table() {
    let cluster = Cluster::new();
    let router = router(&cluster);

    let result = router.insert("db.a", json!({"x": 5, "y": 1})).await.unwrap();
    assert_eq!(result, json!({"shard": "s0"}));
    router.find("db.a", json!({"x": 5})).await.unwrap();
    assert_eq!(cluster.fetches.load(Ordering::SeqCst), 1);

    let executed = cluster.executed.lock();
    assert_eq!(executed.len(), 2);
    assert!(matches!(executed[0].1.op, ShardOp::Insert(_)));
    assert!(matches!(executed[1].1.op, ShardOp::Find(_)));
}

#[tokio::test]
async fn test_stale_version_triggers_refresh_and_retry() {
    let cluster = Cluster::new();
    let router = router(&cluster);
    router.route_document("db.a", &json!({"x": 0})).await.unwrap();

    cluster.split_and_move("db.a", 100, "s1");
    let result = router.insert("db.a", json!({"x": 150})).await.unwrap();
    assert_eq!(result, json!({"shard": "s1"}));
    assert_eq!(cluster.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(router.cached_version("db.a"), Some(ChunkVersion(3)));

    let route = router
        .route("db.a", &ShardKey::single(KeyValue::Int(99)))
        .await
        .unwrap();
    assert_eq!(route.shard, "s0");
}

#[tokio::test]
async fn test_gives_up_with_stale_metadata() {
    let cluster = Cluster::new();
    let router = router(&cluster);
    router.route_document("db.a", &json!({"x": 0})).await.unwrap();

    // config server keeps serving the old layout
    *cluster.serve_stale.lock() = Some(cluster.map("db.a"));
    cluster.split_and_move("db.a", 100, "s1");

    let err = router.insert("db.a", json!({"x": 150})).await.unwrap_err();
    assert!(matches!(err, RouterError::StaleMetadata { attempts: 3, .. }));
    assert!(err.is_retryable());
    assert!(cluster.executed.lock().is_empty());
}

#[tokio::test]
async fn test_refresh_is_per_namespace_and_never_goes_back() {
    let cluster = Cluster::new();
    let router = router(&cluster);
    router.route_document("db.a", &json!({"x": 0})).await.unwrap();
    router.route_document("db.b", &json!({"x": 0})).await.unwrap();
    let b_before = router.cached("db.b").unwrap();

    let old_a = cluster.map("db.a");
    cluster.split_and_move("db.a", 10, "s1");
    router.refresh("db.a").await.unwrap();
    assert_eq!(router.cached_version("db.a"), Some(ChunkVersion(3)));
    assert!(Arc::ptr_eq(&b_before, &router.cached("db.b").unwrap()));

    *cluster.serve_stale.lock() = Some(old_a);
    let kept = router.refresh("db.a").await.unwrap();
    assert_eq!(kept.collection_version, ChunkVersion(3));
}

#[tokio::test]
async fn test_wrong_key_width_is_not_retryable() {
    let cluster = Cluster::new();
    let router = router(&cluster);
    let err = router
        .route(
            "db.a",
            &ShardKey::new(vec![KeyValue::Int(1), KeyValue::Int(2)]),
        )
        .await
        .unwrap_err();
    assert!(!err.is_retryable());

    let err = router.insert("db.a", json!({"y": 1})).await.unwrap_err();
    assert!(matches!(err, RouterError::Key(_)));
}
