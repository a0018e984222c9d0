// Shared harness for the pilot integration tests

#![allow(dead_code)]

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ds_core::{Chunk, KeyPattern, KeyValue, ShardKey};
use ds_router::{RangeRouter, RouterConfig};
use pilot::engine::MemoryEngine;
use pilot::{Config, Pilot};
use serde_json::{json, Value};

pub const NS: &str = "testDB.foo";

pub fn temp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}_{}", prefix, uuid::Uuid::new_v4()))
}

pub fn shard_id(i: usize) -> String {
    format!("shard{:04}", i)
}

pub fn key(i: i64) -> ShardKey {
    ShardKey::single(KeyValue::Int(i))
}

/// Fast timeouts, balancer loop not started unless a test does it
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.cluster.name = "test".to_string();
    config.cluster.data_dir = dir.to_path_buf();
    config.authority.commit_timeout_ms = 2000;
    config.balancer.round_interval_ms = 50;
    config.balancer.imbalance_threshold = 1;
    config.balancer.auto_split = false;
    config.migration.transfer_timeout_ms = 2000;
    config
}

pub struct TestCluster {
    pub pilot: Pilot,
    pub dir: PathBuf,
    config: Config,
}

impl TestCluster {
    /// Cluster with `shards` data shards named `shard0000`, `shard0001`, ...
    pub async fn start(shards: usize) -> Self {
        let dir = temp_dir("pilot_it");
        Self::start_with(test_config(&dir), shards).await
    }

    pub async fn start_with(config: Config, shards: usize) -> Self {
        let dir = config.cluster.data_dir.clone();
        let pilot = Pilot::open(config.clone()).await.unwrap();
        for i in 0..shards {
            let id = shard_id(i);
            pilot
                .add_shard(&id, &format!("localhost:{}", 27018 + i))
                .await
                .unwrap();
        }
        Self { pilot, dir, config }
    }

    /// Reopen the control plane on the same data directory and shards
    pub async fn restart(self) -> Self {
        let engine: Arc<MemoryEngine> = self.pilot.engine().clone();
        let config = self.config.clone();
        let dir = self.dir.clone();
        drop(self.pilot);
        let pilot = Pilot::open_with_engine(config.clone(), engine).await.unwrap();
        Self { pilot, dir, config }
    }

    /// `enableSharding("testDB")` + `shardCollection("testDB.foo", {a: 1})`
    pub async fn shard_foo(&self) {
        self.pilot.enable_sharding("testDB").await.unwrap();
        self.pilot
            .shard_collection(NS, &json!({"a": 1}), Default::default())
            .await
            .unwrap();
    }

    pub fn router(&self) -> RangeRouter {
        self.pilot.router(RouterConfig::default())
    }

    /// Insert `{a: i}` for every `i` in `range` through a router
    pub async fn insert_range(&self, ns: &str, range: Range<i64>) {
        let router = self.router();
        for i in range {
            router.insert(ns, json!({"a": i, "payload": "x"})).await.unwrap();
        }
    }

    pub async fn chunks(&self, ns: &str) -> Vec<Chunk> {
        self.pilot.get_chunks(ns).await.unwrap()
    }

    pub async fn chunk_containing(&self, ns: &str, i: i64) -> Chunk {
        self.pilot
            .authority()
            .find_chunk(ns, &key(i))
            .await
            .unwrap()
    }

    /// Documents stored on `shard` for `ns`
    pub async fn count_on(&self, shard: &str, ns: &str) -> u64 {
        use pilot::engine::StorageEngine;
        self.pilot.engine().document_count(shard, ns).await.unwrap()
    }

    /// Write `{a: 0..count}` straight to the primary, bypassing sharding
    pub async fn insert_unsharded(&self, ns: &str, count: i64) {
        use pilot::engine::StorageEngine;
        let docs = (0..count).map(|i| json!({ "a": i })).collect();
        self.pilot
            .engine()
            .write_documents(&shard_id(0), ns, docs)
            .await
            .unwrap();
    }

    pub async fn create_index(&self, ns: &str, spec: Value) {
        use pilot::engine::StorageEngine;
        let pattern = KeyPattern::from_json(&spec).unwrap();
        self.pilot
            .engine()
            .create_index(&shard_id(0), ns, &pattern, false)
            .await
            .unwrap();
    }

    pub fn cleanup(self) {
        let dir = self.dir.clone();
        drop(self);
        let _ = std::fs::remove_dir_all(dir);
    }
}
