// Administrative flows: enableSharding, shardCollection, split, moveChunk

mod common;

use common::{key, TestCluster, NS};
use ds_core::{ChunkVersion, KeyValue, ShardKey};
use pilot::authority::AuthorityError;
use pilot::metadata::MetadataError;
use pilot::scheduler::{MigrationPhase, SplitError, SplitRequest};
use pilot::{ErrorKind, PilotError, ShardCollectionOptions};
use serde_json::json;

#[tokio::test]
async fn test_admin_scenario() {
    let cluster = TestCluster::start(2).await;
    let pilot = &cluster.pilot;

    // 1. one chunk over the whole key space on the primary
    let db = pilot.enable_sharding("testDB").await.unwrap();
    assert_eq!(db.primary, "shard0000");
    assert!(db.partitioned);
    pilot
        .shard_collection(NS, &json!({"a": 1}), Default::default())
        .await
        .unwrap();
    let chunks = cluster.chunks(NS).await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].range.min, ShardKey::min(1));
    assert_eq!(chunks[0].range.max, ShardKey::max(1));
    assert_eq!(chunks[0].shard, "shard0000");

    // 2. split at 500
    pilot
        .split(NS, SplitRequest::Middle(json!({"a": 500})))
        .await
        .unwrap();
    let chunks = cluster.chunks(NS).await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].range.max, key(500));
    assert_eq!(chunks[1].range.min, key(500));
    let before = chunks[1].version;

    // 3. move [500, MaxKey) to shard0001
    let ticket = pilot
        .move_chunk(NS, &json!({"a": 500}), "shard0001")
        .await
        .unwrap();
    assert_eq!(ticket.phase, MigrationPhase::Committed);
    let moved = cluster.chunk_containing(NS, 500).await;
    assert_eq!(moved.shard, "shard0001");
    assert_eq!(moved.range.max, ShardKey::max(1));
    assert!(moved.version > before);
    assert_eq!(cluster.chunk_containing(NS, 499).await.shard, "shard0000");

    // 4. same split again is rejected and changes nothing
    let err = pilot
        .split(NS, SplitRequest::Middle(json!({"a": 500})))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PilotError::Split(SplitError::Authority(AuthorityError::Metadata(
            MetadataError::InvalidSplitPoint { .. }
        )))
    ));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(!err.is_retryable());
    assert_eq!(cluster.chunks(NS).await.len(), 2);

    cluster.cleanup();
}

#[tokio::test]
async fn test_repeated_splits_keep_layout() {
    let cluster = TestCluster::start(1).await;
    cluster.shard_foo().await;

    let points = [0, -1000, 1000, 250, 750, -500, i64::MAX, i64::MIN];
    for point in points {
        cluster
            .pilot
            .split(NS, SplitRequest::Middle(json!({ "a": point })))
            .await
            .unwrap();
    }

    let map = cluster.pilot.routing_table(NS).await.unwrap();
    map.check_invariants().unwrap();
    assert_eq!(map.len(), points.len() + 1);
    assert_eq!(map.collection_version, ChunkVersion(1 + points.len() as u64));
    for pair in map.chunks().windows(2) {
        assert!(pair[0].range.min < pair[1].range.min);
    }

    cluster.cleanup();
}

#[tokio::test]
async fn test_split_by_find_and_mixed_key_types() {
    let cluster = TestCluster::start(1).await;
    cluster.shard_foo().await;
    let pilot = &cluster.pilot;

    pilot
        .split(NS, SplitRequest::Find(json!({"a": "!@#$%^&*()", "b": 1})))
        .await
        .unwrap();
    pilot
        .split(NS, SplitRequest::Middle(json!({"a": 1e-130})))
        .await
        .unwrap();

    let chunks = cluster.chunks(NS).await;
    assert_eq!(chunks.len(), 3);
    // numbers sort before strings
    assert_eq!(chunks[1].range.min, ShardKey::single(KeyValue::Double(1e-130)));
    assert_eq!(
        chunks[2].range.min,
        ShardKey::single(KeyValue::String("!@#$%^&*()".into()))
    );
    assert_eq!(cluster.chunk_containing(NS, 0).await.id, chunks[0].id);

    let err = pilot
        .split(NS, SplitRequest::Middle(json!({"a": 1e-130})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    cluster.cleanup();
}

#[tokio::test]
async fn test_bounds_split_uses_median() {
    let cluster = TestCluster::start(1).await;
    cluster.shard_foo().await;
    cluster.insert_range(NS, 0..100).await;
    let pilot = &cluster.pilot;

    let outcome = pilot
        .split(
            NS,
            SplitRequest::Bounds(json!({"a": {"$minKey": 1}}), json!({"a": {"$maxKey": 1}})),
        )
        .await
        .unwrap();
    assert_eq!(outcome.left.range.max, key(50));
    assert_eq!(outcome.right.range.min, key(50));

    // bounds must name an existing chunk exactly
    let err = pilot
        .split(NS, SplitRequest::Bounds(json!({"a": 0}), json!({"a": 50})))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PilotError::Split(SplitError::BoundsMismatch { .. })
    ));

    // an empty chunk has no split point
    pilot
        .split(NS, SplitRequest::Middle(json!({"a": 1000})))
        .await
        .unwrap();
    let err = pilot
        .split(
            NS,
            SplitRequest::Bounds(json!({"a": 1000}), json!({"a": {"$maxKey": 1}})),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PilotError::Split(SplitError::NoSplitPoint(_))));
    assert_eq!(cluster.chunks(NS).await.len(), 3);

    cluster.cleanup();
}

#[tokio::test]
async fn test_shard_collection_requires_index() {
    let cluster = TestCluster::start(1).await;
    let pilot = &cluster.pilot;
    pilot.enable_sharding("testDB").await.unwrap();

    // existing data without an index on the shard key
    cluster.insert_unsharded("testDB.bar", 10).await;
    let err = pilot
        .shard_collection("testDB.bar", &json!({"a": 1}), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PilotError::Metadata(MetadataError::MissingIndex { .. })
    ));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(pilot.get_chunks("testDB.bar").await.is_err());
    assert!(pilot.metadata().await.collections.is_empty());

    // the same collection with a supporting index
    cluster.create_index("testDB.bar", json!({"a": 1, "b": 1})).await;
    pilot
        .shard_collection("testDB.bar", &json!({"a": 1}), Default::default())
        .await
        .unwrap();
    assert_eq!(pilot.get_chunks("testDB.bar").await.unwrap().len(), 1);

    cluster.cleanup();
}

#[tokio::test]
async fn test_shard_collection_validation() {
    let cluster = TestCluster::start(2).await;
    let pilot = &cluster.pilot;

    let err = pilot
        .shard_collection(NS, &json!({"a": 1}), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PilotError::Metadata(MetadataError::ShardingNotEnabled(_))
    ));

    // enableSharding is idempotent
    let first = pilot.enable_sharding("testDB").await.unwrap();
    let second = pilot.enable_sharding("testDB").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(pilot.enable_sharding("other").await.unwrap().primary, "shard0001");
    assert!(pilot.enable_sharding("bad.name").await.is_err());

    pilot
        .shard_collection(NS, &json!({"a": 1}), Default::default())
        .await
        .unwrap();
    let err = pilot
        .shard_collection(NS, &json!({"b": 1}), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PilotError::Metadata(MetadataError::AlreadySharded(_))
    ));

    let err = pilot
        .shard_collection(
            "testDB.h",
            &json!({"_id": "hashed"}),
            ShardCollectionOptions {
                unique: true,
                num_initial_chunks: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = pilot
        .shard_collection(
            "testDB.r",
            &json!({"a": 1}),
            ShardCollectionOptions {
                unique: false,
                num_initial_chunks: Some(4),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    cluster.cleanup();
}

#[tokio::test]
async fn test_hashed_presplit_round_robin() {
    let cluster = TestCluster::start(2).await;
    let pilot = &cluster.pilot;
    pilot.enable_sharding("testDB").await.unwrap();
    pilot
        .shard_collection(
            "testDB.h",
            &json!({"_id": "hashed"}),
            ShardCollectionOptions {
                unique: false,
                num_initial_chunks: Some(4),
            },
        )
        .await
        .unwrap();

    let map = pilot.routing_table("testDB.h").await.unwrap();
    map.check_invariants().unwrap();
    assert_eq!(map.len(), 4);
    let counts = map.chunk_counts(&["shard0000".to_string(), "shard0001".to_string()]);
    assert_eq!(counts["shard0000"], 2);
    assert_eq!(counts["shard0001"], 2);

    // documents land on the owner of their hashed key
    let router = cluster.router();
    for i in 0..40 {
        router
            .insert("testDB.h", json!({ "_id": i }))
            .await
            .unwrap();
    }
    let total = cluster.count_on("shard0000", "testDB.h").await
        + cluster.count_on("shard0001", "testDB.h").await;
    assert_eq!(total, 40);

    cluster.cleanup();
}

#[tokio::test]
async fn test_move_chunk_validation() {
    let cluster = TestCluster::start(2).await;
    cluster.shard_foo().await;
    let pilot = &cluster.pilot;

    let err = pilot
        .move_chunk(NS, &json!({"a": 1}), "shard0009")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = pilot
        .move_chunk(NS, &json!({"b": 1}), "shard0001")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    // already on the destination: nothing to do, version unchanged
    let before = cluster.chunk_containing(NS, 1).await;
    let ticket = pilot
        .move_chunk(NS, &json!({"a": 1}), "shard0000")
        .await
        .unwrap();
    assert_eq!(ticket.phase, MigrationPhase::Committed);
    assert_eq!(cluster.chunk_containing(NS, 1).await, before);

    // the destination must be up
    pilot.shard_monitor().mark_down("shard0001").await.unwrap();
    let err = pilot
        .move_chunk(NS, &json!({"a": 1}), "shard0001")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PilotError::Migration(pilot::scheduler::MigrationError::Metadata(
            MetadataError::ShardDown(_)
        ))
    ));
    assert_eq!(err.kind(), ErrorKind::ShardUnavailable);
    assert!(err.is_retryable());
    pilot.heartbeat("shard0001").await.unwrap();
    pilot
        .move_chunk(NS, &json!({"a": 1}), "shard0001")
        .await
        .unwrap();
    assert_eq!(cluster.chunk_containing(NS, 1).await.shard, "shard0001");

    cluster.cleanup();
}
