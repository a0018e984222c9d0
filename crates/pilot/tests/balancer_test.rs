// Balancer rounds, start/stop and the background loop

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{temp_dir, test_config, TestCluster, NS};
use pilot::scheduler::SplitRequest;
use serde_json::json;

/// `testDB.foo` split into `points + 1` chunks, all on the primary
async fn lopsided(cluster: &TestCluster, points: i64) {
    cluster.shard_foo().await;
    for i in 1..=points {
        cluster
            .pilot
            .split(NS, SplitRequest::Middle(json!({ "a": i * 100 })))
            .await
            .unwrap();
    }
}

async fn counts(cluster: &TestCluster) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for chunk in cluster.chunks(NS).await {
        *counts.entry(chunk.shard).or_insert(0) += 1;
    }
    counts
}

fn spread(counts: &BTreeMap<String, usize>, shards: usize) -> usize {
    let max = counts.values().copied().max().unwrap_or(0);
    let min = if counts.len() < shards {
        0
    } else {
        counts.values().copied().min().unwrap_or(0)
    };
    max - min
}

#[tokio::test]
async fn test_stopped_balancer_allows_explicit_moves() {
    let cluster = TestCluster::start(2).await;
    lopsided(&cluster, 10).await;
    let pilot = &cluster.pilot;

    let settings = pilot.balancer_stop().await.unwrap();
    assert!(!settings.enabled);
    assert!(settings.last_toggled.is_some());

    // explicit moves still work while stopped
    pilot
        .move_chunk(NS, &json!({"a": 0}), "shard0001")
        .await
        .unwrap();
    assert_eq!(cluster.chunk_containing(NS, 0).await.shard, "shard0001");

    let before = cluster.chunks(NS).await;
    let report = pilot.run_balancer_round().await;
    assert!(!report.enabled);
    assert!(report.migrations.is_empty());
    assert_eq!(cluster.chunks(NS).await, before);

    pilot.balancer_start().await.unwrap();
    assert!(pilot.balancer_settings().await.enabled);
    for _ in 0..20 {
        let report = pilot.run_balancer_round().await;
        assert!(report.enabled);
        assert_eq!(report.failures, 0);
        if report.migrations.is_empty() {
            break;
        }
    }

    let counts = counts(&cluster).await;
    assert_eq!(counts.values().sum::<usize>(), 11);
    assert!(spread(&counts, 2) <= 1, "unbalanced: {:?}", counts);
    pilot.routing_table(NS).await.unwrap().check_invariants().unwrap();

    cluster.cleanup();
}

#[tokio::test]
async fn test_stop_lets_in_flight_migration_finish() {
    let cluster = TestCluster::start(2).await;
    lopsided(&cluster, 10).await;
    let pilot = &cluster.pilot;
    pilot.engine().set_write_delay(Duration::from_millis(200));

    let stopper = async {
        while pilot.migrations().active_tickets().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pilot.balancer_stop().await.unwrap();
    };
    let (report, _) = tokio::join!(pilot.run_balancer_round(), stopper);

    // the running migration committed, nothing new started
    assert_eq!(report.migrations.len(), 1);
    assert_eq!(counts(&cluster).await.get("shard0001"), Some(&1));
    assert!(pilot.migrations().active_tickets().is_empty());

    pilot.engine().set_write_delay(Duration::ZERO);
    let report = pilot.run_balancer_round().await;
    assert!(!report.enabled);
    assert!(report.migrations.is_empty());

    cluster.cleanup();
}

#[tokio::test]
async fn test_round_respects_migration_limit() {
    let dir = temp_dir("pilot_it");
    let mut config = test_config(&dir);
    config.balancer.max_migrations_per_round = 1;
    let cluster = TestCluster::start_with(config, 2).await;
    lopsided(&cluster, 5).await;

    let report = cluster.pilot.run_balancer_round().await;
    assert_eq!(report.migrations.len(), 1);
    assert_eq!(counts(&cluster).await.get("shard0001"), Some(&1));

    let report = cluster.pilot.run_balancer_round().await;
    assert_eq!(report.migrations.len(), 1);
    assert_eq!(counts(&cluster).await.get("shard0001"), Some(&2));
    assert_eq!(cluster.pilot.balancer().migrations_started(), 2);

    cluster.cleanup();
}

#[tokio::test]
async fn test_down_shard_receives_no_chunks() {
    let cluster = TestCluster::start(3).await;
    lopsided(&cluster, 5).await;
    let pilot = &cluster.pilot;

    pilot.shard_monitor().mark_down("shard0002").await.unwrap();
    for _ in 0..10 {
        if pilot.run_balancer_round().await.migrations.is_empty() {
            break;
        }
    }

    let counts = counts(&cluster).await;
    assert_eq!(counts.get("shard0002"), None);
    assert_eq!(counts.get("shard0000"), Some(&3));
    assert_eq!(counts.get("shard0001"), Some(&3));

    cluster.cleanup();
}

#[tokio::test]
async fn test_single_shard_is_balanced() {
    let cluster = TestCluster::start(1).await;
    lopsided(&cluster, 3).await;

    let report = cluster.pilot.run_balancer_round().await;
    assert!(report.enabled);
    assert!(report.migrations.is_empty());
    assert_eq!(cluster.pilot.balancer().rounds(), 1);

    cluster.cleanup();
}

#[tokio::test]
async fn test_background_loop_converges() {
    let cluster = TestCluster::start(2).await;
    lopsided(&cluster, 7).await;
    let tasks = cluster.pilot.start_background_tasks();

    let mut balanced = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let counts = counts(&cluster).await;
        if counts.len() == 2 && spread(&counts, 2) <= 1 {
            balanced = true;
            break;
        }
    }
    assert!(balanced);
    assert!(cluster.pilot.balancer().rounds() > 0);

    for task in tasks {
        task.abort();
    }
    cluster.cleanup();
}
