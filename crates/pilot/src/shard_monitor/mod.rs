//! Shard monitor
//!
//! Responsible for shard registration, heartbeat tracking, and failure
//! detection. Liveness changes are committed through the authority so the
//! balancer and migrations see them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::authority::{AuthorityError, ConfigAuthority};
use crate::metadata::{MetadataChange, ShardId, ShardInfo, ShardState};

/// Shard monitor configuration
#[derive(Debug, Clone)]
pub struct ShardMonitorConfig {
    pub heartbeat_timeout: Duration,
    pub check_interval: Duration,
}

/// Shard monitor
pub struct ShardMonitor {
    config: ShardMonitorConfig,
    authority: Arc<ConfigAuthority>,
    /// Last heartbeat per shard; not replicated
    heartbeats: RwLock<HashMap<ShardId, DateTime<Utc>>>,
}

impl ShardMonitor {
    pub fn new(config: ShardMonitorConfig, authority: Arc<ConfigAuthority>) -> Self {
        Self {
            config,
            authority,
            heartbeats: RwLock::new(HashMap::new()),
        }
    }

    /// Register a shard
    pub async fn add_shard(&self, id: &str, host: &str) -> Result<ShardInfo, AuthorityError> {
        let now = Utc::now();
        self.authority
            .commit(MetadataChange::AddShard {
                id: id.to_string(),
                host: host.to_string(),
                at: now,
            })
            .await?;
        self.heartbeats.write().insert(id.to_string(), now);
        info!("Shard registered: {} at {}", id, host);

        let state = self.authority.snapshot().await;
        Ok(state.shard(id)?.clone())
    }

    /// Handle heartbeat. A down shard that reports in is marked up again.
    pub async fn heartbeat(&self, id: &str) -> Result<ShardState, AuthorityError> {
        let shard = self.authority.snapshot().await.shard(id)?.clone();
        self.heartbeats.write().insert(id.to_string(), Utc::now());
        debug!("Heartbeat from shard: {}", id);

        if shard.state == ShardState::Down {
            self.set_state(id, ShardState::Up).await?;
            info!("Shard {} is back up", id);
        }
        Ok(ShardState::Up)
    }

    /// Mark a shard down without waiting for the heartbeat timeout
    pub async fn mark_down(&self, id: &str) -> Result<(), AuthorityError> {
        self.set_state(id, ShardState::Down).await?;
        self.heartbeats.write().remove(id);
        warn!("Shard {} marked down", id);
        Ok(())
    }

    async fn set_state(&self, id: &str, state: ShardState) -> Result<(), AuthorityError> {
        self.authority
            .commit(MetadataChange::SetShardState {
                id: id.to_string(),
                state,
            })
            .await?;
        Ok(())
    }

    pub fn last_heartbeat(&self, id: &str) -> Option<DateTime<Utc>> {
        self.heartbeats.read().get(id).copied()
    }

    /// Start heartbeat checker task
    pub fn start_heartbeat_checker(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let check_interval = self.config.check_interval;

        tokio::spawn(async move {
            let mut interval = interval(check_interval);
            loop {
                interval.tick().await;
                self.check_heartbeats().await;
            }
        })
    }

    /// Mark up shards whose heartbeat is older than the timeout as down.
    /// Shards never heard from since startup get a grace period of one
    /// timeout.
    pub async fn check_heartbeats(&self) -> Vec<ShardId> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let shards = self.authority.shards().await;
        let expired: Vec<ShardId> = {
            let mut heartbeats = self.heartbeats.write();
            shards
                .iter()
                .filter(|s| s.is_up())
                .filter(|s| {
                    let last = *heartbeats.entry(s.id.clone()).or_insert(now);
                    now - last > timeout
                })
                .map(|s| s.id.clone())
                .collect()
        };

        let mut offline = Vec::new();
        for id in expired {
            warn!("Shard {} heartbeat timeout, marking as down", id);
            match self.set_state(&id, ShardState::Down).await {
                Ok(()) => offline.push(id),
                Err(e) => warn!("Failed to mark shard {} down: {}", id, e),
            }
        }

        if !offline.is_empty() {
            info!("{} shards marked as down", offline.len());
        }
        offline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{AuthorityConfig, LocalReplicaSet};
    use crate::config::ReplicaConfig;
    use crate::storage::FileStorage;
    use std::path::{Path, PathBuf};

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("pilot_monitor_test_{}", uuid::Uuid::new_v4()))
    }

    async fn monitor(dir: &Path, heartbeat_timeout: Duration) -> ShardMonitor {
        let set = Arc::new(
            LocalReplicaSet::open(dir.join("replicas"), &[ReplicaConfig::new("cfg0", 1)])
                .await
                .unwrap(),
        );
        let authority = ConfigAuthority::open(
            AuthorityConfig {
                cluster_name: "test".to_string(),
                commit_timeout: Duration::from_secs(1),
            },
            set,
            FileStorage::new(dir.join("config")),
        )
        .await
        .unwrap();
        ShardMonitor::new(
            ShardMonitorConfig {
                heartbeat_timeout,
                check_interval: Duration::from_secs(1),
            },
            Arc::new(authority),
        )
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_marks_down() {
        let dir = temp_dir();
        let monitor = monitor(&dir, Duration::from_millis(50)).await;
        monitor.add_shard("shard0000", "localhost:27018").await.unwrap();
        assert!(monitor.last_heartbeat("shard0000").is_some());
        assert!(monitor.check_heartbeats().await.is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(monitor.check_heartbeats().await, vec!["shard0000".to_string()]);
        let shards = monitor.authority.shards().await;
        assert_eq!(shards[0].state, ShardState::Down);

        // reporting in brings it back
        assert_eq!(monitor.heartbeat("shard0000").await.unwrap(), ShardState::Up);
        assert!(monitor.authority.shards().await[0].is_up());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_unknown_shard_heartbeat_rejected() {
        let dir = temp_dir();
        let monitor = monitor(&dir, Duration::from_secs(30)).await;
        assert!(monitor.heartbeat("shard0009").await.is_err());
        assert!(monitor.add_shard("shard0000", "h:1").await.is_ok());
        assert!(monitor.add_shard("shard0000", "h:1").await.is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
