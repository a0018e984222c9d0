//! Failure injection
//!
//! Stops and restarts data shards and config replicas so tests can exercise
//! failover paths. Not reachable through the admin API.

use std::sync::Arc;

use rand::seq::IndexedRandom;
use tracing::info;

use crate::authority::{ConsensusError, LocalReplicaSet, ReplicaId};
use crate::engine::MemoryEngine;

pub struct FailureInjector {
    replicas: Arc<LocalReplicaSet>,
    engine: Arc<MemoryEngine>,
}

impl FailureInjector {
    pub fn new(replicas: Arc<LocalReplicaSet>, engine: Arc<MemoryEngine>) -> Self {
        Self { replicas, engine }
    }

    pub fn stop_shard(&self, shard: &str) {
        self.engine.stop_shard(shard);
    }

    pub fn start_shard(&self, shard: &str) {
        self.engine.start_shard(shard);
    }

    pub async fn stop_config_node(&self, id: &str) -> Result<(), ConsensusError> {
        self.replicas.stop_replica(id).await
    }

    pub async fn start_config_node(&self, id: &str) -> Result<(), ConsensusError> {
        self.replicas.start_replica(id).await
    }

    /// Stop the current config primary, if there is one
    pub async fn stop_primary(&self) -> Result<Option<ReplicaId>, ConsensusError> {
        let Some(leader) = self.replicas.leader_id().await else {
            return Ok(None);
        };
        self.replicas.stop_replica(&leader).await?;
        info!("Injected failure: config primary {} stopped", leader);
        Ok(Some(leader))
    }

    /// Stop a random live config replica
    pub async fn stop_random_config_node(&self) -> Result<Option<ReplicaId>, ConsensusError> {
        let up = self.replicas.up_replicas().await;
        let Some(victim) = up.choose(&mut rand::rng()).cloned() else {
            return Ok(None);
        };
        self.replicas.stop_replica(&victim).await?;
        info!("Injected failure: config replica {} stopped", victim);
        Ok(Some(victim))
    }

    /// Make the next config commit reach only `copies` replicas before the
    /// primary goes down
    pub fn crash_primary_mid_commit(&self, copies: usize) {
        self.replicas.crash_leader_after(copies);
    }
}
