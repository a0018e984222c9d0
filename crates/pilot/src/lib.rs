//! Pilot - Sharding control plane
//!
//! Responsible for assigning key ranges (chunks) of sharded collections to
//! shards, splitting and migrating chunks, and keeping that metadata in a
//! majority-replicated config authority.
//!
//! # Features
//! - Shard registration and heartbeat management
//! - Collection sharding with ranged and hashed shard keys
//! - Explicit and size-triggered chunk splits
//! - Chunk migration and background balancing
//! - Routing table distribution for range routers
//!
//! # Usage Example
//! ```ignore
//! use pilot::{Config, Pilot};
//!
//! let pilot = Pilot::open(Config::default()).await?;
//! pilot.add_shard("shard0000", "localhost:27018").await?;
//! pilot.enable_sharding("testDB").await?;
//! pilot.shard_collection("testDB.foo", &json!({"a": 1}), Default::default()).await?;
//! ```

pub mod api;
pub mod authority;
pub mod config;
pub mod engine;
pub mod error;
pub mod failure;
pub mod metadata;
pub mod routing;
pub mod scheduler;
pub mod shard_monitor;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use error::{ErrorKind, PilotError};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use ds_core::{Chunk, ChunkMap, KeyPattern, Namespace};
use ds_router::{RangeRouter, RouterConfig};

use authority::{
    AuthorityConfig, AuthorityError, BeaconPayload, ConfigAuthority, LocalReplicaSet,
};
use engine::{MemoryEngine, StorageEngine};
use failure::FailureInjector;
use metadata::{
    presplit_hashed, BalancerSettings, ClusterMetadata, ClusterStats, CollectionInfo,
    DatabaseInfo, MetadataChange, MetadataError, ShardId, ShardInfo, ShardState,
};
use routing::LocalShardExecutor;
use scheduler::{
    Balancer, MigrationCoordinator, MigrationTicket, RoundReport, SplitOutcome, SplitPlanner,
    SplitRequest,
};
use shard_monitor::{ShardMonitor, ShardMonitorConfig};
use storage::FileStorage;

/// Options of `shardCollection`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardCollectionOptions {
    /// Enforce uniqueness of the shard key
    #[serde(default)]
    pub unique: bool,
    /// Pre-split an empty hashed collection into this many chunks
    #[serde(default)]
    pub num_initial_chunks: Option<usize>,
}

/// Pilot control plane
pub struct Pilot {
    config: Config,
    authority: Arc<ConfigAuthority>,
    replicas: Arc<LocalReplicaSet>,
    engine: Arc<MemoryEngine>,
    monitor: Arc<ShardMonitor>,
    planner: Arc<SplitPlanner>,
    coordinator: Arc<MigrationCoordinator>,
    balancer: Arc<Balancer>,
    failures: FailureInjector,
}

impl Pilot {
    /// Open the control plane with a fresh in-memory storage engine
    pub async fn open(config: Config) -> Result<Self, PilotError> {
        Self::open_with_engine(config, Arc::new(MemoryEngine::new())).await
    }

    /// Open the control plane on top of an existing storage engine. The
    /// config replicas and materialized metadata are loaded from
    /// `cluster.data_dir`.
    pub async fn open_with_engine(
        config: Config,
        engine: Arc<MemoryEngine>,
    ) -> Result<Self, PilotError> {
        config.validate()?;

        let replicas = Arc::new(
            LocalReplicaSet::open(config.replicas_dir(), &config.cluster.replicas)
                .await
                .map_err(AuthorityError::from)?,
        );
        let authority = Arc::new(
            ConfigAuthority::open(
                AuthorityConfig {
                    cluster_name: config.cluster.name.clone(),
                    commit_timeout: config.authority.commit_timeout(),
                },
                replicas.clone(),
                FileStorage::new(config.metadata_dir()),
            )
            .await?,
        );

        let shared_engine: Arc<dyn StorageEngine> = engine.clone();
        let monitor = Arc::new(ShardMonitor::new(
            ShardMonitorConfig {
                heartbeat_timeout: config.shards.heartbeat_timeout(),
                check_interval: config.shards.check_interval(),
            },
            authority.clone(),
        ));
        let planner = Arc::new(SplitPlanner::new(
            config.split.clone(),
            authority.clone(),
            shared_engine.clone(),
        ));
        let coordinator = Arc::new(MigrationCoordinator::new(
            config.migration.clone(),
            authority.clone(),
            shared_engine,
        ));
        let balancer = Arc::new(Balancer::new(
            config.balancer.clone(),
            authority.clone(),
            planner.clone(),
            coordinator.clone(),
        ));
        let failures = FailureInjector::new(replicas.clone(), engine.clone());

        info!(
            "Pilot initialized: cluster={}, data_dir={}",
            config.cluster.name,
            config.cluster.data_dir.display()
        );

        Ok(Self {
            config,
            authority,
            replicas,
            engine,
            monitor,
            planner,
            coordinator,
            balancer,
            failures,
        })
    }

    /// Get configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn authority(&self) -> &Arc<ConfigAuthority> {
        &self.authority
    }

    pub fn replicas(&self) -> &Arc<LocalReplicaSet> {
        &self.replicas
    }

    pub fn engine(&self) -> &Arc<MemoryEngine> {
        &self.engine
    }

    pub fn balancer(&self) -> &Arc<Balancer> {
        &self.balancer
    }

    pub fn migrations(&self) -> &Arc<MigrationCoordinator> {
        &self.coordinator
    }

    pub fn shard_monitor(&self) -> &Arc<ShardMonitor> {
        &self.monitor
    }

    pub fn failures(&self) -> &FailureInjector {
        &self.failures
    }

    /// Committed metadata
    pub async fn metadata(&self) -> ClusterMetadata {
        self.authority.snapshot().await
    }

    pub async fn stats(&self) -> ClusterStats {
        self.authority.snapshot().await.stats()
    }

    // ==================== Shards ====================

    pub async fn add_shard(&self, id: &str, host: &str) -> Result<ShardInfo, PilotError> {
        let shard = self.monitor.add_shard(id, host).await?;
        self.balancer.wake();
        Ok(shard)
    }

    pub async fn heartbeat(&self, id: &str) -> Result<ShardState, PilotError> {
        Ok(self.monitor.heartbeat(id).await?)
    }

    pub async fn get_shards(&self) -> Vec<ShardInfo> {
        self.authority.shards().await
    }

    /// Register the shards listed under `shards.bootstrap` that are missing
    pub async fn bootstrap_shards(&self) -> Result<usize, PilotError> {
        let known = self.authority.snapshot().await.shards;
        let mut added = 0;
        for shard in &self.config.shards.bootstrap {
            if known.contains_key(&shard.id) {
                continue;
            }
            self.add_shard(&shard.id, &shard.host).await?;
            added += 1;
        }
        Ok(added)
    }

    // ==================== Catalog ====================

    /// Enable sharding for a database. Enabling it again returns the existing
    /// entry unchanged.
    pub async fn enable_sharding(&self, db: &str) -> Result<DatabaseInfo, PilotError> {
        if !Namespace::is_valid_db_name(db) {
            return Err(
                MetadataError::InvalidOption(format!("invalid database name '{}'", db)).into(),
            );
        }

        let state = self.authority.snapshot().await;
        if let Some(existing) = state.databases.get(db).filter(|d| d.partitioned) {
            return Ok(existing.clone());
        }
        let primary = choose_primary(&state)?;
        drop(state);

        self.authority
            .commit(MetadataChange::EnableSharding {
                db: db.to_string(),
                primary: primary.clone(),
            })
            .await?;
        info!("Sharding enabled for {} (primary {})", db, primary);

        self.authority
            .snapshot()
            .await
            .databases
            .get(db)
            .cloned()
            .ok_or_else(|| MetadataError::DatabaseNotFound(db.to_string()).into())
    }

    /// Shard a collection on `key`.
    ///
    /// A non-empty collection needs an index on the primary shard that
    /// supports the key; an empty one gets the index created.
    pub async fn shard_collection(
        &self,
        ns: &str,
        key: &Value,
        options: ShardCollectionOptions,
    ) -> Result<CollectionInfo, PilotError> {
        let namespace = Namespace::parse(ns)?;
        let key_pattern = KeyPattern::from_json(key)?;
        if options.unique && key_pattern.is_hashed() {
            return Err(
                MetadataError::InvalidOption("hashed shard keys cannot be unique".into()).into(),
            );
        }

        let state = self.authority.snapshot().await;
        let db = state
            .databases
            .get(&namespace.db)
            .filter(|d| d.partitioned)
            .ok_or_else(|| MetadataError::ShardingNotEnabled(namespace.db.clone()))?;
        if state.collections.contains_key(ns) {
            return Err(MetadataError::AlreadySharded(ns.to_string()).into());
        }
        let primary = db.primary.clone();
        let up_shards = state.up_shards();
        drop(state);

        let documents = self.engine.document_count(&primary, ns).await?;
        let initial_chunks = match options.num_initial_chunks {
            Some(_) if documents > 0 => {
                return Err(MetadataError::InvalidOption(
                    "numInitialChunks is only supported for empty collections".into(),
                )
                .into());
            }
            Some(count) => presplit_hashed(ns, &key_pattern, count, &up_shards)?,
            None => Vec::new(),
        };

        if documents > 0 {
            if !self.engine.has_index(&primary, ns, &key_pattern).await? {
                return Err(MetadataError::MissingIndex {
                    ns: ns.to_string(),
                    key: key_pattern.to_string(),
                }
                .into());
            }
        } else {
            let mut owners: Vec<&ShardId> = initial_chunks.iter().map(|c| &c.shard).collect();
            owners.push(&primary);
            owners.sort();
            owners.dedup();
            for shard in owners {
                self.engine
                    .create_index(shard, ns, &key_pattern, options.unique)
                    .await?;
            }
        }

        self.authority
            .commit(MetadataChange::ShardCollection {
                ns: ns.to_string(),
                key_pattern,
                unique: options.unique,
                initial_chunks,
            })
            .await?;

        let state = self.authority.snapshot().await;
        let collection = state.collection(ns)?.clone();
        info!(
            "Collection {} sharded on {} ({} chunks)",
            ns,
            collection.key_pattern,
            state.chunks.list_chunks(ns).map(|c| c.len()).unwrap_or(0)
        );
        self.balancer.wake();
        Ok(collection)
    }

    // ==================== Chunks ====================

    pub async fn split(&self, ns: &str, request: SplitRequest) -> Result<SplitOutcome, PilotError> {
        Ok(self.planner.split(ns, request).await?)
    }

    /// Move the chunk holding the document matched by `find` to `to`
    pub async fn move_chunk(
        &self,
        ns: &str,
        find: &Value,
        to: &str,
    ) -> Result<MigrationTicket, PilotError> {
        let map = self.authority.chunk_map(ns).await?;
        let key = map.key_pattern.extract_key(find)?;
        let chunk = map.find_chunk(&key).map_err(MetadataError::from)?;
        Ok(self.coordinator.move_chunk(ns, &chunk.id, to).await?)
    }

    pub async fn move_chunk_by_id(
        &self,
        ns: &str,
        chunk_id: &str,
        to: &str,
    ) -> Result<MigrationTicket, PilotError> {
        Ok(self.coordinator.move_chunk(ns, chunk_id, to).await?)
    }

    pub async fn get_chunks(&self, ns: &str) -> Result<Vec<Chunk>, PilotError> {
        Ok(self.authority.list_chunks(ns).await?)
    }

    /// Full routing table of a namespace, as served to routers
    pub async fn routing_table(&self, ns: &str) -> Result<ChunkMap, PilotError> {
        Ok(self.authority.chunk_map(ns).await?)
    }

    /// Router running in-process against this control plane
    pub fn router(&self, config: RouterConfig) -> RangeRouter {
        let engine: Arc<dyn StorageEngine> = self.engine.clone();
        RangeRouter::new(
            config,
            self.authority.clone(),
            Arc::new(LocalShardExecutor::new(
                self.authority.clone(),
                self.coordinator.clone(),
                engine,
            )),
        )
    }

    // ==================== Migrations ====================

    pub fn list_migrations(&self) -> Vec<MigrationTicket> {
        self.coordinator.tickets()
    }

    pub fn get_migration(&self, ticket_id: &str) -> Option<MigrationTicket> {
        self.coordinator.ticket(ticket_id)
    }

    pub fn cancel_migration(&self, ticket_id: &str) -> Result<MigrationTicket, PilotError> {
        Ok(self.coordinator.cancel(ticket_id)?)
    }

    // ==================== Balancer ====================

    pub async fn balancer_start(&self) -> Result<BalancerSettings, PilotError> {
        let settings = self.authority.set_balancer_enabled(true).await?;
        info!("Balancer started");
        self.balancer.wake();
        Ok(settings)
    }

    /// Stop the balancer. A migration already in flight still completes.
    pub async fn balancer_stop(&self) -> Result<BalancerSettings, PilotError> {
        let settings = self.authority.set_balancer_enabled(false).await?;
        info!("Balancer stopped");
        Ok(settings)
    }

    pub async fn balancer_settings(&self) -> BalancerSettings {
        self.authority.balancer_settings().await
    }

    /// Run one balancer round in the caller's task
    pub async fn run_balancer_round(&self) -> RoundReport {
        self.balancer.run_round().await
    }

    // ==================== Beacon ====================

    pub async fn beacon(&self) -> BeaconPayload {
        self.authority
            .beacon_payload(self.engine.is_read_only())
            .await
    }

    /// Count one registration acknowledged by the monitoring endpoint
    pub async fn record_beacon_registration(&self) -> Result<u64, PilotError> {
        Ok(self.authority.record_beacon_registration().await?)
    }

    // ==================== Background tasks ====================

    /// Start the heartbeat checker and the balancer loop
    pub fn start_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.monitor.clone().start_heartbeat_checker(),
            self.balancer.clone().start(),
        ]
    }
}

/// Up shard that is primary for the fewest databases; ties go to the
/// lowest shard id
fn choose_primary(state: &ClusterMetadata) -> Result<ShardId, MetadataError> {
    state
        .up_shards()
        .into_iter()
        .min_by_key(|id| {
            let primaries = state
                .databases
                .values()
                .filter(|db| db.primary == *id)
                .count();
            (primaries, id.clone())
        })
        .ok_or(MetadataError::NoShards)
}
