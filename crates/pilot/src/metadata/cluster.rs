//! Cluster metadata

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use ds_core::Namespace;

use super::{
    BalancerSettings, BeaconCounters, ChunkMetadataStore, CollectionInfo, DatabaseInfo,
    MetadataChange, MetadataError, ShardId, ShardInfo, ShardState,
};

/// Cluster metadata
///
/// The state machine driven by the committed change log. Every replica that
/// applies the same committed entries in order ends up with the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    /// Cluster name
    pub name: String,
    /// Shard registry
    pub shards: BTreeMap<ShardId, ShardInfo>,
    /// Databases by name
    pub databases: BTreeMap<String, DatabaseInfo>,
    /// Sharded collections by namespace
    pub collections: BTreeMap<String, CollectionInfo>,
    /// Chunk layouts
    pub chunks: ChunkMetadataStore,
    /// Balancer switch
    pub balancer: BalancerSettings,
    /// Beacon counters
    pub beacon: BeaconCounters,
    /// Log index of the last applied change
    pub config_version: u64,
}

impl ClusterMetadata {
    /// Create empty cluster
    pub fn new(name: String) -> Self {
        Self {
            name,
            shards: BTreeMap::new(),
            databases: BTreeMap::new(),
            collections: BTreeMap::new(),
            chunks: ChunkMetadataStore::new(),
            balancer: BalancerSettings::default(),
            beacon: BeaconCounters::default(),
            config_version: 0,
        }
    }

    /// Rebuild state by applying committed changes in log order
    pub fn replay<'a>(
        name: String,
        entries: impl IntoIterator<Item = (u64, &'a MetadataChange)>,
    ) -> Self {
        let mut metadata = Self::new(name);
        metadata.catch_up(entries);
        metadata
    }

    /// Apply the committed changes newer than `config_version`
    pub fn catch_up<'a>(&mut self, entries: impl IntoIterator<Item = (u64, &'a MetadataChange)>) {
        for (index, change) in entries {
            if index <= self.config_version {
                continue;
            }
            if let Err(e) = self.apply_entry(index, change) {
                // Deterministic on every replica, so the entry is a no-op everywhere
                warn!("Skipping log entry {} ({}): {}", index, change.op_name(), e);
                self.config_version = index;
            }
        }
    }

    /// Full validation of a change against the current state, including
    /// shard liveness. Does not mutate.
    pub fn check(&self, change: &MetadataChange) -> Result<(), MetadataError> {
        match change {
            MetadataChange::AddShard { id, host, .. } => {
                if id.is_empty() || host.is_empty() {
                    return Err(MetadataError::InvalidOption(
                        "shard id and host must not be empty".into(),
                    ));
                }
                if self.shards.contains_key(id) {
                    return Err(MetadataError::ShardExists(id.clone()));
                }
            }
            MetadataChange::SetShardState { id, .. } => {
                self.shard(id)?;
            }
            MetadataChange::EnableSharding { db, primary } => {
                if !Namespace::is_valid_db_name(db) {
                    return Err(MetadataError::InvalidOption(format!(
                        "invalid database name '{}'",
                        db
                    )));
                }
                self.up_shard(primary)?;
            }
            MetadataChange::ShardCollection {
                ns, initial_chunks, ..
            } => {
                let namespace = Namespace::parse(ns)?;
                let db = self
                    .databases
                    .get(&namespace.db)
                    .ok_or_else(|| MetadataError::ShardingNotEnabled(namespace.db.clone()))?;
                if !db.partitioned {
                    return Err(MetadataError::ShardingNotEnabled(namespace.db.clone()));
                }
                if self.collections.contains_key(ns) || self.chunks.contains(ns) {
                    return Err(MetadataError::AlreadySharded(ns.clone()));
                }
                if initial_chunks.is_empty() {
                    self.up_shard(&db.primary)?;
                }
                for chunk in initial_chunks {
                    self.up_shard(&chunk.shard)?;
                }
            }
            MetadataChange::SplitChunk {
                ns,
                chunk_id,
                split_point,
            } => {
                self.chunks.check_split(ns, chunk_id, split_point)?;
            }
            MetadataChange::MigrateChunk {
                ns,
                chunk_id,
                range,
                from,
                to,
            } => {
                self.chunks.check_migration(ns, chunk_id, range, from)?;
                self.up_shard(to)?;
            }
            MetadataChange::SetBalancerEnabled { .. }
            | MetadataChange::RecordBeaconRegistration { .. } => {}
        }
        Ok(())
    }

    /// Apply a committed change and advance `config_version`
    pub fn apply_entry(&mut self, index: u64, change: &MetadataChange) -> Result<(), MetadataError> {
        self.apply(change)?;
        self.config_version = self.config_version.max(index);
        Ok(())
    }

    /// Apply a change. Only structural rules are enforced here; liveness is
    /// checked before proposing, so replay never depends on timing.
    pub fn apply(&mut self, change: &MetadataChange) -> Result<(), MetadataError> {
        match change {
            MetadataChange::AddShard { id, host, at } => {
                if self.shards.contains_key(id) {
                    return Err(MetadataError::ShardExists(id.clone()));
                }
                self.shards
                    .insert(id.clone(), ShardInfo::new(id.clone(), host.clone(), *at));
            }
            MetadataChange::SetShardState { id, state } => {
                let shard = self
                    .shards
                    .get_mut(id)
                    .ok_or_else(|| MetadataError::ShardNotFound(id.clone()))?;
                shard.state = *state;
            }
            MetadataChange::EnableSharding { db, primary } => {
                let entry = self
                    .databases
                    .entry(db.clone())
                    .or_insert_with(|| DatabaseInfo {
                        name: db.clone(),
                        primary: primary.clone(),
                        partitioned: false,
                    });
                entry.partitioned = true;
            }
            MetadataChange::ShardCollection {
                ns,
                key_pattern,
                unique,
                initial_chunks,
            } => {
                let namespace = Namespace::parse(ns)?;
                if initial_chunks.is_empty() {
                    let primary = self
                        .databases
                        .get(&namespace.db)
                        .map(|db| db.primary.clone())
                        .ok_or_else(|| MetadataError::DatabaseNotFound(namespace.db.clone()))?;
                    self.chunks.initialize(ns, key_pattern.clone(), &primary)?;
                } else {
                    self.chunks
                        .initialize_with_chunks(ns, key_pattern.clone(), initial_chunks.clone())?;
                }
                self.collections.insert(
                    ns.clone(),
                    CollectionInfo {
                        ns: ns.clone(),
                        key_pattern: key_pattern.clone(),
                        unique: *unique,
                    },
                );
            }
            MetadataChange::SplitChunk {
                ns,
                chunk_id,
                split_point,
            } => {
                self.chunks.apply_split(ns, chunk_id, split_point.clone())?;
            }
            MetadataChange::MigrateChunk {
                ns,
                chunk_id,
                range,
                from,
                to,
            } => {
                self.chunks.apply_migration(ns, chunk_id, range, from, to)?;
            }
            MetadataChange::SetBalancerEnabled { enabled, at } => {
                self.balancer.enabled = *enabled;
                self.balancer.last_toggled = Some(*at);
            }
            MetadataChange::RecordBeaconRegistration { at } => {
                self.beacon.registrations += 1;
                self.beacon.last_registered = Some(*at);
            }
        }
        Ok(())
    }

    pub fn shard(&self, id: &str) -> Result<&ShardInfo, MetadataError> {
        self.shards
            .get(id)
            .ok_or_else(|| MetadataError::ShardNotFound(id.to_string()))
    }

    fn up_shard(&self, id: &str) -> Result<&ShardInfo, MetadataError> {
        let shard = self.shard(id)?;
        if !shard.is_up() {
            return Err(MetadataError::ShardDown(id.to_string()));
        }
        Ok(shard)
    }

    /// IDs of shards in the up state, sorted
    pub fn up_shards(&self) -> Vec<ShardId> {
        self.shards
            .values()
            .filter(|s| s.state == ShardState::Up)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn collection(&self, ns: &str) -> Result<&CollectionInfo, MetadataError> {
        self.collections
            .get(ns)
            .ok_or_else(|| MetadataError::NotSharded(ns.to_string()))
    }

    /// Get cluster statistics
    pub fn stats(&self) -> ClusterStats {
        ClusterStats {
            total_shards: self.shards.len(),
            up_shards: self.shards.values().filter(|s| s.is_up()).count(),
            databases: self.databases.len(),
            sharded_collections: self.collections.len(),
            total_chunks: self
                .chunks
                .namespaces()
                .filter_map(|ns| self.chunks.chunk_map(ns))
                .map(|m| m.len())
                .sum(),
            balancer_enabled: self.balancer.enabled,
            config_version: self.config_version,
        }
    }
}

/// Cluster statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStats {
    pub total_shards: usize,
    pub up_shards: usize,
    pub databases: usize,
    pub sharded_collections: usize,
    pub total_chunks: usize,
    pub balancer_enabled: bool,
    pub config_version: u64,
}
