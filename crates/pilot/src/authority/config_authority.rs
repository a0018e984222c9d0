//! Replicated metadata state machine

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use ds_core::{Chunk, ChunkMap, ShardKey};

use super::consensus::{Consensus, ConsensusError, Leadership, LogEntry, MemberInfo, ReplicaId};
use super::AuthorityError;
use crate::metadata::{BalancerSettings, ClusterMetadata, MetadataChange, MetadataError, ShardInfo};
use crate::storage::FileStorage;

/// Authority settings
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    pub cluster_name: String,
    /// Upper bound for a single mutation, quorum wait included
    pub commit_timeout: Duration,
}

/// Build information reported by the beacon
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Registration beacon payload
#[derive(Debug, Clone, Serialize)]
pub struct BeaconPayload {
    pub cluster: String,
    pub build: BuildInfo,
    pub storage_engine_read_only: bool,
    pub primary: Option<ReplicaId>,
    pub term: u64,
    pub members: Vec<MemberInfo>,
    pub config_version: u64,
    pub shards: usize,
    pub sharded_collections: usize,
    pub registrations: u64,
}

/// Config authority
pub struct ConfigAuthority {
    config: AuthorityConfig,
    consensus: Arc<dyn Consensus>,
    /// Committed state; never holds uncommitted changes
    state: RwLock<ClusterMetadata>,
    /// Term the state was last rebuilt for
    term: Mutex<u64>,
    /// Per-namespace writer locks
    key_locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    storage: FileStorage,
    changed: Notify,
}

impl ConfigAuthority {
    /// Open the authority: load the materialized snapshot, resolve pending
    /// log entries and catch up with the committed log.
    pub async fn open(
        config: AuthorityConfig,
        consensus: Arc<dyn Consensus>,
        storage: FileStorage,
    ) -> Result<Self, AuthorityError> {
        storage.ensure_dir().await?;
        let snapshot = storage.load_metadata().await?;
        let leadership = consensus.current_leader().await?;

        let authority = Self {
            state: RwLock::new(ClusterMetadata::new(config.cluster_name.clone())),
            config,
            consensus,
            term: Mutex::new(0),
            key_locks: parking_lot::Mutex::new(HashMap::new()),
            storage,
            changed: Notify::new(),
        };

        let mut term = authority.term.lock().await;
        authority.recover(snapshot).await?;
        *term = leadership.term;
        drop(term);

        info!(
            "Config authority opened: primary {} term {}, config version {}",
            leadership.leader,
            leadership.term,
            authority.config_version().await
        );
        Ok(authority)
    }

    /// Commit a metadata change. Returns once a majority holds it and the
    /// change is visible to reads.
    pub async fn commit(&self, change: MetadataChange) -> Result<LogEntry, AuthorityError> {
        let lock = self.key_lock(change.lock_key());
        let _guard = lock.lock().await;

        let op = change.op_name();
        let timeout = self.config.commit_timeout;
        let since = self.config_version().await;
        match tokio::time::timeout(timeout, self.commit_locked(change.clone())).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Commit of {} timed out after {:?}", op, timeout);
                // the entry may have reached a majority before the deadline
                let landed = self
                    .abandon_uncommitted()
                    .await
                    .into_iter()
                    .find(|e| e.is_committed() && e.index > since && e.change == change);
                match landed {
                    Some(entry) => {
                        info!(
                            "Entry {} ({}) committed before the deadline",
                            entry.index, op
                        );
                        Ok(entry)
                    }
                    None => Err(AuthorityError::Timeout { op, timeout }),
                }
            }
        }
    }

    async fn commit_locked(&self, change: MetadataChange) -> Result<LogEntry, AuthorityError> {
        self.sync_leadership().await?;
        self.state.read().await.check(&change)?;

        let entry = match self.consensus.propose_and_await_majority(change).await {
            Ok(entry) => entry,
            Err(ConsensusError::PendingEntries(index)) => {
                // left by a lost leader; resolve now so a retry can go through
                self.recover(None).await?;
                return Err(ConsensusError::PendingEntries(index).into());
            }
            Err(e) => return Err(e.into()),
        };

        self.apply_committed().await?;
        self.persist().await;
        self.changed.notify_waiters();

        info!(
            "Committed entry {} ({}) in term {} with {} acks",
            entry.index,
            entry.change.op_name(),
            entry.term,
            entry.acks
        );
        Ok(entry)
    }

    /// Apply every committed entry the state has not seen yet, in log order.
    ///
    /// Commits on different namespaces can return out of index order, so a
    /// commit never applies only its own entry.
    async fn apply_committed(&self) -> Result<(), AuthorityError> {
        let log = self.consensus.local_log().await?;
        self.state.write().await.catch_up(
            log.iter()
                .filter(|e| e.is_committed())
                .map(|e| (e.index, &e.change)),
        );
        Ok(())
    }

    /// Rebuild state if the primary changed since the last rebuild
    async fn sync_leadership(&self) -> Result<Leadership, AuthorityError> {
        let leadership = self.consensus.current_leader().await?;
        let mut term = self.term.lock().await;
        if *term != leadership.term {
            info!(
                "Primary changed to {} (term {}), rebuilding metadata",
                leadership.leader, leadership.term
            );
            self.recover(None).await?;
            *term = leadership.term;
        }
        Ok(leadership)
    }

    /// Resolve pending entries on the primary's log, then rebuild state from
    /// the committed prefix.
    async fn recover(&self, snapshot: Option<ClusterMetadata>) -> Result<(), AuthorityError> {
        let majority = self.consensus.majority();
        let log = self.consensus.local_log().await?;
        for entry in log.iter().filter(|e| !e.is_committed()) {
            let acks = self.consensus.acknowledgements(entry.index).await?;
            if acks >= majority {
                self.consensus.commit_pending(entry.index).await?;
                info!(
                    "Re-proposed pending entry {} ({}): held by {} replicas",
                    entry.index,
                    entry.change.op_name(),
                    acks
                );
            } else {
                let dropped = self.consensus.discard_pending(entry.index).await?;
                warn!(
                    "Discarded {} pending entries from index {}: held by {} of {} needed",
                    dropped, entry.index, acks, majority
                );
                break;
            }
        }

        let log = self.consensus.local_log().await?;
        let committed: Vec<&LogEntry> = log.iter().filter(|e| e.is_committed()).collect();
        let last_committed = committed.last().map(|e| e.index).unwrap_or(0);
        let entries = committed.iter().copied().map(|e| (e.index, &e.change));

        let metadata = match snapshot {
            Some(mut snapshot)
                if snapshot.name == self.config.cluster_name
                    && snapshot.config_version <= last_committed =>
            {
                debug!(
                    "Catching up from snapshot at version {}",
                    snapshot.config_version
                );
                snapshot.catch_up(entries);
                snapshot
            }
            _ => ClusterMetadata::replay(self.config.cluster_name.clone(), entries),
        };

        *self.state.write().await = metadata;
        self.persist().await;
        self.changed.notify_waiters();
        info!(
            "Metadata rebuilt from {} committed entries (config version {})",
            committed.len(),
            last_committed
        );
        Ok(())
    }

    /// After a timeout: drop whatever the interrupted proposal left pending
    /// and pick up anything that did commit. Returns the log as read.
    async fn abandon_uncommitted(&self) -> Vec<LogEntry> {
        let log = match self.consensus.local_log().await {
            Ok(log) => log,
            Err(e) => {
                warn!("Cannot read log after timeout: {}", e);
                return Vec::new();
            }
        };
        if let Some(first) = log.iter().find(|e| !e.is_committed()) {
            match self.consensus.discard_pending(first.index).await {
                Ok(dropped) => warn!(
                    "Discarded {} uncommitted entries from index {}",
                    dropped, first.index
                ),
                Err(e) => warn!("Failed to discard pending entries: {}", e),
            }
        }

        let mut state = self.state.write().await;
        let before = state.config_version;
        state.catch_up(
            log.iter()
                .filter(|e| e.is_committed())
                .map(|e| (e.index, &e.change)),
        );
        if state.config_version != before {
            drop(state);
            self.persist().await;
            self.changed.notify_waiters();
        }
        log
    }

    async fn persist(&self) {
        let state = self.state.read().await;
        if let Err(e) = self.storage.save_metadata(&state).await {
            warn!("Failed to materialize metadata: {}", e);
        }
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Committed state, after picking up a primary change if one happened
    pub async fn snapshot(&self) -> ClusterMetadata {
        if let Err(e) = self.sync_leadership().await {
            debug!("Serving reads without a primary: {}", e);
        }
        self.state.read().await.clone()
    }

    pub async fn config_version(&self) -> u64 {
        self.state.read().await.config_version
    }

    pub async fn chunk_map(&self, ns: &str) -> Result<ChunkMap, AuthorityError> {
        self.snapshot()
            .await
            .chunks
            .chunk_map(ns)
            .cloned()
            .ok_or_else(|| MetadataError::NotSharded(ns.to_string()).into())
    }

    pub async fn list_chunks(&self, ns: &str) -> Result<Vec<Chunk>, AuthorityError> {
        Ok(self.chunk_map(ns).await?.chunks().to_vec())
    }

    pub async fn find_chunk(&self, ns: &str, key: &ShardKey) -> Result<Chunk, AuthorityError> {
        let state = self.state.read().await;
        Ok(state.chunks.find_chunk_containing(ns, key)?.clone())
    }

    pub async fn shards(&self) -> Vec<ShardInfo> {
        self.snapshot().await.shards.into_values().collect()
    }

    pub async fn balancer_settings(&self) -> BalancerSettings {
        self.snapshot().await.balancer
    }

    /// Persist the balancer switch
    pub async fn set_balancer_enabled(
        &self,
        enabled: bool,
    ) -> Result<BalancerSettings, AuthorityError> {
        self.commit(MetadataChange::SetBalancerEnabled {
            enabled,
            at: Utc::now(),
        })
        .await?;
        Ok(self.state.read().await.balancer.clone())
    }

    /// Count one acknowledged beacon registration. Returns the new total.
    pub async fn record_beacon_registration(&self) -> Result<u64, AuthorityError> {
        self.commit(MetadataChange::RecordBeaconRegistration { at: Utc::now() })
            .await?;
        Ok(self.state.read().await.beacon.registrations)
    }

    pub async fn members(&self) -> Vec<MemberInfo> {
        self.consensus.members().await
    }

    pub async fn beacon_payload(&self, storage_engine_read_only: bool) -> BeaconPayload {
        let leadership = self.consensus.current_leader().await.ok();
        let members = self.consensus.members().await;
        let state = self.snapshot().await;
        let stats = state.stats();
        BeaconPayload {
            cluster: state.name.clone(),
            build: BuildInfo::current(),
            storage_engine_read_only,
            primary: leadership.as_ref().map(|l| l.leader.clone()),
            term: leadership.map(|l| l.term).unwrap_or(0),
            members,
            config_version: stats.config_version,
            shards: stats.total_shards,
            sharded_collections: stats.sharded_collections,
            registrations: state.beacon.registrations,
        }
    }

    /// Notified after every commit and rebuild
    pub fn changes(&self) -> &Notify {
        &self.changed
    }
}
