//! Chunk migration
//!
//! `Planned -> Prepared -> Committed`, or `Aborted` on any failure before
//! the commit. Ownership only changes through the authority commit, so an
//! aborted or retried migration never leaves two owners.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use ds_core::{Chunk, ChunkId, ChunkRange, KeyPattern, ShardId};

use crate::authority::{AuthorityError, ConfigAuthority};
use crate::config::MigrationConfig;
use crate::engine::{EngineError, StorageEngine};
use crate::error::ErrorKind;
use crate::metadata::{MetadataChange, MetadataError};

/// Migration errors
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Chunk {chunk} is already being migrated by {ticket}")]
    Conflict { chunk: ChunkId, ticket: String },
    #[error("Transfer of {chunk} failed: {source}")]
    Transfer {
        chunk: ChunkId,
        #[source]
        source: EngineError,
    },
    #[error("Transfer of {0} timed out")]
    TransferTimeout(ChunkId),
    #[error("Migration {0} was cancelled")]
    Cancelled(String),
    #[error("Migration ticket {0} not found")]
    TicketNotFound(String),
    #[error("Migration ticket {0} already finished")]
    TicketFinished(String),
    #[error(transparent)]
    Authority(#[from] AuthorityError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

impl MigrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::Conflict { .. } => ErrorKind::MigrationConflict,
            MigrationError::Transfer { .. }
            | MigrationError::TransferTimeout(_)
            | MigrationError::Cancelled(_) => ErrorKind::PartialMigrationFailure,
            MigrationError::TicketNotFound(_) | MigrationError::TicketFinished(_) => {
                ErrorKind::Validation
            }
            MigrationError::Authority(e) => e.kind(),
            MigrationError::Metadata(e) => e.kind(),
        }
    }
}

/// Migration phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationPhase {
    /// Chunk locked, nothing copied yet
    Planned,
    /// Destination holds a full copy
    Prepared,
    /// Ownership transferred
    Committed,
    /// Gave up before commit; source still owns the chunk
    Aborted,
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationPhase::Planned => write!(f, "planned"),
            MigrationPhase::Prepared => write!(f, "prepared"),
            MigrationPhase::Committed => write!(f, "committed"),
            MigrationPhase::Aborted => write!(f, "aborted"),
        }
    }
}

/// Migration ticket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationTicket {
    pub id: String,
    pub ns: String,
    pub chunk_id: ChunkId,
    pub range: ChunkRange,
    pub from: ShardId,
    pub to: ShardId,
    pub phase: MigrationPhase,
    /// Documents copied to the destination
    pub documents: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl MigrationTicket {
    fn new(chunk: &Chunk, to: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ns: chunk.ns.clone(),
            chunk_id: chunk.id.clone(),
            range: chunk.range.clone(),
            from: chunk.shard.clone(),
            to: to.to_string(),
            phase: MigrationPhase::Planned,
            documents: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
            error: None,
        }
    }

    fn set_phase(&mut self, phase: MigrationPhase) {
        self.phase = phase;
        self.updated_at = Utc::now();
        if self.is_finished() {
            self.finished_at = Some(self.updated_at);
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.phase,
            MigrationPhase::Committed | MigrationPhase::Aborted
        )
    }
}

type LockKey = (String, ChunkId);

/// Held for the lifetime of one migration
struct ChunkLock<'a> {
    locks: &'a Mutex<HashMap<LockKey, String>>,
    key: LockKey,
}

impl Drop for ChunkLock<'_> {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.key);
    }
}

/// Migration coordinator
pub struct MigrationCoordinator {
    config: MigrationConfig,
    authority: Arc<ConfigAuthority>,
    engine: Arc<dyn StorageEngine>,
    tickets: RwLock<HashMap<String, MigrationTicket>>,
    /// (ns, chunk) -> ticket holding it
    locks: Mutex<HashMap<LockKey, String>>,
    cancelled: Mutex<HashSet<String>>,
    /// Held shared by document writes, exclusively to drain them
    write_gate: tokio::sync::RwLock<()>,
}

impl MigrationCoordinator {
    pub fn new(
        config: MigrationConfig,
        authority: Arc<ConfigAuthority>,
        engine: Arc<dyn StorageEngine>,
    ) -> Self {
        Self {
            config,
            authority,
            engine,
            tickets: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            write_gate: tokio::sync::RwLock::new(()),
        }
    }

    /// Move one chunk to `to` and wait for the outcome
    pub async fn move_chunk(
        &self,
        ns: &str,
        chunk_id: &str,
        to: &str,
    ) -> Result<MigrationTicket, MigrationError> {
        let state = self.authority.snapshot().await;
        let chunk = state.chunks.chunk(ns, chunk_id)?.clone();
        let pattern = state.collection(ns)?.key_pattern.clone();
        let destination = state.shard(to)?;
        if !destination.is_up() {
            return Err(MetadataError::ShardDown(to.to_string()).into());
        }
        drop(state);

        let mut ticket = MigrationTicket::new(&chunk, to);
        let _lock = self.lock_chunk(ns, chunk_id, &ticket.id)?;

        if chunk.shard == to {
            info!("Chunk {} already lives on {}", chunk_id, to);
            ticket.set_phase(MigrationPhase::Committed);
            self.record(&ticket);
            return Ok(ticket);
        }

        // writes that passed the lock check before it was taken land first
        drop(self.write_gate.write().await);

        self.record(&ticket);
        info!(
            "Migration {} planned: {} {} {} -> {}",
            ticket.id, ns, chunk.range, chunk.shard, to
        );

        match self.run(&mut ticket, &chunk, &pattern).await {
            Ok(()) => {
                self.finish(&mut ticket, MigrationPhase::Committed, None);
                info!("Migration {} committed", ticket.id);
                self.cleanup_source(&chunk, &pattern).await;
                Ok(ticket)
            }
            Err(e) => {
                warn!("Migration {} aborted: {}", ticket.id, e);
                self.discard_destination(&ticket, &pattern).await;
                self.finish(&mut ticket, MigrationPhase::Aborted, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        ticket: &mut MigrationTicket,
        chunk: &Chunk,
        pattern: &KeyPattern,
    ) -> Result<(), MigrationError> {
        self.check_cancelled(&ticket.id)?;

        let transfer = async {
            // leftovers of an earlier aborted attempt
            self.engine
                .delete_range(&ticket.to, &ticket.ns, pattern, &ticket.range)
                .await?;
            let docs = self
                .engine
                .read_range(&chunk.shard, &ticket.ns, pattern, &ticket.range)
                .await?;
            let written = self
                .engine
                .write_documents(&ticket.to, &ticket.ns, docs)
                .await?;
            Ok::<_, EngineError>(written)
        };
        let documents = match tokio::time::timeout(self.config.transfer_timeout(), transfer).await
        {
            Ok(Ok(documents)) => documents,
            Ok(Err(source)) => {
                return Err(MigrationError::Transfer {
                    chunk: chunk.id.clone(),
                    source,
                })
            }
            Err(_) => return Err(MigrationError::TransferTimeout(chunk.id.clone())),
        };

        ticket.documents = documents;
        ticket.set_phase(MigrationPhase::Prepared);
        self.record(ticket);
        debug!(
            "Migration {} prepared: {} documents on {}",
            ticket.id, documents, ticket.to
        );

        self.check_cancelled(&ticket.id)?;

        // rejected if a split or another move touched the chunk since the copy
        let change = MetadataChange::MigrateChunk {
            ns: ticket.ns.clone(),
            chunk_id: ticket.chunk_id.clone(),
            range: ticket.range.clone(),
            from: ticket.from.clone(),
            to: ticket.to.clone(),
        };
        self.authority.commit(change).await?;
        Ok(())
    }

    async fn cleanup_source(&self, chunk: &Chunk, pattern: &KeyPattern) {
        match self
            .engine
            .delete_range(&chunk.shard, &chunk.ns, pattern, &chunk.range)
            .await
        {
            Ok(removed) => debug!("Removed {} documents of {} from {}", removed, chunk.id, chunk.shard),
            Err(e) => warn!(
                "Failed to clean up {} on {}: {}",
                chunk.id, chunk.shard, e
            ),
        }
    }

    async fn discard_destination(&self, ticket: &MigrationTicket, pattern: &KeyPattern) {
        if let Err(e) = self
            .engine
            .delete_range(&ticket.to, &ticket.ns, pattern, &ticket.range)
            .await
        {
            warn!(
                "Failed to discard copy of {} on {}: {}",
                ticket.chunk_id, ticket.to, e
            );
        }
    }

    fn lock_chunk(
        &self,
        ns: &str,
        chunk_id: &str,
        ticket_id: &str,
    ) -> Result<ChunkLock<'_>, MigrationError> {
        let key = (ns.to_string(), chunk_id.to_string());
        let mut locks = self.locks.lock();
        if let Some(holder) = locks.get(&key) {
            return Err(MigrationError::Conflict {
                chunk: chunk_id.to_string(),
                ticket: holder.clone(),
            });
        }
        locks.insert(key.clone(), ticket_id.to_string());
        Ok(ChunkLock {
            locks: &self.locks,
            key,
        })
    }

    /// Whether a migration currently holds the chunk
    /// Shared permit for one document write. Take it before resolving the
    /// target chunk and hold it until the write is applied; a migration
    /// waits for outstanding permits once its chunk is locked.
    pub async fn write_permit(&self) -> tokio::sync::RwLockReadGuard<'_, ()> {
        self.write_gate.read().await
    }

    pub fn is_locked(&self, ns: &str, chunk_id: &str) -> bool {
        self.locks
            .lock()
            .contains_key(&(ns.to_string(), chunk_id.to_string()))
    }

    fn check_cancelled(&self, ticket_id: &str) -> Result<(), MigrationError> {
        if self.cancelled.lock().remove(ticket_id) {
            return Err(MigrationError::Cancelled(ticket_id.to_string()));
        }
        Ok(())
    }

    fn record(&self, ticket: &MigrationTicket) {
        self.tickets.write().insert(ticket.id.clone(), ticket.clone());
    }

    fn finish(&self, ticket: &mut MigrationTicket, phase: MigrationPhase, error: Option<String>) {
        ticket.error = error;
        ticket.set_phase(phase);
        self.record(ticket);
        self.cancelled.lock().remove(&ticket.id);
        self.cleanup(self.config.history_size);
    }

    /// Request cancellation of an active migration. Takes effect at the
    /// next phase boundary before the commit.
    pub fn cancel(&self, ticket_id: &str) -> Result<MigrationTicket, MigrationError> {
        let ticket = self
            .ticket(ticket_id)
            .ok_or_else(|| MigrationError::TicketNotFound(ticket_id.to_string()))?;
        if ticket.is_finished() {
            return Err(MigrationError::TicketFinished(ticket_id.to_string()));
        }
        self.cancelled.lock().insert(ticket_id.to_string());
        info!("Cancellation requested for migration {}", ticket_id);
        Ok(ticket)
    }

    pub fn ticket(&self, ticket_id: &str) -> Option<MigrationTicket> {
        self.tickets.read().get(ticket_id).cloned()
    }

    pub fn active_tickets(&self) -> Vec<MigrationTicket> {
        self.tickets
            .read()
            .values()
            .filter(|t| !t.is_finished())
            .cloned()
            .collect()
    }

    /// Every known ticket, oldest first
    pub fn tickets(&self) -> Vec<MigrationTicket> {
        let mut tickets: Vec<_> = self.tickets.read().values().cloned().collect();
        tickets.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tickets
    }

    /// Keep the `keep_count` most recently finished tickets
    pub fn cleanup(&self, keep_count: usize) {
        let mut tickets = self.tickets.write();

        let mut finished: Vec<_> = tickets
            .values()
            .filter(|t| t.is_finished())
            .map(|t| (t.finished_at, t.id.clone()))
            .collect();
        finished.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, id) in finished.into_iter().skip(keep_count) {
            tickets.remove(&id);
        }
    }
}
