//! Consensus collaborator interface
//!
//! The authority only needs leader identity, majority-acknowledged
//! proposals and access to the leader's log for recovery. How replicas are
//! elected is up to the implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::metadata::MetadataChange;
use crate::storage::StorageError;

/// Config replica ID
pub type ReplicaId = String;

/// Consensus errors
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("No quorum: {up} replicas available, {needed} needed")]
    NoQuorum { up: usize, needed: usize },
    #[error("Leader {0} lost before commit")]
    LeaderLost(ReplicaId),
    #[error("Log has unresolved pending entries from index {0}")]
    PendingEntries(u64),
    #[error("Log entry {0} not found")]
    EntryNotFound(u64),
    #[error("Replica {0} not found")]
    ReplicaNotFound(ReplicaId),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ConsensusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsensusError::NoQuorum { .. }
            | ConsensusError::LeaderLost(_)
            | ConsensusError::PendingEntries(_) => ErrorKind::QuorumUnavailable,
            ConsensusError::EntryNotFound(_) | ConsensusError::ReplicaNotFound(_) => {
                ErrorKind::Validation
            }
            ConsensusError::Storage(_) => ErrorKind::Internal,
        }
    }
}

/// Log entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Appended but not yet acknowledged by a majority
    Pending,
    /// Durable on a majority of replicas
    Committed,
}

/// Replicated log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub change: MetadataChange,
    /// Replicas holding the entry when it was committed
    pub acks: usize,
    pub status: EntryStatus,
}

impl LogEntry {
    pub fn is_committed(&self) -> bool {
        self.status == EntryStatus::Committed
    }
}

/// Current leader and its term
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leadership {
    pub leader: ReplicaId,
    pub term: u64,
}

/// Replica status, as reported to the beacon and the admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: ReplicaId,
    pub priority: u32,
    pub up: bool,
    pub is_leader: bool,
    pub last_index: u64,
    pub committed_index: u64,
}

/// Leader election and majority replication
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Current leader, electing one if needed
    async fn current_leader(&self) -> Result<Leadership, ConsensusError>;

    /// Append `change` to the log and wait until a majority holds it
    async fn propose_and_await_majority(
        &self,
        change: MetadataChange,
    ) -> Result<LogEntry, ConsensusError>;

    /// The leader's log, committed and pending entries
    async fn local_log(&self) -> Result<Vec<LogEntry>, ConsensusError>;

    /// Number of live replicas holding the leader's entry at `index`
    async fn acknowledgements(&self, index: u64) -> Result<usize, ConsensusError>;

    /// Mark a pending entry committed and replicate it to every live replica
    async fn commit_pending(&self, index: u64) -> Result<LogEntry, ConsensusError>;

    /// Drop pending entries at or after `from_index`. Returns how many the
    /// leader dropped.
    async fn discard_pending(&self, from_index: u64) -> Result<usize, ConsensusError>;

    async fn members(&self) -> Vec<MemberInfo>;

    /// Acknowledgements required to commit
    fn majority(&self) -> usize;
}
