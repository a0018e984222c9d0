//! Config authority
//!
//! Replicated owner of the cluster metadata. Every mutation goes through a
//! [`Consensus`] implementation and becomes visible only once a majority
//! of config replicas holds it.

mod config_authority;
mod consensus;
mod replica_set;

use std::time::Duration;

pub use config_authority::{AuthorityConfig, BeaconPayload, BuildInfo, ConfigAuthority};
pub use consensus::{
    Consensus, ConsensusError, EntryStatus, Leadership, LogEntry, MemberInfo, ReplicaId,
};
pub use replica_set::LocalReplicaSet;

use crate::error::ErrorKind;
use crate::metadata::MetadataError;
use crate::storage::StorageError;

/// Authority errors
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error("{op} not committed within {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl AuthorityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthorityError::Metadata(e) => e.kind(),
            AuthorityError::Consensus(e) => e.kind(),
            AuthorityError::Timeout { .. } => ErrorKind::QuorumUnavailable,
            AuthorityError::Storage(_) => ErrorKind::Internal,
        }
    }
}
