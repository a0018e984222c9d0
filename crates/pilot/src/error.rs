//! Error classification
//!
//! Every layer keeps its own error enum; all of them map onto one
//! [`ErrorKind`] so callers can decide whether to retry.

use serde::{Deserialize, Serialize};

use crate::authority::AuthorityError;
use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::metadata::MetadataError;
use crate::scheduler::{MigrationError, SplitError};
use crate::storage::StorageError;

/// Error category exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad request: bad split point, missing index, unsupported key type...
    Validation,
    /// Cached routing information is older than the committed metadata
    StaleMetadata,
    /// The chunk is locked by another migration
    MigrationConflict,
    /// The config replica set could not commit within its timeout
    QuorumUnavailable,
    /// A migration aborted before commit; source ownership is intact
    PartialMigrationFailure,
    /// A data shard did not respond
    ShardUnavailable,
    /// Local I/O or an unexpected internal condition
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Validation | ErrorKind::Internal)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::StaleMetadata => "stale_metadata",
            ErrorKind::MigrationConflict => "migration_conflict",
            ErrorKind::QuorumUnavailable => "quorum_unavailable",
            ErrorKind::PartialMigrationFailure => "partial_migration_failure",
            ErrorKind::ShardUnavailable => "shard_unavailable",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

/// Errors surfaced by the [`Pilot`](crate::Pilot) facade
#[derive(Debug, thiserror::Error)]
pub enum PilotError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Authority(#[from] AuthorityError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PilotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PilotError::Metadata(e) => e.kind(),
            PilotError::Authority(e) => e.kind(),
            PilotError::Split(e) => e.kind(),
            PilotError::Migration(e) => e.kind(),
            PilotError::Engine(e) => e.kind(),
            PilotError::Storage(_) | PilotError::Config(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<ds_core::KeyError> for PilotError {
    fn from(e: ds_core::KeyError) -> Self {
        PilotError::Metadata(MetadataError::Key(e))
    }
}

impl From<ds_core::InvalidNamespace> for PilotError {
    fn from(e: ds_core::InvalidNamespace) -> Self {
        PilotError::Metadata(MetadataError::Namespace(e))
    }
}
