//! Cluster metadata definitions
//!
//! Contains the shard registry, the database/collection catalog, chunk
//! layouts and the replicated change log commands that mutate them.

mod catalog;
mod change;
mod chunks;
mod cluster;
mod settings;
mod shard;

pub use catalog::{CollectionInfo, DatabaseInfo};
pub use change::MetadataChange;
pub use chunks::{presplit_hashed, ChunkMetadataStore, MAX_INITIAL_CHUNKS};
pub use cluster::{ClusterMetadata, ClusterStats};
pub use settings::{BalancerSettings, BeaconCounters};
pub use shard::{ShardId, ShardInfo, ShardState};

use ds_core::{InvalidNamespace, KeyError, RoutingError};

use crate::error::ErrorKind;

/// Metadata validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Namespace(#[from] InvalidNamespace),
    #[error("Namespace {0} is already sharded")]
    AlreadySharded(String),
    #[error("Namespace {0} is not sharded")]
    NotSharded(String),
    #[error("Chunk {chunk} not found in {ns}")]
    ChunkNotFound { ns: String, chunk: String },
    #[error("Invalid split point {point} for {ns}: {reason}")]
    InvalidSplitPoint {
        ns: String,
        point: String,
        reason: String,
    },
    #[error("Chunk {chunk} is owned by {actual}, not {expected}")]
    OwnershipMismatch {
        chunk: String,
        expected: String,
        actual: String,
    },
    #[error("Chunk {chunk} now covers {actual}, not {expected}")]
    ChunkChanged {
        chunk: String,
        expected: String,
        actual: String,
    },
    #[error("Shard {0} not found")]
    ShardNotFound(String),
    #[error("Shard {0} already exists")]
    ShardExists(String),
    #[error("Shard {0} is down")]
    ShardDown(String),
    #[error("No shard is available")]
    NoShards,
    #[error("Database {0} not found")]
    DatabaseNotFound(String),
    #[error("Sharding is not enabled for database {0}")]
    ShardingNotEnabled(String),
    #[error("No index supports shard key {key} on {ns}")]
    MissingIndex { ns: String, key: String },
    #[error("Invalid option: {0}")]
    InvalidOption(String),
    #[error("Invalid chunk layout: {0}")]
    Layout(RoutingError),
}

impl MetadataError {
    pub(crate) fn chunk_not_found(ns: &str, chunk: &str) -> Self {
        MetadataError::ChunkNotFound {
            ns: ns.to_string(),
            chunk: chunk.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MetadataError::ChunkChanged { .. } => ErrorKind::StaleMetadata,
            MetadataError::ShardDown(_) | MetadataError::NoShards => ErrorKind::ShardUnavailable,
            _ => ErrorKind::Validation,
        }
    }
}

impl From<RoutingError> for MetadataError {
    fn from(e: RoutingError) -> Self {
        match e {
            RoutingError::Key(e) => MetadataError::Key(e),
            other => MetadataError::Layout(other),
        }
    }
}
