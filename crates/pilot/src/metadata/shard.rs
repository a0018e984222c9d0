//! Shard registry entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use ds_core::ShardId;

/// Shard liveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardState {
    /// Serving requests, eligible for chunks
    Up,
    /// Heartbeat lost or stopped by an operator
    Down,
}

impl Default for ShardState {
    fn default() -> Self {
        Self::Up
    }
}

impl std::fmt::Display for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardState::Up => write!(f, "up"),
            ShardState::Down => write!(f, "down"),
        }
    }
}

/// Shard information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Shard ID
    pub id: ShardId,
    /// Connection endpoint (host:port)
    pub host: String,
    /// Liveness state
    pub state: ShardState,
    /// Time the shard was added to the cluster
    pub added_at: DateTime<Utc>,
}

impl ShardInfo {
    pub fn new(id: ShardId, host: String, added_at: DateTime<Utc>) -> Self {
        Self {
            id,
            host,
            state: ShardState::Up,
            added_at,
        }
    }

    pub fn is_up(&self) -> bool {
        self.state == ShardState::Up
    }
}
