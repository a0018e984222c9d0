//! Core sharding types
//!
//! Provides the shared building blocks of the sharding control plane:
//! - Shard key values and the single total order over them
//! - Chunk ranges, versions and namespaces
//! - Per-namespace chunk maps with O(log n) key lookup

pub mod chunk;
pub mod key;
pub mod routing;

// Re-export commonly used types
pub use chunk::{Chunk, ChunkId, ChunkRange, ChunkVersion, InvalidNamespace, Namespace, ShardId};
pub use key::{FieldKind, KeyError, KeyField, KeyPattern, KeyValue, ShardKey};
pub use routing::{ChunkMap, RoutingError};
