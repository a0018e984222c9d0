//! Range router
//!
//! Client-side routing over a cached copy of the chunk metadata. Shards
//! reject requests carrying an outdated chunk version; the router then
//! refreshes the namespace and retries.

pub mod client;
pub mod router;

pub use client::{ConfigClient, ConfigClientConfig};
pub use router::{
    MetadataSource, RangeRouter, Route, RouterConfig, RouterError, ShardError, ShardExecutor,
    ShardOp, ShardRequest,
};
