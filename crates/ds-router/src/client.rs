//! Config server client
//!
//! Fetches routing tables from the pilot HTTP API

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use ds_core::ChunkMap;

use crate::router::{MetadataSource, RouterError};

/// Config client configuration
#[derive(Debug, Clone)]
pub struct ConfigClientConfig {
    /// Pilot base URL, e.g. `http://127.0.0.1:8080`
    pub base_url: String,
    pub request_timeout: Duration,
}

impl Default for ConfigClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// HTTP metadata source
pub struct ConfigClient {
    config: ConfigClientConfig,
    http_client: reqwest::Client,
}

impl ConfigClient {
    pub fn new(config: ConfigClientConfig) -> Result<Self, RouterError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            config,
            http_client,
        })
    }

    /// Get the routing table of `ns`
    pub async fn chunk_map(&self, ns: &str) -> Result<ChunkMap, RouterError> {
        let url = format!("{}/api/v1/routing", self.config.base_url);
        let resp: ApiResponse<ChunkMap> = self
            .http_client
            .get(&url)
            .query(&[("ns", ns)])
            .send()
            .await?
            .json()
            .await?;

        if !resp.success {
            return Err(RouterError::Source(
                resp.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        let map = resp
            .data
            .ok_or_else(|| RouterError::Source("empty routing response".to_string()))?;
        debug!(
            "Fetched routing table for {}: {} chunks at {}",
            ns,
            map.len(),
            map.collection_version
        );
        Ok(map)
    }
}

#[async_trait]
impl MetadataSource for ConfigClient {
    async fn fetch_chunk_map(&self, ns: &str) -> Result<ChunkMap, RouterError> {
        self.chunk_map(ns).await
    }
}
