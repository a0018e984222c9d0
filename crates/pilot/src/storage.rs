//! File persistent storage
//!
//! Each config replica keeps its change log in `oplog.json`; the config
//! server materializes committed state into `shards.json`, `chunks.json`,
//! `settings.json` and `catalog.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::authority::LogEntry;
use crate::metadata::{
    BalancerSettings, BeaconCounters, ChunkMetadataStore, ClusterMetadata, CollectionInfo,
    DatabaseInfo, ShardId, ShardInfo,
};

const OPLOG_FILE: &str = "oplog.json";
const SHARDS_FILE: &str = "shards.json";
const CHUNKS_FILE: &str = "chunks.json";
const SETTINGS_FILE: &str = "settings.json";
const CATALOG_FILE: &str = "catalog.json";

/// Storage error
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Document written to each materialized file. The version lets a reader
/// detect a snapshot torn by a crash between file writes.
#[derive(Serialize, Deserialize)]
struct Versioned<T> {
    config_version: u64,
    data: T,
}

#[derive(Serialize, Deserialize)]
struct SettingsDoc<B, C> {
    name: String,
    balancer: B,
    beacon: C,
}

#[derive(Serialize, Deserialize)]
struct CatalogDoc<D, C> {
    databases: D,
    collections: C,
}

/// File storage
#[derive(Debug, Clone)]
pub struct FileStorage {
    /// Data directory
    data_dir: PathBuf,
}

impl FileStorage {
    /// Create file storage
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Ensure data directory exists
    pub async fn ensure_dir(&self) -> Result<(), StorageError> {
        if !fs::try_exists(&self.data_dir).await? {
            fs::create_dir_all(&self.data_dir).await?;
            info!("Created data directory: {:?}", self.data_dir);
        }
        Ok(())
    }

    async fn load_json<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>, StorageError> {
        let path = self.data_dir.join(file);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        let value = serde_json::from_str(&content)
            .map_err(|e| StorageError::Serialization(format!("{:?}: {}", path, e)))?;
        Ok(Some(value))
    }

    async fn save_json<T: Serialize>(&self, file: &str, value: &T) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        // Write to temp file first, then atomically rename
        let path = self.data_dir.join(file);
        let temp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    /// Load the replica log, empty if never written
    pub async fn load_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        let log: Vec<LogEntry> = self.load_json(OPLOG_FILE).await?.unwrap_or_default();
        debug!("Loaded {} log entries from {:?}", log.len(), self.data_dir);
        Ok(log)
    }

    /// Save the replica log
    pub async fn save_log(&self, log: &[LogEntry]) -> Result<(), StorageError> {
        self.save_json(OPLOG_FILE, &log).await
    }

    /// Materialize committed metadata
    pub async fn save_metadata(&self, metadata: &ClusterMetadata) -> Result<(), StorageError> {
        let version = metadata.config_version;
        self.save_json(
            SHARDS_FILE,
            &Versioned {
                config_version: version,
                data: &metadata.shards,
            },
        )
        .await?;
        self.save_json(
            CHUNKS_FILE,
            &Versioned {
                config_version: version,
                data: &metadata.chunks,
            },
        )
        .await?;
        self.save_json(
            CATALOG_FILE,
            &Versioned {
                config_version: version,
                data: CatalogDoc {
                    databases: &metadata.databases,
                    collections: &metadata.collections,
                },
            },
        )
        .await?;
        // settings last: its version marks the snapshot as complete
        self.save_json(
            SETTINGS_FILE,
            &Versioned {
                config_version: version,
                data: SettingsDoc {
                    name: metadata.name.clone(),
                    balancer: &metadata.balancer,
                    beacon: &metadata.beacon,
                },
            },
        )
        .await?;

        debug!("Saved cluster metadata: config version {}", version);
        Ok(())
    }

    /// Load materialized metadata. Returns `None` when absent or torn.
    pub async fn load_metadata(&self) -> Result<Option<ClusterMetadata>, StorageError> {
        let settings: Option<Versioned<SettingsDoc<BalancerSettings, BeaconCounters>>> =
            self.load_json(SETTINGS_FILE).await?;
        let shards: Option<Versioned<BTreeMap<ShardId, ShardInfo>>> =
            self.load_json(SHARDS_FILE).await?;
        let chunks: Option<Versioned<ChunkMetadataStore>> = self.load_json(CHUNKS_FILE).await?;
        let catalog: Option<
            Versioned<CatalogDoc<BTreeMap<String, DatabaseInfo>, BTreeMap<String, CollectionInfo>>>,
        > = self.load_json(CATALOG_FILE).await?;

        let (Some(settings), Some(shards), Some(chunks), Some(catalog)) =
            (settings, shards, chunks, catalog)
        else {
            return Ok(None);
        };

        let version = settings.config_version;
        if [shards.config_version, chunks.config_version, catalog.config_version]
            .iter()
            .any(|v| *v != version)
        {
            warn!(
                "Ignoring torn metadata snapshot in {:?} (settings at {})",
                self.data_dir, version
            );
            return Ok(None);
        }

        let metadata = ClusterMetadata {
            name: settings.data.name,
            shards: shards.data,
            databases: catalog.data.databases,
            collections: catalog.data.collections,
            chunks: chunks.data,
            balancer: settings.data.balancer,
            beacon: settings.data.beacon,
            config_version: version,
        };
        info!(
            "Loaded cluster metadata: {} shards, {} collections, config version {}",
            metadata.shards.len(),
            metadata.collections.len(),
            version
        );
        Ok(Some(metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataChange;
    use chrono::Utc;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("pilot_storage_test_{}", uuid::Uuid::new_v4()))
    }

    fn sample() -> ClusterMetadata {
        let mut metadata = ClusterMetadata::new("test-cluster".into());
        metadata
            .apply_entry(
                1,
                &MetadataChange::AddShard {
                    id: "shard0000".into(),
                    host: "localhost:20000".into(),
                    at: Utc::now(),
                },
            )
            .unwrap();
        metadata
            .apply_entry(2, &MetadataChange::RecordBeaconRegistration { at: Utc::now() })
            .unwrap();
        metadata
    }

    #[tokio::test]
    async fn test_save_and_load_metadata() {
        let dir = temp_dir();
        let storage = FileStorage::new(&dir);
        assert!(storage.load_metadata().await.unwrap().is_none());

        let metadata = sample();
        storage.save_metadata(&metadata).await.unwrap();

        // Reloading should get same data
        let loaded = storage.load_metadata().await.unwrap().unwrap();
        assert_eq!(loaded, metadata);
        assert!(dir.join("shards.json").exists());
        assert!(dir.join("chunks.json").exists());

        // Cleanup
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_torn_snapshot_ignored() {
        let dir = temp_dir();
        let storage = FileStorage::new(&dir);
        let mut metadata = sample();
        storage.save_metadata(&metadata).await.unwrap();

        metadata.config_version = 7;
        storage
            .save_json(
                SETTINGS_FILE,
                &Versioned {
                    config_version: 7,
                    data: SettingsDoc {
                        name: metadata.name.clone(),
                        balancer: &metadata.balancer,
                        beacon: &metadata.beacon,
                    },
                },
            )
            .await
            .unwrap();
        assert!(storage.load_metadata().await.unwrap().is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_missing_log_is_empty() {
        let dir = temp_dir();
        let storage = FileStorage::new(&dir);
        assert!(storage.load_log().await.unwrap().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
