//! Checkpoint management for resumable consumption.
//!
//! This module persists the last binlog position a consumer has fully
//! processed, so a restarted consumer resumes after it instead of replaying
//! or skipping events.
//!
//! Checkpoints are hints: a missing, empty, corrupt or foreign checkpoint
//! file loads as "no checkpoint" and the consumer starts from the current
//! server position.
//!
//! # Example
//!
//! ```rust,no_run
//! use entity_cdc::binlog::StreamPosition;
//! use entity_cdc::checkpoint::{Checkpoint, CheckpointStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = CheckpointStore::new("var/events/db.checkpoint");
//!
//!     if let Some(checkpoint) = store.load().await? {
//!         println!("Resuming from {}", checkpoint.position);
//!     }
//!
//!     let checkpoint = Checkpoint::new(StreamPosition::new("mysql-bin.000001", 1234), 10);
//!     store.save(&checkpoint).await?;
//!
//!     Ok(())
//! }
//! ```

use crate::binlog::StreamPosition;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Version written in every checkpoint file.
pub const CHECKPOINT_VERSION: u32 = 1;

/// A recorded position in the binlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Format version of the envelope
    pub version: u32,
    /// The position after the last fully processed event
    pub position: StreamPosition,
    /// The timestamp when this checkpoint was created
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Number of events consumed by the session that wrote it
    pub event_count: u64,
}

impl Checkpoint {
    /// Creates a new checkpoint with the current timestamp.
    ///
    /// # Example
    ///
    /// ```rust
    /// use entity_cdc::binlog::StreamPosition;
    /// use entity_cdc::checkpoint::Checkpoint;
    ///
    /// let checkpoint = Checkpoint::new(StreamPosition::new("mysql-bin.000002", 4), 100);
    /// assert_eq!(checkpoint.position.file, "mysql-bin.000002");
    /// assert_eq!(checkpoint.event_count, 100);
    /// ```
    pub fn new(position: StreamPosition, event_count: u64) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            position,
            timestamp: chrono::Utc::now(),
            event_count,
        }
    }
}

/// Reads and writes the checkpoint file of one consumer.
///
/// A store built without a path keeps nothing: `load` finds no checkpoint
/// and `save` does nothing.
///
/// Two consumers must not share a checkpoint file. Nothing locks the file;
/// concurrent writers would overwrite each other's positions.
#[derive(Debug, Clone, Default)]
pub struct CheckpointStore {
    file_path: Option<PathBuf>,
}

impl CheckpointStore {
    /// Creates a store writing to `checkpoint_path`.
    ///
    /// ```rust
    /// use entity_cdc::checkpoint::CheckpointStore;
    ///
    /// let store = CheckpointStore::new("checkpoint.json");
    /// assert!(store.path().is_some());
    /// ```
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: Some(checkpoint_path.as_ref().to_path_buf()),
        }
    }

    pub fn disabled() -> Self {
        Self { file_path: None }
    }

    pub fn from_path(checkpoint_path: Option<PathBuf>) -> Self {
        Self {
            file_path: checkpoint_path,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Loads the checkpoint if one can be read.
    ///
    /// Returns `None` without error when no path is configured, the file
    /// does not exist, or its content is not a checkpoint of the supported
    /// version. Undecodable files are logged as warnings.
    ///
    /// # Errors
    ///
    /// Returns `Err` only if the file exists but cannot be read.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        let Some(path) = &self.file_path else {
            return Ok(None);
        };

        let content = match fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No checkpoint file found at {:?}", path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match decode(&content) {
            Ok(checkpoint) => {
                info!(
                    "Loaded checkpoint: position={}, timestamp={}",
                    checkpoint.position, checkpoint.timestamp
                );
                Ok(Some(checkpoint))
            }
            Err(reason) => {
                warn!("Ignoring invalid checkpoint file {:?}: {}", path, reason);
                Ok(None)
            }
        }
    }

    /// Saves the checkpoint atomically.
    ///
    /// The checkpoint is written to a temporary file next to the target,
    /// synced, then renamed over the target, so a reader sees either the
    /// previous or the new checkpoint, never a partial one. Missing parent
    /// directories are created.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };

        debug!("Saving checkpoint: position={}", checkpoint.position);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = temp_path(path);
        let json = serde_json::to_string_pretty(checkpoint)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, path).await?;

        debug!("Checkpoint saved successfully");
        Ok(())
    }

    /// Deletes the checkpoint file if it exists.
    ///
    /// The next consumer on this store starts from the current server
    /// position.
    pub async fn delete(&self) -> Result<()> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };

        match fs::remove_file(path).await {
            Ok(()) => {
                info!("Deleted checkpoint file {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn decode(content: &[u8]) -> std::result::Result<Checkpoint, String> {
    let value: Value = serde_json::from_slice(content).map_err(|e| e.to_string())?;

    match value.get("version").and_then(Value::as_u64) {
        Some(v) if v == u64::from(CHECKPOINT_VERSION) => {}
        Some(v) => return Err(format!("unsupported checkpoint version {}", v)),
        None => return Err("missing checkpoint version".to_string()),
    }

    serde_json::from_value(value).map_err(|e| e.to_string())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("checkpoint"));
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_checkpoint_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path().join("checkpoint.json"));

        assert!(store.load().await.unwrap().is_none());

        let checkpoint = Checkpoint::new(StreamPosition::new("mysql-bin.000001", 1234), 100);
        store.save(&checkpoint).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.position, StreamPosition::new("mysql-bin.000001", 1234));
        assert_eq!(loaded.event_count, 100);
    }

    #[tokio::test]
    async fn test_checkpoint_atomic_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("checkpoint.json");
        let store = CheckpointStore::new(&path);

        store
            .save(&Checkpoint::new(StreamPosition::new("mysql-bin.000001", 50), 1))
            .await
            .unwrap();
        store
            .save(&Checkpoint::new(StreamPosition::new("mysql-bin.000002", 150), 2))
            .await
            .unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.position.file, "mysql-bin.000002");
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_save_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("var").join("events").join("db");
        let store = CheckpointStore::new(&path);

        store
            .save(&Checkpoint::new(StreamPosition::new("mysql-bin.000001", 4), 0))
            .await
            .unwrap();

        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_disabled_store_keeps_nothing() {
        let store = CheckpointStore::disabled();

        store
            .save(&Checkpoint::new(StreamPosition::new("mysql-bin.000001", 4), 0))
            .await
            .unwrap();
        assert!(store.load().await.unwrap().is_none());
        store.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_content_loads_as_none() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("checkpoint.json");
        let store = CheckpointStore::new(&path);

        let contents: [&[u8]; 6] = [
            b"",
            b"not json at all",
            &[0xff, 0xfe, 0x00, 0x9f, 0x92],
            br#"{"file": "mysql-bin.000001", "position": 4}"#,
            br#"{"version": 99, "position": {"file": "mysql-bin.000001", "position": 4}}"#,
            br#"{"version": 1, "position": "garbage"}"#,
        ];

        for content in contents {
            std::fs::write(&path, content).unwrap();
            assert!(store.load().await.unwrap().is_none(), "content: {:?}", content);
        }
    }

    #[tokio::test]
    async fn test_delete_removes_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path().join("checkpoint.json"));

        store
            .save(&Checkpoint::new(StreamPosition::new("mysql-bin.000001", 4), 0))
            .await
            .unwrap();
        store.delete().await.unwrap();
        store.delete().await.unwrap();

        assert!(store.load().await.unwrap().is_none());
    }

    #[test]
    fn test_temp_path_keeps_directory() {
        let path = Path::new("/var/lib/events/db.checkpoint");
        assert_eq!(temp_path(path), PathBuf::from("/var/lib/events/db.checkpoint.tmp"));
    }
}
