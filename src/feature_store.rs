//! Append-only line-oriented write sink for feature/prediction records
//! (spec.md §4's FeatureStore, §6 persisted state).
//!
//! Grounded on the teacher's `position/manager.rs` JSON file persistence
//! pattern, adapted from snapshot-on-save to append-per-record since the
//! contract here is a log, not a point-in-time snapshot.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// An append-only JSON-lines sink opened for the engine's lifetime.
#[derive(Clone)]
pub struct FeatureStore {
    path: PathBuf,
    file: Arc<Mutex<Option<tokio::fs::File>>>,
}

impl FeatureStore {
    /// Construct a store. The file is opened lazily on first `append`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Arc::new(Mutex::new(None)),
        }
    }

    /// Append one record as a single JSON line. Errors are returned to the
    /// caller for logging; per spec.md §5 losses under writer error are
    /// tolerated by the engine (it does not abort the event loop on this).
    pub async fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        let file = guard.as_mut().expect("file opened above");
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::FeatureLogWrite(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| Error::FeatureLogWrite(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn append_writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.log");
        let store = FeatureStore::new(&path);

        store.append(&json!({"ts": 1, "mint": "abc"})).await.unwrap();
        store.append(&json!({"ts": 2, "mint": "def"})).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["mint"], "abc");
    }

    #[tokio::test]
    async fn append_creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("features.log");
        let store = FeatureStore::new(&path);
        store.append(&json!({"ts": 1})).await.unwrap();
        assert!(path.exists());
    }
}
