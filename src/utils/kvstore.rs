use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// On-disk layout of the key/value store.
#[derive(Serialize, Deserialize, Default)]
pub struct KvStoreRecord {
    pub entries: BTreeMap<String, String>,
}

/// Small persistent key/value store backed by one JSON file.
///
/// Writes are read-modify-write under a process-local lock and land through a rename.
#[derive(Debug, Clone)]
pub struct KvStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl KvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<KvStoreRecord> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(KvStoreRecord::default()),
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(record) => Ok(record),
                Err(e) => {
                    tracing::warn!(
                        "State file {} is unreadable ({}), starting empty",
                        self.path.display(),
                        e
                    );
                    Ok(KvStoreRecord::default())
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(KvStoreRecord::default()),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    async fn save(&self, record: &KvStoreRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(record)?;
        let temp = self.path.with_extension("json.partial");
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    pub async fn set_value_kv(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut record = self.load().await?;
        record.entries.insert(key.to_string(), value.to_string());
        self.save(&record).await
    }

    pub async fn get_value_kv(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        let record = self.load().await?;
        Ok(record.entries.get(key).cloned())
    }

    pub async fn remove_value_kv(&self, key: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut record = self.load().await?;
        let removed = record.entries.remove(key).is_some();
        if removed {
            self.save(&record).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_remove() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = KvStore::new(dir.path().join("state.json"));

        assert_eq!(store.get_value_kv("a").await?, None);
        store.set_value_kv("a", "1").await?;
        store.set_value_kv("b", "2").await?;
        assert_eq!(store.get_value_kv("a").await?, Some("1".to_string()));

        // A fresh handle on the same file sees persisted values
        let reopened = KvStore::new(store.path());
        assert_eq!(reopened.get_value_kv("b").await?, Some("2".to_string()));

        assert!(store.remove_value_kv("a").await?);
        assert!(!store.remove_value_kv("a").await?);
        assert_eq!(store.get_value_kv("a").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"{not json").await?;

        let store = KvStore::new(&path);
        assert_eq!(store.get_value_kv("anything").await?, None);
        store.set_value_kv("k", "v").await?;
        assert_eq!(store.get_value_kv("k").await?, Some("v".to_string()));
        Ok(())
    }
}
