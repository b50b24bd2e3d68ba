pub mod gcs;
pub mod local;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub use gcs::GcsStore;
pub use local::LocalStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{backend} returned status {status} for {key}")]
    Status {
        backend: String,
        key: String,
        status: u16,
    },

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Malformed response from {backend}: {message}")]
    Malformed { backend: String, message: String },

    #[error("No storage backend available for {0}")]
    Unavailable(String),
}

/// One entry of a `list` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// The storage providers the pipeline knows about, picked at startup from configuration.
#[derive(Debug, Clone)]
pub enum StorageBackend {
    Local(LocalStore),
    Gcs(GcsStore),
}

impl StorageBackend {
    pub fn name(&self) -> &str {
        match self {
            StorageBackend::Local(store) => store.name(),
            StorageBackend::Gcs(store) => store.name(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, StorageBackend::Gcs(_))
    }

    pub async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        match self {
            StorageBackend::Local(store) => store.put(key, bytes).await,
            StorageBackend::Gcs(store) => store.put(key, bytes).await,
        }
    }

    /// `Ok(None)` means the key is absent. Transport failures are errors.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self {
            StorageBackend::Local(store) => store.get(key).await,
            StorageBackend::Gcs(store) => store.get(key).await,
        }
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        match self {
            StorageBackend::Local(store) => store.list(prefix).await,
            StorageBackend::Gcs(store) => store.list(prefix).await,
        }
    }

    /// Returns whether something was deleted.
    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        match self {
            StorageBackend::Local(store) => store.delete(key).await,
            StorageBackend::Gcs(store) => store.delete(key).await,
        }
    }
}

/// Outcome of writing one key to every backend in a chain.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PutReport {
    pub acknowledged: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub primary_acknowledged: bool,
}

impl PutReport {
    pub fn any_acknowledged(&self) -> bool {
        !self.acknowledged.is_empty()
    }
}

/// Backends in read-precedence order. The first entry is the authoritative store.
#[derive(Debug, Clone, Default)]
pub struct StorageChain {
    backends: Vec<StorageBackend>,
}

impl StorageChain {
    pub fn new(backends: Vec<StorageBackend>) -> Self {
        Self { backends }
    }

    pub fn backends(&self) -> &[StorageBackend] {
        &self.backends
    }

    pub fn primary(&self) -> Option<&StorageBackend> {
        self.backends.first()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    /// Writes `bytes` to every backend. A failing backend does not stop the others.
    pub async fn put_all(&self, key: &str, bytes: &[u8]) -> PutReport {
        let mut report = PutReport::default();

        for (idx, backend) in self.backends.iter().enumerate() {
            match backend.put(key, bytes).await {
                Ok(()) => {
                    tracing::debug!("Stored {} on {}", key, backend.name());
                    report.acknowledged.push(backend.name().to_string());
                    if idx == 0 {
                        report.primary_acknowledged = true;
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to store {} on {}: {}", key, backend.name(), e);
                    report.failed.push((backend.name().to_string(), e.to_string()));
                }
            }
        }

        report
    }

    /// True if any backend currently holds `key`.
    ///
    /// `false` is only returned when every backend answered. A backend that
    /// errors may still hold the object, so absence cannot be claimed.
    pub async fn exists_anywhere(&self, key: &str) -> Result<bool, StorageError> {
        let mut unanswered = false;

        for backend in &self.backends {
            match backend.get(key).await {
                Ok(Some(_)) => return Ok(true),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Could not check {} on {}: {}", key, backend.name(), e);
                    unanswered = true;
                }
            }
        }

        if unanswered || self.backends.is_empty() {
            Err(StorageError::Unavailable(key.to_string()))
        } else {
            Ok(false)
        }
    }

    /// Lists from the first backend that answers.
    pub async fn list_first(&self, prefix: &str) -> Result<(String, Vec<ObjectInfo>), StorageError> {
        for backend in &self.backends {
            match backend.list(prefix).await {
                Ok(objects) => return Ok((backend.name().to_string(), objects)),
                Err(e) => {
                    tracing::warn!("Listing {} on {} failed: {}", prefix, backend.name(), e);
                }
            }
        }

        Err(StorageError::Unavailable(prefix.to_string()))
    }

    /// Looks up the `modified` time of `key` on the first backend that lists it.
    pub async fn modified_time(&self, key: &str) -> Option<DateTime<Utc>> {
        for backend in &self.backends {
            match backend.list(key).await {
                Ok(objects) => {
                    if let Some(info) = objects.into_iter().find(|o| o.key == key) {
                        return info.modified;
                    }
                }
                Err(e) => {
                    tracing::debug!("Could not stat {} on {}: {}", key, backend.name(), e);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_with_two_dirs() -> (tempfile::TempDir, tempfile::TempDir, StorageChain) {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let chain = StorageChain::new(vec![
            StorageBackend::Local(LocalStore::named("primary", first.path())),
            StorageBackend::Local(LocalStore::named("secondary", second.path())),
        ]);
        (first, second, chain)
    }

    #[tokio::test]
    async fn test_put_all_reaches_every_backend() {
        let (_a, _b, chain) = chain_with_two_dirs();
        let report = chain.put_all("recent.json", b"[]").await;

        assert!(report.primary_acknowledged);
        assert_eq!(report.acknowledged, vec!["primary", "secondary"]);
        for backend in chain.backends() {
            assert_eq!(backend.get("recent.json").await.unwrap(), Some(b"[]".to_vec()));
        }
    }

    #[tokio::test]
    async fn test_exists_anywhere_checks_all_backends() {
        let (_a, _b, chain) = chain_with_two_dirs();
        assert!(!chain.exists_anywhere("archive/1min/2025-08-07.json").await.unwrap());

        chain.backends()[1]
            .put("archive/1min/2025-08-07.json", b"[]")
            .await
            .unwrap();
        assert!(chain.exists_anywhere("archive/1min/2025-08-07.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_exists_anywhere_errors_when_a_backend_cannot_answer() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let secondary = dir.path().join("secondary");
        let chain = StorageChain::new(vec![
            StorageBackend::Local(LocalStore::named("primary", &blocker)),
            StorageBackend::Local(LocalStore::named("secondary", &secondary)),
        ]);

        let result = chain.exists_anywhere("archive/1min/2025-08-07.json").await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));

        // A hit on any backend still answers
        chain.backends()[1]
            .put("archive/1min/2025-08-07.json", b"[]")
            .await
            .unwrap();
        assert!(chain.exists_anywhere("archive/1min/2025-08-07.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_modified_time_from_listing() {
        let (_a, _b, chain) = chain_with_two_dirs();
        assert!(chain.modified_time("historical.json").await.is_none());

        chain.put_all("historical.json", b"[]").await;
        assert!(chain.modified_time("historical.json").await.is_some());
    }
}
