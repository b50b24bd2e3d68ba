use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::aggregators::checkpoint;
use crate::backup::config::BackupConfig;
use crate::storage::{StorageBackend, StorageChain};
use crate::utils::commons::format_timestamp;
use crate::utils::kvstore::KvStore;
use crate::utils::retry::ExponentialBackoffRetry;

pub const BACKUP_PREFIX: &str = "btc-data/";
pub const SUMMARY_FILE: &str = "backup-summary.json";
const BACKUP_EXTENSIONS: [&str; 2] = ["csv", "json"];

/// A `historical.json` smaller than this is treated as an empty publish.
pub const MIN_HISTORICAL_BYTES: u64 = 100;
pub const HISTORICAL_FILE: &str = "historical.json";
pub const STALE_AFTER_HOURS: i64 = 2;

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct BackendUploads {
    pub uploaded: Vec<String>,
    pub failed: Vec<String>,
    pub total_bytes: u64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BackupSummary {
    pub backup_timestamp: String,
    pub group: String,
    pub backends: Vec<String>,
    pub results: BTreeMap<String, BackendUploads>,
    pub total_files: usize,
    pub total_bytes: u64,
    pub success: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RestoreReport {
    pub backend: String,
    pub group: String,
    pub restored: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BackendCleanup {
    pub backend: String,
    pub deleted: usize,
    pub remaining_groups: usize,
    pub error: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntegrityStatus {
    /// The data directory does not exist
    Missing,
    /// No csv or json file in the data directory
    Empty,
    /// `historical.json` exists but holds almost nothing
    Incomplete { bytes: u64 },
    /// Files exist but none changed recently
    Stale { files: usize },
    Healthy { recent: Vec<String>, files: usize },
}

impl IntegrityStatus {
    pub fn needs_restore(&self) -> bool {
        !matches!(self, IntegrityStatus::Healthy { .. })
    }
}

/// `<date>/<HH-MM>` group a backup taken at `now` lands in.
pub fn backup_group(now: &DateTime<Utc>) -> String {
    now.format("%Y-%m-%d/%H-%M").to_string()
}

/// Splits `btc-data/<date>/<HH-MM>/<file>` into its group and file name.
fn split_backup_key(key: &str) -> Option<(String, &str)> {
    let rest = key.strip_prefix(BACKUP_PREFIX)?;
    let mut parts = rest.splitn(3, '/');
    let date = parts.next()?;
    let time = parts.next()?;
    let file = parts.next()?;
    if date.is_empty() || time.is_empty() || file.is_empty() || file.contains('/') {
        return None;
    }
    Some((format!("{}/{}", date, time), file))
}

/// Top-level csv and json files of `data_dir`, sorted by name.
async fn backup_candidates(data_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(data_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        let wanted = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| BACKUP_EXTENSIONS.contains(&e));
        if wanted {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

async fn upload_with_retry(
    backend: &StorageBackend,
    key: &str,
    bytes: &[u8],
    config: &BackupConfig,
) -> Result<()> {
    let mut retry = ExponentialBackoffRetry::new(config.retry_base_delay_ms, config.upload_retries);
    let label = format!("upload of {} to {}", key, backend.name());
    retry
        .execute(&label, move || async move {
            backend.put(key, bytes).await.map_err(anyhow::Error::from)
        })
        .await
}

/// Copies every csv and json file of `data_dir` to each backup backend under one group.
///
/// A backend that rejects a file does not stop the others. The run counts as a success when at
/// least one backend took at least one file, and only then is the last-backup time recorded.
pub async fn backup_all(
    chain: &StorageChain,
    checkpoints: &KvStore,
    data_dir: &Path,
    config: &BackupConfig,
    now: DateTime<Utc>,
) -> Result<BackupSummary> {
    if chain.is_empty() {
        return Err(anyhow!("No backup backends configured"));
    }

    let group = backup_group(&now);
    let files = backup_candidates(data_dir).await?;
    let mut summary = BackupSummary {
        backup_timestamp: format_timestamp(&now),
        group: group.clone(),
        backends: chain.names(),
        results: BTreeMap::new(),
        total_files: files.len(),
        total_bytes: 0,
        success: false,
    };

    if files.is_empty() {
        warn!("No files found to back up in {}", data_dir.display());
        return Ok(summary);
    }

    info!("Backing up {} files to [{}]", files.len(), summary.backends.join(", "));

    for backend in chain.backends() {
        let mut uploads = BackendUploads::default();

        for path in &files {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let bytes = match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Could not read {}: {}", path.display(), e);
                    uploads.failed.push(name.to_string());
                    continue;
                }
            };

            let key = format!("{}{}/{}", BACKUP_PREFIX, group, name);
            match upload_with_retry(backend, &key, &bytes, config).await {
                Ok(()) => {
                    uploads.total_bytes += bytes.len() as u64;
                    uploads.uploaded.push(name.to_string());
                }
                Err(e) => {
                    error!("{}", e);
                    uploads.failed.push(name.to_string());
                }
            }
        }

        summary.total_bytes += uploads.total_bytes;
        summary.results.insert(backend.name().to_string(), uploads);
    }

    summary.success = summary.results.values().any(|r| !r.uploaded.is_empty());

    let summary_key = format!("{}{}/{}", BACKUP_PREFIX, group, SUMMARY_FILE);
    let body = serde_json::to_vec_pretty(&summary)?;
    let report = chain.put_all(&summary_key, &body).await;
    if !report.failed.is_empty() {
        warn!("Backup summary missing on {} backend(s)", report.failed.len());
    }

    if summary.success {
        checkpoint::save_last_backup(checkpoints, now).await?;
        info!("Backup {} completed: {} bytes", group, summary.total_bytes);
    } else {
        error!("Backup {} stored nothing", group);
    }

    Ok(summary)
}

/// True when no backup has been recorded or the last one is at least `interval` old.
pub async fn backup_due(checkpoints: &KvStore, config: &BackupConfig, now: DateTime<Utc>) -> Result<bool> {
    if !config.enabled {
        return Ok(false);
    }
    let interval = Duration::from_std(config.interval)?;
    Ok(match checkpoint::get_last_backup(checkpoints).await? {
        Some(last) => now - last >= interval,
        None => true,
    })
}

/// Groups every backup object on `backend` by `<date>/<HH-MM>`, oldest group first.
async fn backup_groups(backend: &StorageBackend) -> Result<BTreeMap<String, Vec<String>>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for object in backend.list(BACKUP_PREFIX).await? {
        if let Some((group, _)) = split_backup_key(&object.key) {
            groups.entry(group).or_default().push(object.key);
        }
    }
    Ok(groups)
}

/// Downloads the newest backup group into `data_dir`, trying the backends in order.
pub async fn restore_latest(chain: &StorageChain, data_dir: &Path) -> Result<RestoreReport> {
    if chain.is_empty() {
        return Err(anyhow!("No backup backends configured"));
    }

    for backend in chain.backends() {
        let groups = match backup_groups(backend).await {
            Ok(groups) => groups,
            Err(e) => {
                warn!("Could not list backups on {}: {}", backend.name(), e);
                continue;
            }
        };
        let Some((group, keys)) = groups.into_iter().next_back() else {
            continue;
        };

        info!("Restoring backup {} from {}", group, backend.name());
        tokio::fs::create_dir_all(data_dir).await?;

        let mut report = RestoreReport {
            backend: backend.name().to_string(),
            group,
            restored: vec![],
            failed: vec![],
        };

        for key in keys {
            let Some((_, file)) = split_backup_key(&key) else {
                continue;
            };
            if file == SUMMARY_FILE || file == "." || file == ".." {
                continue;
            }

            match backend.get(&key).await {
                Ok(Some(bytes)) => {
                    tokio::fs::write(data_dir.join(file), bytes).await?;
                    report.restored.push(file.to_string());
                }
                Ok(None) => report.failed.push(file.to_string()),
                Err(e) => {
                    warn!("Could not download {}: {}", key, e);
                    report.failed.push(file.to_string());
                }
            }
        }

        if report.restored.is_empty() {
            error!("No files restored from {}", report.backend);
        } else {
            info!("Restored {} files from {}", report.restored.len(), report.backend);
        }
        return Ok(report);
    }

    Err(anyhow!("No backup found on any backend"))
}

/// Deletes all but the newest `keep` backup groups on every backend.
pub async fn cleanup_old_backups(chain: &StorageChain, keep: usize) -> Vec<BackendCleanup> {
    let mut reports = Vec::new();

    for backend in chain.backends() {
        let mut report = BackendCleanup {
            backend: backend.name().to_string(),
            deleted: 0,
            remaining_groups: 0,
            error: None,
        };

        let groups = match backup_groups(backend).await {
            Ok(groups) => groups,
            Err(e) => {
                warn!("Could not list backups on {}: {}", backend.name(), e);
                report.error = Some(e.to_string());
                reports.push(report);
                continue;
            }
        };

        let expired = groups.len().saturating_sub(keep);
        report.remaining_groups = groups.len() - expired;

        for (group, keys) in groups.into_iter().take(expired) {
            for key in keys {
                match backend.delete(&key).await {
                    Ok(true) => report.deleted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Could not delete {} on {}: {}", key, backend.name(), e);
                        report.error = Some(e.to_string());
                    }
                }
            }
            info!("Removed backup {} from {}", group, backend.name());
        }

        reports.push(report);
    }

    reports
}

/// Classifies what is on disk so startup can decide whether to pull a backup.
pub async fn check_data_integrity(data_dir: &Path, now: DateTime<Utc>) -> Result<IntegrityStatus> {
    if !tokio::fs::try_exists(data_dir).await? {
        return Ok(IntegrityStatus::Missing);
    }

    let files = backup_candidates(data_dir).await?;
    if files.is_empty() {
        return Ok(IntegrityStatus::Empty);
    }

    if let Ok(metadata) = tokio::fs::metadata(data_dir.join(HISTORICAL_FILE)).await {
        if metadata.len() < MIN_HISTORICAL_BYTES {
            return Ok(IntegrityStatus::Incomplete { bytes: metadata.len() });
        }
    }

    let threshold = now - Duration::hours(STALE_AFTER_HOURS);
    let mut recent = Vec::new();
    for path in &files {
        let modified = tokio::fs::metadata(path).await?.modified()?;
        if DateTime::<Utc>::from(modified) > threshold {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                recent.push(name.to_string());
            }
        }
    }

    if recent.is_empty() {
        return Ok(IntegrityStatus::Stale { files: files.len() });
    }
    Ok(IntegrityStatus::Healthy { recent, files: files.len() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use chrono::TimeZone;
    use std::time::{Duration as StdDuration, SystemTime};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 7, hour, minute, 0).unwrap()
    }

    fn fast_config() -> BackupConfig {
        BackupConfig {
            upload_retries: 0,
            retry_base_delay_ms: 1,
            ..BackupConfig::default()
        }
    }

    fn seed_data(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("2025-08-07_08.csv"), "timestamp,price\n").unwrap();
        std::fs::write(dir.join("recent.json"), "[]").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();
    }

    #[test]
    fn test_backup_key_layout() {
        assert_eq!(backup_group(&at(10, 5)), "2025-08-07/10-05");
        assert_eq!(
            split_backup_key("btc-data/2025-08-07/10-05/recent.json"),
            Some(("2025-08-07/10-05".to_string(), "recent.json"))
        );
        assert_eq!(split_backup_key("btc-data/2025-08-07/recent.json"), None);
        assert_eq!(split_backup_key("archive/1min/2025-08-07.json"), None);
    }

    #[tokio::test]
    async fn test_backup_then_restore() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let data = dir.path().join("data");
        seed_data(&data);
        let chain = StorageChain::new(vec![StorageBackend::Local(LocalStore::named(
            "local-backup",
            dir.path().join("backups"),
        ))]);
        let checkpoints = KvStore::new(dir.path().join("state.json"));

        let summary = backup_all(&chain, &checkpoints, &data, &fast_config(), at(10, 5)).await?;
        assert!(summary.success);
        assert_eq!(summary.total_files, 2);
        assert_eq!(summary.results["local-backup"].uploaded, vec!["2025-08-07_08.csv", "recent.json"]);
        assert_eq!(checkpoint::get_last_backup(&checkpoints).await?, Some(at(10, 5)));

        let stored = chain.backends()[0].list(BACKUP_PREFIX).await?;
        let keys: Vec<&str> = stored.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "btc-data/2025-08-07/10-05/2025-08-07_08.csv",
                "btc-data/2025-08-07/10-05/backup-summary.json",
                "btc-data/2025-08-07/10-05/recent.json",
            ]
        );

        std::fs::write(data.join("recent.json"), "[1]")?;
        backup_all(&chain, &checkpoints, &data, &fast_config(), at(11, 0)).await?;

        let target = dir.path().join("restored");
        let report = restore_latest(&chain, &target).await?;
        assert_eq!(report.group, "2025-08-07/11-00");
        assert_eq!(report.restored, vec!["2025-08-07_08.csv", "recent.json"]);
        assert_eq!(std::fs::read_to_string(target.join("recent.json"))?, "[1]");
        assert!(!target.join(SUMMARY_FILE).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_backup_survives_failing_backend() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let data = dir.path().join("data");
        seed_data(&data);
        let blocker = dir.path().join("remote-down");
        std::fs::write(&blocker, b"x")?;
        let chain = StorageChain::new(vec![
            StorageBackend::Local(LocalStore::named("remote", &blocker)),
            StorageBackend::Local(LocalStore::named("local-backup", dir.path().join("backups"))),
        ]);
        let checkpoints = KvStore::new(dir.path().join("state.json"));

        let summary = backup_all(&chain, &checkpoints, &data, &fast_config(), at(10, 5)).await?;
        assert!(summary.success);
        assert_eq!(summary.results["remote"].failed.len(), 2);
        assert_eq!(summary.results["local-backup"].uploaded.len(), 2);

        // The failing backend cannot list, so restore falls through to the next one
        let report = restore_latest(&chain, &dir.path().join("restored")).await?;
        assert_eq!(report.backend, "local-backup");
        Ok(())
    }

    #[tokio::test]
    async fn test_backup_due_follows_interval() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let checkpoints = KvStore::new(dir.path().join("state.json"));
        let config = BackupConfig::default();

        assert!(backup_due(&checkpoints, &config, at(10, 0)).await?);
        checkpoint::save_last_backup(&checkpoints, at(10, 0)).await?;
        assert!(!backup_due(&checkpoints, &config, at(10, 29)).await?);
        assert!(backup_due(&checkpoints, &config, at(10, 30)).await?);

        let disabled = BackupConfig { enabled: false, ..config };
        assert!(!backup_due(&checkpoints, &disabled, at(12, 0)).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_without_backups_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let chain = StorageChain::new(vec![StorageBackend::Local(LocalStore::new(dir.path()))]);
        assert!(restore_latest(&chain, &dir.path().join("data")).await.is_err());
        assert!(restore_latest(&StorageChain::default(), dir.path()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_cleanup_keeps_newest_groups() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = LocalStore::named("local-backup", dir.path());
        for minute in [0, 10, 20, 30] {
            let group = backup_group(&at(9, minute));
            store.put(&format!("btc-data/{}/recent.json", group), b"[]").await?;
            store.put(&format!("btc-data/{}/{}", group, SUMMARY_FILE), b"{}").await?;
        }
        let chain = StorageChain::new(vec![StorageBackend::Local(store.clone())]);

        let reports = cleanup_old_backups(&chain, 2).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].deleted, 4);
        assert_eq!(reports[0].remaining_groups, 2);
        assert!(reports[0].error.is_none());

        let remaining = store.list(BACKUP_PREFIX).await?;
        assert!(remaining.iter().all(|o| o.key.contains("/09-20/") || o.key.contains("/09-30/")));

        let reports = cleanup_old_backups(&chain, 10).await;
        assert_eq!(reports[0].deleted, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_integrity_states() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let data = dir.path().join("data");
        let now = Utc::now();

        assert_eq!(check_data_integrity(&data, now).await?, IntegrityStatus::Missing);

        std::fs::create_dir_all(&data)?;
        std::fs::write(data.join("notes.txt"), "x")?;
        assert_eq!(check_data_integrity(&data, now).await?, IntegrityStatus::Empty);

        std::fs::write(data.join(HISTORICAL_FILE), "[]")?;
        assert_eq!(
            check_data_integrity(&data, now).await?,
            IntegrityStatus::Incomplete { bytes: 2 }
        );

        std::fs::write(data.join(HISTORICAL_FILE), vec![b' '; 200])?;
        let status = check_data_integrity(&data, now).await?;
        assert!(!status.needs_restore());
        assert_eq!(
            status,
            IntegrityStatus::Healthy { recent: vec![HISTORICAL_FILE.to_string()], files: 1 }
        );

        let old = SystemTime::now() - StdDuration::from_secs(3 * 3600);
        std::fs::File::options()
            .write(true)
            .open(data.join(HISTORICAL_FILE))?
            .set_modified(old)?;
        let status = check_data_integrity(&data, now).await?;
        assert_eq!(status, IntegrityStatus::Stale { files: 1 });
        assert!(status.needs_restore());
        Ok(())
    }
}
