use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use dotenvy::dotenv;
use tokio::sync::Mutex;

use crate::aggregators::config::AggregatorsConfig;
use crate::backup::config::BackupConfig;
use crate::storage::gcs::DEFAULT_GCS_ENDPOINT;
use crate::storage::{GcsStore, LocalStore, StorageBackend, StorageChain};
use crate::utils::commons::{env_opt, env_or, split_list};
use crate::utils::health::HealthMonitor;
use crate::utils::kvstore::KvStore;

pub const STATE_FILE: &str = "state.json";

/// Process-wide context, built once by the entry point and handed to every processor.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub product_id: String,
    pub sample_interval: Duration,
    pub fast_pass_interval: Duration,
    pub full_pass_interval: Duration,
    pub storage_timeout: Duration,
    pub aggregators: AggregatorsConfig,
    pub backup: BackupConfig,
    /// Where views are read from and published to, in precedence order.
    pub publish_chain: StorageChain,
    /// Where raw shard and view backups go.
    pub backup_chain: StorageChain,
    pub checkpoints: KvStore,
    pub health: Arc<HealthMonitor>,
    /// Held for the duration of an aggregation pass or rotation check.
    pub pass_lock: Arc<Mutex<()>>,
}

impl AppConfig {
    /// A context that keeps everything under `data_dir` and talks to no remote store.
    pub fn local(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            publish_chain: StorageChain::new(vec![StorageBackend::Local(LocalStore::new(&data_dir))]),
            backup_chain: StorageChain::default(),
            checkpoints: KvStore::new(data_dir.join(STATE_FILE)),
            data_dir,
            product_id: "BTC-USD".to_string(),
            sample_interval: Duration::from_millis(1000),
            fast_pass_interval: Duration::from_secs(60),
            full_pass_interval: Duration::from_secs(3600),
            storage_timeout: Duration::from_secs(20),
            aggregators: AggregatorsConfig::default(),
            backup: BackupConfig::default(),
            health: Arc::new(HealthMonitor::new(5)),
            pass_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenv() {
            tracing::debug!("No .env loaded: {}", e);
        }

        let data_dir: PathBuf = env_or("DATA_DIR", PathBuf::from("./data"))?;
        let storage_timeout = Duration::from_secs(env_or("STORAGE_TIMEOUT_SECS", 20u64)?);

        let gcs = match env_opt::<String>("GCS_BUCKET_NAME")? {
            Some(bucket) => Some(GcsStore::new(
                env_or("GCS_ENDPOINT", DEFAULT_GCS_ENDPOINT.to_string())?,
                bucket,
                env_opt("GCS_ACCESS_TOKEN")?,
                storage_timeout,
            )?),
            None => None,
        };

        let order = split_list(&env_or("STORAGE_BACKENDS", "gcs,local".to_string())?);
        let publish_chain = build_publish_chain(&order, gcs.clone(), &data_dir)?;

        let mut backup_backends = Vec::new();
        if let Some(gcs) = gcs {
            backup_backends.push(StorageBackend::Gcs(gcs));
        }
        if let Some(dir) = env_opt::<PathBuf>("LOCAL_BACKUP_DIR")? {
            backup_backends.push(StorageBackend::Local(LocalStore::named("local-backup", dir)));
        }

        let config = Self {
            checkpoints: KvStore::new(data_dir.join(STATE_FILE)),
            product_id: env_or("PRODUCT_ID", "BTC-USD".to_string())?,
            sample_interval: Duration::from_millis(env_or("SAMPLE_INTERVAL_MS", 1000u64)?),
            fast_pass_interval: Duration::from_secs(env_or("FAST_PASS_SECS", 60u64)?),
            full_pass_interval: Duration::from_secs(env_or("FULL_PASS_SECS", 3600u64)?),
            storage_timeout,
            aggregators: AggregatorsConfig::from_env()?,
            backup: BackupConfig::from_env()?,
            publish_chain,
            backup_chain: StorageChain::new(backup_backends),
            health: Arc::new(HealthMonitor::new(env_or("DEGRADED_AFTER_FAILURES", 5u32)?)),
            pass_lock: Arc::new(Mutex::new(())),
            data_dir,
        };

        tracing::info!(
            "Publishing to [{}], backing up to [{}], data in {}",
            config.publish_chain.names().join(", "),
            config.backup_chain.names().join(", "),
            config.data_dir.display()
        );

        Ok(config)
    }
}

/// Orders the publish backends as listed. `gcs` without a bucket is skipped with a warning.
fn build_publish_chain(
    order: &[String],
    gcs: Option<GcsStore>,
    data_dir: &Path,
) -> Result<StorageChain> {
    let mut backends = Vec::new();
    for name in order {
        match name.to_lowercase().as_str() {
            "gcs" => match &gcs {
                Some(store) => backends.push(StorageBackend::Gcs(store.clone())),
                None => tracing::warn!("STORAGE_BACKENDS lists gcs but GCS_BUCKET_NAME is not set"),
            },
            "local" => backends.push(StorageBackend::Local(LocalStore::new(data_dir))),
            other => return Err(anyhow!("Unknown storage backend {:?}", other)),
        }
    }

    if backends.is_empty() {
        return Err(anyhow!("No usable storage backend configured"));
    }
    Ok(StorageChain::new(backends))
}
