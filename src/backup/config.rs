use std::time::Duration;

use anyhow::Result;

use crate::utils::commons::{env_flag, env_or};

#[derive(Debug, Clone, PartialEq)]
pub struct BackupConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Backup groups kept per backend by cleanup.
    pub max_backups: usize,
    pub auto_restore: bool,
    pub upload_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30 * 60),
            max_backups: 10,
            auto_restore: true,
            upload_retries: 2,
            retry_base_delay_ms: 500,
        }
    }
}

impl BackupConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            enabled: env_flag("BACKUP_ENABLED", defaults.enabled),
            interval: Duration::from_secs(env_or("BACKUP_INTERVAL_MINUTES", 30u64)? * 60),
            max_backups: env_or("MAX_BACKUPS", defaults.max_backups)?,
            auto_restore: env_flag("AUTO_RESTORE_ON_STARTUP", defaults.auto_restore),
            upload_retries: env_or("BACKUP_UPLOAD_RETRIES", defaults.upload_retries)?,
            retry_base_delay_ms: env_or("BACKUP_RETRY_BASE_MS", defaults.retry_base_delay_ms)?,
        })
    }
}
