use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backup::config::BackupConfig;
use crate::backup::operations::{
    backup_all, backup_due, check_data_integrity, cleanup_old_backups, restore_latest,
    BackendCleanup, BackupSummary, IntegrityStatus, RestoreReport,
};
use crate::utils::app_config::AppConfig;
use crate::utils::traits::ActionProcessor;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum BackupProcessorInput {
    /// Back up now, regardless of the interval
    RunBackup { now: Option<DateTime<Utc>> },
    /// Back up only when enabled and the interval has passed, then prune old groups
    BackupIfDue { now: Option<DateTime<Utc>> },
    RestoreLatest,
    CleanupOldBackups { keep: Option<usize> },
    CheckIntegrity,
    /// Integrity check followed by a restore when the data looks lost
    StartupCheck,
}

#[derive(Serialize, Debug)]
pub enum BackupProcessorOutput {
    RunBackup(BackupSummary),
    BackupIfDue(Option<BackupSummary>),
    RestoreLatest(RestoreReport),
    CleanupOldBackups(Vec<BackendCleanup>),
    CheckIntegrity(IntegrityStatus),
    StartupCheck(StartupReport),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StartupReport {
    pub status: IntegrityStatus,
    pub restored: Option<RestoreReport>,
    pub restore_error: Option<String>,
}

impl ActionProcessor<BackupConfig, BackupProcessorOutput> for BackupProcessorInput {
    async fn process(
        &self,
        app_config: &AppConfig,
        local_config: &mut BackupConfig,
    ) -> Result<BackupProcessorOutput> {
        match self {
            BackupProcessorInput::RunBackup { now } => {
                let summary = backup_all(
                    &app_config.backup_chain,
                    &app_config.checkpoints,
                    &app_config.data_dir,
                    local_config,
                    now.unwrap_or_else(Utc::now),
                )
                .await?;
                Ok(BackupProcessorOutput::RunBackup(summary))
            }
            BackupProcessorInput::BackupIfDue { now } => {
                let now = now.unwrap_or_else(Utc::now);
                if app_config.backup_chain.is_empty()
                    || !backup_due(&app_config.checkpoints, local_config, now).await?
                {
                    return Ok(BackupProcessorOutput::BackupIfDue(None));
                }

                info!("Automatic backup triggered");
                let summary = backup_all(
                    &app_config.backup_chain,
                    &app_config.checkpoints,
                    &app_config.data_dir,
                    local_config,
                    now,
                )
                .await?;
                if summary.success {
                    cleanup_old_backups(&app_config.backup_chain, local_config.max_backups).await;
                }
                Ok(BackupProcessorOutput::BackupIfDue(Some(summary)))
            }
            BackupProcessorInput::RestoreLatest => {
                let report = restore_latest(&app_config.backup_chain, &app_config.data_dir).await?;
                Ok(BackupProcessorOutput::RestoreLatest(report))
            }
            BackupProcessorInput::CleanupOldBackups { keep } => {
                let keep = keep.unwrap_or(local_config.max_backups);
                let reports = cleanup_old_backups(&app_config.backup_chain, keep).await;
                Ok(BackupProcessorOutput::CleanupOldBackups(reports))
            }
            BackupProcessorInput::CheckIntegrity => {
                let status = check_data_integrity(&app_config.data_dir, Utc::now()).await?;
                Ok(BackupProcessorOutput::CheckIntegrity(status))
            }
            BackupProcessorInput::StartupCheck => {
                let status = check_data_integrity(&app_config.data_dir, Utc::now()).await?;
                let mut report = StartupReport {
                    status: status.clone(),
                    restored: None,
                    restore_error: None,
                };

                if !status.needs_restore() {
                    info!("Data integrity check passed");
                    return Ok(BackupProcessorOutput::StartupCheck(report));
                }

                warn!("Data integrity check failed: {:?}", status);
                if !local_config.auto_restore {
                    return Ok(BackupProcessorOutput::StartupCheck(report));
                }

                match restore_latest(&app_config.backup_chain, &app_config.data_dir).await {
                    Ok(restored) => report.restored = Some(restored),
                    Err(e) => {
                        warn!("Starting without restored data: {}", e);
                        report.restore_error = Some(e.to_string());
                    }
                }
                Ok(BackupProcessorOutput::StartupCheck(report))
            }
        }
    }
}
