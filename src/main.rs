use std::env;

use chrono::Utc;
use tracing::{error, info, warn};

use spread_pipeline::action_router::{ActionRouterInput, ActionRouterOutput};
use spread_pipeline::aggregators::{
    AggregationPassArgs, AggregatorsProcessorInput, AggregatorsProcessorOutput, RotationCheckArgs,
};
use spread_pipeline::backup::{BackupProcessorInput, BackupProcessorOutput};
use spread_pipeline::samples::{SampleSource, ShardWriter};
use spread_pipeline::utils::app_config::AppConfig;
use spread_pipeline::utils::retry::ExponentialBackoffRetry;
use spread_pipeline::views::Cadence;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            env::var("RUST_LOG")
                .unwrap_or_else(|_| "info".to_string())
                .as_str(),
        )
        .init();

    let app_config = AppConfig::from_env()?;
    tracing::info!("Application configuration loaded successfully");

    let startup = ActionRouterInput::Backup(BackupProcessorInput::StartupCheck)
        .process(&app_config)
        .await;
    match startup {
        Ok(ActionRouterOutput::Backup(BackupProcessorOutput::StartupCheck(report))) => {
            if let Some(restored) = report.restored {
                info!("Restored {} files from backup {}", restored.restored.len(), restored.group);
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Startup integrity check failed: {}", e),
    }

    let sampler = tokio::spawn(run_sampler(app_config.clone()));
    let fast = tokio::spawn(run_fast_passes(app_config.clone()));
    let full = tokio::spawn(run_full_passes(app_config.clone()));

    info!(
        "Sampling {} every {:?}, fast pass every {:?}, full pass every {:?}",
        app_config.product_id,
        app_config.sample_interval,
        app_config.fast_pass_interval,
        app_config.full_pass_interval
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    sampler.abort();
    fast.abort();
    full.abort();

    let health = app_config.health.snapshot().await;
    info!("Final health: {}", serde_json::to_string(&health)?);
    Ok(())
}

/// Polls the order book and appends one row per tick to the active shard.
async fn run_sampler(app_config: AppConfig) {
    let source = match SampleSource::coinbase(&app_config.product_id, app_config.storage_timeout) {
        Ok(source) => source,
        Err(e) => {
            error!("Sampler disabled, could not build HTTP client: {}", e);
            return;
        }
    };
    let writer = ShardWriter::new(app_config.data_dir.clone(), app_config.aggregators.shard_rotation_hours);
    let mut backoff = ExponentialBackoffRetry::new(app_config.sample_interval.as_millis() as u64, 0);

    loop {
        let delay = match sample_once(&source, &writer).await {
            Ok(()) => {
                backoff.record_success();
                app_config.health.record_fetch_success(Utc::now()).await;
                app_config.sample_interval
            }
            Err(e) => {
                let failures = app_config.health.record_fetch_failure().await;
                let delay = backoff.record_failure().max(app_config.sample_interval);
                warn!("Sample failed ({} in a row): {} - next try in {:?}", failures, e, delay);
                delay
            }
        };
        tokio::time::sleep(delay).await;
    }
}

async fn sample_once(source: &SampleSource, writer: &ShardWriter) -> anyhow::Result<()> {
    let record = source.fetch_sample().await?;
    let writer = writer.clone();
    tokio::task::spawn_blocking(move || writer.append(&record, &Utc::now())).await??;
    Ok(())
}

async fn run_fast_passes(app_config: AppConfig) {
    let mut ticker = tokio::time::interval(app_config.fast_pass_interval);
    loop {
        ticker.tick().await;
        run_pass(&app_config, Cadence::Fast).await;
    }
}

/// Full passes also own rotation checks and automatic backups.
async fn run_full_passes(app_config: AppConfig) {
    let mut ticker = tokio::time::interval(app_config.full_pass_interval);
    loop {
        ticker.tick().await;

        let rotation = ActionRouterInput::Aggregators(AggregatorsProcessorInput::RunRotationCheck(
            RotationCheckArgs::default(),
        ))
        .process(&app_config)
        .await;
        match rotation {
            Ok(ActionRouterOutput::Aggregators(AggregatorsProcessorOutput::RunRotationCheck(outcomes))) => {
                for (view, outcome) in outcomes.iter().filter(|(_, o)| o.rotated()) {
                    info!("Rotated {}: {:?}", view, outcome);
                }
            }
            Ok(_) => {}
            Err(e) => error!("Rotation check failed: {}", e),
        }

        run_pass(&app_config, Cadence::Full).await;

        let backup = ActionRouterInput::Backup(BackupProcessorInput::BackupIfDue { now: None })
            .process(&app_config)
            .await;
        if let Err(e) = backup {
            error!("Automatic backup failed: {}", e);
        }
    }
}

async fn run_pass(app_config: &AppConfig, cadence: Cadence) {
    let input = ActionRouterInput::Aggregators(AggregatorsProcessorInput::RunAggregationPass(
        AggregationPassArgs::scheduled(cadence),
    ));

    match input.process(app_config).await {
        Ok(ActionRouterOutput::Aggregators(AggregatorsProcessorOutput::RunAggregationPass(summary))) => {
            if summary.failures > 0 {
                warn!("{:?} pass finished with {} failed view(s)", cadence, summary.failures);
            }
        }
        Ok(_) => {}
        Err(e) => error!("{:?} pass failed: {}", cadence, e),
    }

    if app_config.health.is_degraded().await {
        let health = app_config.health.snapshot().await;
        error!(
            "Pipeline degraded after {} failed passes, last error: {}",
            health.consecutive_pass_failures,
            health.last_error.unwrap_or_default()
        );
    }
}
