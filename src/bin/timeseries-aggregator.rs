use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use colored::Colorize;
use dotenvy::dotenv;

use spread_pipeline::action_router::{ActionRouterInput, ActionRouterOutput};
use spread_pipeline::aggregators::checkpoint;
use spread_pipeline::aggregators::{
    AggregationPassArgs, AggregatorsProcessorInput, AggregatorsProcessorOutput, RotationCheckArgs,
};
use spread_pipeline::backup::{BackupProcessorInput, BackupProcessorOutput, IntegrityStatus};
use spread_pipeline::cli_helper::{
    call_action_router, confirm, initialize_app_config, print_banner, print_pass_summary,
    print_rotation_outcomes,
};
use spread_pipeline::utils::app_config::AppConfig;
use spread_pipeline::views::Cadence;

#[derive(Parser, Debug)]
#[command(
    name = "timeseries-aggregator",
    about = "Spread snapshot aggregator",
    long_about = "Runs aggregation passes, rotations and backups of the published spread views on demand"
)]
struct CliArgs {
    /// Operation mode
    #[arg(long, value_enum, default_value = "pass")]
    mode: ModeArg,

    /// Which views to rebuild in pass mode
    #[arg(long, value_enum, default_value = "full")]
    cadence: Cadence,

    /// Only load shards modified in the last N hours
    #[arg(long, env = "CLI_LOOKBACK_HOURS")]
    lookback_hours: Option<u32>,

    /// Load every shard, ignoring any lookback
    #[arg(long)]
    all: bool,

    /// Restrict rotate mode to these views
    #[arg(long, value_delimiter = ',')]
    views: Vec<String>,

    /// Backup groups to keep in cleanup mode
    #[arg(long)]
    keep: Option<usize>,

    /// Object prefix for list mode
    #[arg(long, default_value = "")]
    prefix: String,

    /// Skip confirmation prompts
    #[arg(long)]
    confirm: bool,
}

#[derive(Clone, Debug, ValueEnum)]
enum ModeArg {
    /// Run one aggregation pass
    #[value(name = "pass")]
    Pass,
    /// Archive views whose rotation is due
    #[value(name = "rotate")]
    Rotate,
    /// Back up the data directory now
    #[value(name = "backup")]
    Backup,
    /// Replace local data with the newest backup
    #[value(name = "restore")]
    Restore,
    /// Delete old backup groups
    #[value(name = "cleanup")]
    Cleanup,
    /// Check the data directory
    #[value(name = "integrity")]
    Integrity,
    /// List objects on the publish and backup backends
    #[value(name = "list")]
    List,
    /// Show view checkpoints and backup age
    #[value(name = "health")]
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    print_banner("Spread Snapshot Aggregator");

    let args = CliArgs::parse();

    eprint!("Loading configuration... ");
    let app_config = match initialize_app_config() {
        Ok(config) => {
            eprintln!("{}", "✓ Ready".green());
            config
        }
        Err(e) => {
            eprintln!("{}", "✗ Failed".red());
            eprintln!("Error: {}", e);
            return Err(e);
        }
    };
    eprintln!("Data directory: {}", app_config.data_dir.display().to_string().dimmed());
    eprintln!("Publishing to: {}", app_config.publish_chain.names().join(", ").dimmed());
    eprintln!();

    match args.mode {
        ModeArg::Pass => run_pass(&app_config, &args).await?,
        ModeArg::Rotate => run_rotate(&app_config, &args).await?,
        ModeArg::Backup => run_backup(&app_config).await?,
        ModeArg::Restore => run_restore(&app_config, &args).await?,
        ModeArg::Cleanup => run_cleanup(&app_config, &args).await?,
        ModeArg::Integrity => run_integrity(&app_config).await?,
        ModeArg::List => run_list(&app_config, &args).await?,
        ModeArg::Health => run_health(&app_config).await?,
    }

    eprintln!();
    eprintln!("{}", "✓ Operation completed successfully".green());
    Ok(())
}

async fn run_pass(app_config: &AppConfig, args: &CliArgs) -> Result<()> {
    let input = AggregatorsProcessorInput::RunAggregationPass(AggregationPassArgs {
        lookback_hours: args.lookback_hours,
        all_shards: args.all,
        ..AggregationPassArgs::scheduled(args.cadence)
    });

    println!("{}", "Executing aggregation...".bright_green());
    match call_action_router(ActionRouterInput::Aggregators(input), app_config).await? {
        ActionRouterOutput::Aggregators(AggregatorsProcessorOutput::RunAggregationPass(summary)) => {
            print_pass_summary(&summary);
            if summary.failures > 0 {
                return Err(anyhow!("{} view(s) were not published", summary.failures));
            }
            Ok(())
        }
        _ => Err(anyhow!("Unexpected output from aggregation pass")),
    }
}

async fn run_rotate(app_config: &AppConfig, args: &CliArgs) -> Result<()> {
    let input = AggregatorsProcessorInput::RunRotationCheck(RotationCheckArgs {
        views: args.views.clone(),
        now: None,
    });

    match call_action_router(ActionRouterInput::Aggregators(input), app_config).await? {
        ActionRouterOutput::Aggregators(AggregatorsProcessorOutput::RunRotationCheck(outcomes)) => {
            println!("{}", "Rotation check:".bold().bright_cyan());
            print_rotation_outcomes(&outcomes);
            Ok(())
        }
        _ => Err(anyhow!("Unexpected output from rotation check")),
    }
}

async fn run_backup(app_config: &AppConfig) -> Result<()> {
    if app_config.backup_chain.is_empty() {
        println!("{}", "No backup backend configured (set GCS_BUCKET_NAME or LOCAL_BACKUP_DIR)".yellow());
        return Ok(());
    }

    let input = BackupProcessorInput::RunBackup { now: None };
    match call_action_router(ActionRouterInput::Backup(input), app_config).await? {
        ActionRouterOutput::Backup(BackupProcessorOutput::RunBackup(summary)) => {
            println!("  {} {}", "Group:".bold(), summary.group.bright_white());
            for (backend, uploads) in &summary.results {
                let line = format!(
                    "{} uploaded, {} failed, {} bytes",
                    uploads.uploaded.len(),
                    uploads.failed.len(),
                    uploads.total_bytes
                );
                let line = if uploads.failed.is_empty() { line.green() } else { line.yellow() };
                println!("    {} {:<14} {}", "├─".dimmed(), backend.bright_yellow(), line);
            }
            if !summary.success {
                return Err(anyhow!("Backup stored nothing"));
            }
            Ok(())
        }
        _ => Err(anyhow!("Unexpected output from backup")),
    }
}

async fn run_restore(app_config: &AppConfig, args: &CliArgs) -> Result<()> {
    let prompt = format!(
        "Overwrite files in {} with the newest backup?",
        app_config.data_dir.display()
    );
    if !confirm(&prompt, args.confirm)? {
        println!("{}", "Restore cancelled".yellow());
        return Ok(());
    }

    match call_action_router(ActionRouterInput::Backup(BackupProcessorInput::RestoreLatest), app_config).await? {
        ActionRouterOutput::Backup(BackupProcessorOutput::RestoreLatest(report)) => {
            println!(
                "  {} {} from {}",
                "Restored:".bold(),
                report.group.bright_white(),
                report.backend.bright_white()
            );
            for file in &report.restored {
                println!("    {} {}", "├─".dimmed(), file.green());
            }
            for file in &report.failed {
                println!("    {} {}", "├─".dimmed(), format!("✗ {}", file).red());
            }
            Ok(())
        }
        _ => Err(anyhow!("Unexpected output from restore")),
    }
}

async fn run_cleanup(app_config: &AppConfig, args: &CliArgs) -> Result<()> {
    let keep = args.keep.unwrap_or(app_config.backup.max_backups);
    if !confirm(&format!("Delete all but the newest {} backup groups?", keep), args.confirm)? {
        println!("{}", "Cleanup cancelled".yellow());
        return Ok(());
    }

    let input = BackupProcessorInput::CleanupOldBackups { keep: Some(keep) };
    match call_action_router(ActionRouterInput::Backup(input), app_config).await? {
        ActionRouterOutput::Backup(BackupProcessorOutput::CleanupOldBackups(reports)) => {
            for report in reports {
                let line = match &report.error {
                    Some(e) => format!("✗ {}", e).red(),
                    None => format!(
                        "{} objects deleted, {} groups left",
                        report.deleted, report.remaining_groups
                    )
                    .green(),
                };
                println!("  {} {:<14} {}", "├─".dimmed(), report.backend.bright_yellow(), line);
            }
            Ok(())
        }
        _ => Err(anyhow!("Unexpected output from cleanup")),
    }
}

async fn run_integrity(app_config: &AppConfig) -> Result<()> {
    match call_action_router(ActionRouterInput::Backup(BackupProcessorInput::CheckIntegrity), app_config).await? {
        ActionRouterOutput::Backup(BackupProcessorOutput::CheckIntegrity(status)) => {
            let line = match &status {
                IntegrityStatus::Missing => "missing: data directory does not exist".red(),
                IntegrityStatus::Empty => "empty: no data files".red(),
                IntegrityStatus::Incomplete { bytes } => {
                    format!("incomplete: historical.json is only {} bytes", bytes).yellow()
                }
                IntegrityStatus::Stale { files } => {
                    format!("stale: none of {} files changed recently", files).yellow()
                }
                IntegrityStatus::Healthy { recent, files } => {
                    format!("healthy: {} of {} files recent", recent.len(), files).green()
                }
            };
            println!("  {} {}", "Integrity:".bold(), line);
            Ok(())
        }
        _ => Err(anyhow!("Unexpected output from integrity check")),
    }
}

async fn run_list(app_config: &AppConfig, args: &CliArgs) -> Result<()> {
    let chains = [("publish", &app_config.publish_chain), ("backup", &app_config.backup_chain)];
    let prefix = args.prefix.as_str();

    for (label, chain) in chains {
        for backend in chain.backends() {
            println!("  {} {} ({})", "Backend:".bold().bright_cyan(), backend.name().bright_white(), label.dimmed());
            match backend.list(prefix).await {
                Ok(objects) if objects.is_empty() => println!("    {}", "(no objects)".dimmed()),
                Ok(objects) => {
                    for object in objects {
                        let modified = object
                            .modified
                            .map(|m| m.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "    {} {:<50} {:>10} {}",
                            "├─".dimmed(),
                            object.key.bright_yellow(),
                            object.size,
                            modified.dimmed()
                        );
                    }
                }
                Err(e) => println!("    {}", format!("✗ {}", e).red()),
            }
            println!();
        }
    }
    Ok(())
}

async fn run_health(app_config: &AppConfig) -> Result<()> {
    let now = Utc::now();
    println!("{}", "Views:".bold().bright_cyan());

    for spec in &app_config.aggregators.views {
        let interval = match spec.cadence {
            Cadence::Fast => app_config.fast_pass_interval,
            Cadence::Full => app_config.full_pass_interval,
        };
        let last_write = checkpoint::get_last_write(&app_config.checkpoints, &spec.name).await?;
        let records = checkpoint::get_record_count(&app_config.checkpoints, &spec.name).await?;

        let line = match last_write {
            None => "never published".yellow(),
            Some(at) => {
                let age = (now - at).to_std().unwrap_or_default();
                let text = format!("{} rows, written {}s ago", records.unwrap_or(0), age.as_secs());
                // Three missed cadences in a row reads as stalled
                if age > interval * 3 { text.red() } else { text.green() }
            }
        };
        println!("  {} {:<12} {}", "├─".dimmed(), spec.name.bright_yellow(), line);
    }

    let last_backup = checkpoint::get_last_backup(&app_config.checkpoints).await?;
    let backup_line = match last_backup {
        Some(at) => at.to_rfc3339().normal(),
        None => "never".yellow(),
    };
    println!("  {} {}", "Last backup:".bold(), backup_line);
    Ok(())
}
