use anyhow::Result;
use colored::Colorize;
use dialoguer::Confirm;

use crate::action_router::{ActionRouterInput, ActionRouterOutput};
use crate::aggregators::processor::PassSummary;
use crate::aggregators::rotation::RotationOutcome;
use crate::utils::app_config::AppConfig;

/// Initialize AppConfig for CLI operations
pub fn initialize_app_config() -> Result<AppConfig> {
    AppConfig::from_env()
}

/// Execute an action through the ActionRouter
pub async fn call_action_router(input: ActionRouterInput, app_config: &AppConfig) -> Result<ActionRouterOutput> {
    input.process(app_config).await
}

pub fn print_banner(title: &str) {
    let width = 55;
    eprintln!("{}", format!("╔{}╗", "═".repeat(width)).bright_cyan());
    eprintln!("{}", format!("║ {:<w$}║", title, w = width - 1).bright_cyan());
    eprintln!("{}", format!("╚{}╝", "═".repeat(width)).bright_cyan());
    eprintln!();
}

/// Asks before a destructive step. `assume_yes` skips the prompt.
pub fn confirm(prompt: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    Ok(Confirm::new().with_prompt(prompt).default(false).interact()?)
}

pub fn print_pass_summary(summary: &PassSummary) {
    println!(
        "  {} {:?} at {}",
        "Pass:".bold(),
        summary.cadence,
        summary.ran_at.to_rfc3339().bright_white()
    );
    if summary.no_data {
        println!("  {}", "No shard data found, nothing published".yellow());
        return;
    }
    println!("  {} {}", "Samples:".bold(), summary.samples.to_string().bright_white());

    for view in &summary.views {
        let status = match (&view.published_rows, &view.skipped) {
            (Some(rows), _) => format!("✓ {} rows", rows).green(),
            (None, Some(reason)) => format!("✗ {}", reason).red(),
            (None, None) => "✗ not published".red(),
        };
        println!("    {} {:<12} {}", "├─".dimmed(), view.name.bright_yellow(), status);
        if let Some(outcome) = view.rotation.as_ref().filter(|o| o.rotated()) {
            println!("    {}   {}", "│".dimmed(), describe_outcome(outcome).bright_cyan());
        }
    }
}

pub fn print_rotation_outcomes(outcomes: &[(String, RotationOutcome)]) {
    for (view, outcome) in outcomes {
        let line = describe_outcome(outcome);
        let line = if outcome.blocks_publish() { line.red() } else { line.normal() };
        println!("  {} {:<12} {}", "├─".dimmed(), view.bright_yellow(), line);
    }
}

pub fn describe_outcome(outcome: &RotationOutcome) -> String {
    match outcome {
        RotationOutcome::NotDue => "not due".to_string(),
        RotationOutcome::Archived { key, rows } => format!("archived {} rows to {}", rows, key),
        RotationOutcome::DiscardedExisting { key } => format!("{} already archived, view reset", key),
        RotationOutcome::ResetEmpty => "nothing to archive, view reset".to_string(),
        RotationOutcome::Aborted { key, reason } => format!("archive {} aborted: {}", key, reason),
        RotationOutcome::Skipped { reason } => format!("skipped: {}", reason),
    }
}
