use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::aggregators::aggregation_block::{resample, Candle};
use crate::aggregators::checkpoint;
use crate::aggregators::config::AggregatorsConfig;
use crate::aggregators::merge::{merge_views, resolve_prior};
use crate::aggregators::rolling::annotate;
use crate::aggregators::rotation::{rotate_if_due, run_rotation_check, RotationOutcome};
use crate::aggregators::time_series::Resolution;
use crate::samples::loader::ShardLoader;
use crate::samples::types::ShardLoad;
use crate::utils::app_config::AppConfig;
use crate::utils::traits::ActionProcessor;
use crate::views::publisher::{publish_index, publish_view};
use crate::views::types::{Cadence, ViewSpec};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AggregationPassArgs {
    pub cadence: Cadence,
    /// Overrides the configured shard lookback for this pass.
    pub lookback_hours: Option<u32>,
    /// Loads every shard, ignoring any lookback.
    pub all_shards: bool,
    /// Defaults to the wall clock.
    pub now: Option<DateTime<Utc>>,
}

impl AggregationPassArgs {
    pub fn scheduled(cadence: Cadence) -> Self {
        Self {
            cadence,
            lookback_hours: None,
            all_shards: false,
            now: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RotationCheckArgs {
    /// View names to check. Empty means all.
    pub views: Vec<String>,
    pub now: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum AggregatorsProcessorInput {
    /// Load shards, resample, merge against the published views and publish them
    RunAggregationPass(AggregationPassArgs),
    /// Archive views whose rotation policy says they have aged out
    RunRotationCheck(RotationCheckArgs),
    /// Forget the recorded last write of a view
    ClearCheckpoint { view: String },
}

#[derive(Serialize, Debug)]
pub enum AggregatorsProcessorOutput {
    RunAggregationPass(PassSummary),
    RunRotationCheck(Vec<(String, RotationOutcome)>),
    ClearCheckpoint(bool),
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct ViewSummary {
    pub name: String,
    pub fresh_rows: usize,
    pub published_rows: Option<usize>,
    pub rotation: Option<RotationOutcome>,
    pub skipped: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PassSummary {
    pub cadence: Cadence,
    pub ran_at: DateTime<Utc>,
    pub samples: usize,
    pub no_data: bool,
    pub views: Vec<ViewSummary>,
    pub failures: usize,
}

impl PassSummary {
    fn empty(cadence: Cadence, ran_at: DateTime<Utc>) -> Self {
        Self {
            cadence,
            ran_at,
            samples: 0,
            no_data: false,
            views: vec![],
            failures: 0,
        }
    }

    pub fn view(&self, name: &str) -> Option<&ViewSummary> {
        self.views.iter().find(|v| v.name == name)
    }
}

impl ActionProcessor<AggregatorsConfig, AggregatorsProcessorOutput> for AggregatorsProcessorInput {
    async fn process(
        &self,
        app_config: &AppConfig,
        local_config: &mut AggregatorsConfig,
    ) -> Result<AggregatorsProcessorOutput> {
        match self {
            AggregatorsProcessorInput::RunAggregationPass(args) => {
                let summary = run_aggregation_pass(app_config, local_config, args).await;
                match &summary {
                    Ok(s) if s.failures == 0 => app_config.health.record_pass_success(s.ran_at).await,
                    Ok(s) => {
                        app_config
                            .health
                            .record_pass_failure(format!("{} view(s) not published", s.failures))
                            .await
                    }
                    Err(e) => app_config.health.record_pass_failure(e.to_string()).await,
                }
                Ok(AggregatorsProcessorOutput::RunAggregationPass(summary?))
            }
            AggregatorsProcessorInput::RunRotationCheck(args) => {
                let _guard = app_config.pass_lock.lock().await;
                let now = args.now.unwrap_or_else(Utc::now);
                let specs: Vec<ViewSpec> = local_config
                    .views
                    .iter()
                    .filter(|v| args.views.is_empty() || args.views.contains(&v.name))
                    .cloned()
                    .collect();

                let outcomes =
                    run_rotation_check(&app_config.publish_chain, &app_config.checkpoints, &specs, now)
                        .await?;
                if outcomes.iter().any(|(_, o)| o.blocks_publish()) {
                    app_config
                        .health
                        .record_pass_failure("rotation check could not complete")
                        .await;
                }
                Ok(AggregatorsProcessorOutput::RunRotationCheck(outcomes))
            }
            AggregatorsProcessorInput::ClearCheckpoint { view } => {
                let cleared = checkpoint::clear_checkpoint(&app_config.checkpoints, view).await?;
                Ok(AggregatorsProcessorOutput::ClearCheckpoint(cleared))
            }
        }
    }
}

/// Sample count and annotated candles per resolution.
type ComputedCandles = (usize, BTreeMap<Resolution, Vec<Candle>>);

/// Loads and resamples on the blocking pool, once per distinct resolution.
async fn compute_candles(
    app_config: &AppConfig,
    config: &AggregatorsConfig,
    views: &[ViewSpec],
    lookback: Option<Duration>,
    now: DateTime<Utc>,
) -> Result<Option<ComputedCandles>> {
    let loader = ShardLoader::new(
        app_config.data_dir.clone(),
        config.shard_rotation_hours,
        config.metric_names.clone(),
    );
    let resolutions: BTreeSet<Resolution> = views.iter().map(|v| v.resolution).collect();
    let metric = config.primary_metric().to_string();
    let windows = config.ma_windows.clone();

    tokio::task::spawn_blocking(move || -> Result<Option<ComputedCandles>> {
        let series = match loader.load(lookback, now)? {
            ShardLoad::NoData => return Ok(None),
            ShardLoad::Loaded(series) => series,
        };

        let mut by_resolution = BTreeMap::new();
        for resolution in resolutions {
            let mut candles = resample(&series, resolution);
            annotate(&mut candles, &metric, &windows);
            info!("Resampled {} samples into {} {} candles", series.len(), candles.len(), resolution);
            by_resolution.insert(resolution, candles);
        }
        Ok(Some((series.len(), by_resolution)))
    })
    .await?
}

async fn run_aggregation_pass(
    app_config: &AppConfig,
    config: &AggregatorsConfig,
    args: &AggregationPassArgs,
) -> Result<PassSummary> {
    let _guard = app_config.pass_lock.lock().await;
    let now = args.now.unwrap_or_else(Utc::now);
    let mut summary = PassSummary::empty(args.cadence, now);

    let lookback = if args.all_shards {
        None
    } else {
        match args.lookback_hours {
            Some(hours) => Some(Duration::hours(hours as i64)),
            None => config.lookback(args.cadence),
        }
    };
    let views = config.views_for(args.cadence);

    info!(
        "Starting {:?} pass over {} view(s), lookback {}",
        args.cadence,
        views.len(),
        lookback.map(|l| format!("{}h", l.num_hours())).unwrap_or_else(|| "all".to_string())
    );

    let Some((samples, candles)) = compute_candles(app_config, config, &views, lookback, now).await? else {
        info!("No shard data in scope, nothing to publish");
        summary.no_data = true;
        return Ok(summary);
    };
    summary.samples = samples;

    let chain = &app_config.publish_chain;
    let checkpoints = &app_config.checkpoints;

    for spec in &views {
        let computed = candles.get(&spec.resolution).map(Vec::as_slice).unwrap_or(&[]);
        let fresh = spec.window.apply(computed, &now);
        let mut view = ViewSummary {
            name: spec.name.clone(),
            fresh_rows: fresh.len(),
            ..Default::default()
        };

        let prior = resolve_prior(chain, &spec.key).await;
        if !prior.is_available() {
            warn!("Skipping {}: prior state unavailable", spec.key);
            view.skipped = Some("prior state unavailable".to_string());
            summary.failures += 1;
            summary.views.push(view);
            continue;
        }

        let rotation = rotate_if_due(chain, checkpoints, spec, &prior, computed, now).await?;
        if rotation.blocks_publish() {
            view.skipped = Some("rotation aborted".to_string());
            view.rotation = Some(rotation);
            summary.failures += 1;
            summary.views.push(view);
            continue;
        }

        let prior_rows = if rotation.rotated() { &[][..] } else { prior.candles() };
        if rotation != RotationOutcome::NotDue {
            view.rotation = Some(rotation);
        }

        let merged = merge_views(prior_rows, &fresh, spec.cap);
        let report = publish_view(chain, checkpoints, spec, &merged.candles, now).await?;
        if report.confirmed() {
            view.published_rows = Some(report.rows);
        } else {
            view.skipped = Some("publish not confirmed".to_string());
            summary.failures += 1;
        }
        summary.views.push(view);
    }

    let intervals = (
        app_config.fast_pass_interval.as_secs(),
        app_config.full_pass_interval.as_secs(),
    );
    if let Err(e) = publish_index(chain, checkpoints, &config.views, intervals, now).await {
        warn!("Failed to publish index: {}", e);
    }

    info!(
        "{:?} pass done: {} samples, {} view(s), {} failure(s)",
        args.cadence,
        summary.samples,
        summary.views.len(),
        summary.failures
    );
    Ok(summary)
}
