use anyhow::{anyhow, Result};
use chrono::Duration;

use crate::aggregators::time_series::Resolution;
use crate::utils::commons::{env_opt, env_or, split_list};
use crate::views::types::{Cadence, RotationPolicy, ViewSpec, ViewWindow};

pub const DEFAULT_METRIC: &str = "spread_avg_L20_pct";

/// Knobs for the aggregation pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregatorsConfig {
    /// Metric columns read from shards. The first one drives the moving averages.
    pub metric_names: Vec<String>,
    pub ma_windows: Vec<usize>,
    pub shard_rotation_hours: u32,
    pub fast_lookback_hours: u32,
    /// `None` loads every shard on a full pass.
    pub full_lookback_hours: Option<u32>,
    pub views: Vec<ViewSpec>,
}

impl Default for AggregatorsConfig {
    fn default() -> Self {
        Self {
            metric_names: vec![DEFAULT_METRIC.to_string()],
            ma_windows: vec![50, 100, 200],
            shard_rotation_hours: 8,
            fast_lookback_hours: 24,
            full_lookback_hours: None,
            views: default_views(),
        }
    }
}

pub fn default_views() -> Vec<ViewSpec> {
    vec![
        ViewSpec {
            name: "recent".to_string(),
            key: "recent.json".to_string(),
            resolution: Resolution::OneMinute,
            cap: 720,
            window: ViewWindow::TrailingHours(12),
            cadence: Cadence::Fast,
            rotation: RotationPolicy::Never,
        },
        ViewSpec {
            name: "intraday".to_string(),
            key: "intraday.json".to_string(),
            resolution: Resolution::OneMinute,
            cap: 1440,
            window: ViewWindow::CurrentDay,
            cadence: Cadence::Fast,
            rotation: RotationPolicy::CalendarDay,
        },
        ViewSpec {
            name: "historical".to_string(),
            key: "historical.json".to_string(),
            resolution: Resolution::OneHour,
            cap: 15000,
            window: ViewWindow::All,
            cadence: Cadence::Full,
            rotation: RotationPolicy::MaxAgeHours(48),
        },
    ]
}

impl AggregatorsConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let metric_names = match env_opt::<String>("METRIC_COLUMNS")? {
            Some(raw) => split_list(&raw),
            None => defaults.metric_names,
        };
        if metric_names.is_empty() {
            return Err(anyhow!("METRIC_COLUMNS must name at least one column"));
        }

        let ma_windows = match env_opt::<String>("MA_WINDOWS")? {
            Some(raw) => parse_windows(&raw)?,
            None => defaults.ma_windows,
        };

        Ok(Self {
            metric_names,
            ma_windows,
            shard_rotation_hours: env_or("SHARD_ROTATION_HOURS", defaults.shard_rotation_hours)?,
            fast_lookback_hours: env_or("FAST_LOOKBACK_HOURS", defaults.fast_lookback_hours)?,
            full_lookback_hours: env_opt("FULL_LOOKBACK_HOURS")?,
            views: defaults.views,
        })
    }

    pub fn primary_metric(&self) -> &str {
        self.metric_names
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_METRIC)
    }

    pub fn lookback(&self, cadence: Cadence) -> Option<Duration> {
        match cadence {
            Cadence::Fast => Some(Duration::hours(self.fast_lookback_hours as i64)),
            Cadence::Full => self.full_lookback_hours.map(|h| Duration::hours(h as i64)),
        }
    }

    pub fn views_for(&self, cadence: Cadence) -> Vec<ViewSpec> {
        self.views.iter().filter(|v| v.runs_in(cadence)).cloned().collect()
    }

    pub fn view(&self, name: &str) -> Option<&ViewSpec> {
        self.views.iter().find(|v| v.name == name)
    }
}

fn parse_windows(raw: &str) -> Result<Vec<usize>> {
    let mut windows = split_list(raw)
        .iter()
        .map(|w| {
            w.parse::<usize>()
                .map_err(|e| anyhow!("Invalid MA window {:?}: {}", w, e))
        })
        .collect::<Result<Vec<_>>>()?;
    windows.retain(|w| *w > 0);
    windows.sort_unstable();
    windows.dedup();
    Ok(windows)
}
