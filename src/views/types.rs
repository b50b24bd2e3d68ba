use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregators::aggregation_block::Candle;
use crate::aggregators::time_series::Resolution;

/// Which aggregation loop refreshes a view.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Every fast pass, over the recent shard lookback.
    Fast,
    /// Hourly, over the full shard window.
    Full,
}

/// Slice of freshly computed candles a view takes in each pass.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "kind", content = "hours", rename_all = "snake_case")]
pub enum ViewWindow {
    TrailingHours(u32),
    CurrentDay,
    All,
}

impl ViewWindow {
    /// Earliest candle time kept at `now`, or `None` for no lower bound.
    pub fn start(&self, now: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ViewWindow::TrailingHours(hours) => now.checked_sub_signed(Duration::hours(*hours as i64)),
            ViewWindow::CurrentDay => now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|midnight| midnight.and_utc()),
            ViewWindow::All => None,
        }
    }

    pub fn apply(&self, candles: &[Candle], now: &DateTime<Utc>) -> Vec<Candle> {
        match self.start(now) {
            Some(start) => candles.iter().filter(|c| c.time >= start).cloned().collect(),
            None => candles.to_vec(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "kind", content = "hours", rename_all = "snake_case")]
pub enum RotationPolicy {
    Never,
    /// Due once the last write is older than this many hours.
    MaxAgeHours(u32),
    /// Due once the newest candle is from an earlier UTC day.
    CalendarDay,
}

impl RotationPolicy {
    pub fn describe(&self) -> String {
        match self {
            RotationPolicy::Never => "never".to_string(),
            RotationPolicy::MaxAgeHours(hours) => format!("after {}h without a write", hours),
            RotationPolicy::CalendarDay => "daily at 00:00 UTC".to_string(),
        }
    }
}

/// A published view: where it lives and how it is kept.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ViewSpec {
    pub name: String,
    pub key: String,
    pub resolution: Resolution,
    pub cap: usize,
    pub window: ViewWindow,
    pub cadence: Cadence,
    pub rotation: RotationPolicy,
}

impl ViewSpec {
    pub fn archive_key(&self, date: &chrono::NaiveDate) -> String {
        format!("archive/{}/{}.json", self.resolution.label(), date.format("%Y-%m-%d"))
    }

    /// Full passes refresh every view, fast passes only the fast ones.
    pub fn runs_in(&self, cadence: Cadence) -> bool {
        cadence == Cadence::Full || self.cadence == Cadence::Fast
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn spec(cadence: Cadence) -> ViewSpec {
        ViewSpec {
            name: "intraday".to_string(),
            key: "intraday.json".to_string(),
            resolution: Resolution::OneMinute,
            cap: 1440,
            window: ViewWindow::CurrentDay,
            cadence,
            rotation: RotationPolicy::CalendarDay,
        }
    }

    #[test]
    fn test_window_start() {
        let now = Utc.with_ymd_and_hms(2025, 8, 7, 13, 30, 0).unwrap();
        assert_eq!(
            ViewWindow::TrailingHours(12).start(&now),
            Some(Utc.with_ymd_and_hms(2025, 8, 7, 1, 30, 0).unwrap())
        );
        assert_eq!(
            ViewWindow::CurrentDay.start(&now),
            Some(Utc.with_ymd_and_hms(2025, 8, 7, 0, 0, 0).unwrap())
        );
        assert_eq!(ViewWindow::All.start(&now), None);
        // Windows older than the calendar have no lower bound
        assert_eq!(ViewWindow::TrailingHours(u32::MAX).start(&now), None);
    }

    #[test]
    fn test_window_apply_keeps_boundary() {
        let now = Utc.with_ymd_and_hms(2025, 8, 7, 0, 30, 0).unwrap();
        let candles: Vec<Candle> = (-2..3)
            .map(|m| Candle::new(Utc.with_ymd_and_hms(2025, 8, 7, 0, 0, 0).unwrap() + Duration::minutes(m), Some(1.0)))
            .collect();
        let kept = ViewWindow::CurrentDay.apply(&candles, &now);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].time, Utc.with_ymd_and_hms(2025, 8, 7, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_archive_key_and_cadence() {
        let date = chrono::NaiveDate::from_ymd_opt(2025, 8, 7).unwrap();
        assert_eq!(spec(Cadence::Fast).archive_key(&date), "archive/1min/2025-08-07.json");

        assert!(spec(Cadence::Fast).runs_in(Cadence::Fast));
        assert!(spec(Cadence::Fast).runs_in(Cadence::Full));
        assert!(!spec(Cadence::Full).runs_in(Cadence::Fast));
    }

    #[test]
    fn test_policy_serde_shape() {
        let json = serde_json::to_value(RotationPolicy::MaxAgeHours(48)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "max_age_hours", "hours": 48}));
        let never = serde_json::to_value(RotationPolicy::Never).unwrap();
        assert_eq!(never, serde_json::json!({"kind": "never"}));
    }
}
