use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Candle widths the resampler can produce. Buckets are aligned to the UTC epoch grid,
/// so each width lands on calendar boundaries.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum)]
pub enum Resolution {
    #[serde(rename = "1min")]
    #[value(name = "1min")]
    OneMinute,
    #[serde(rename = "10min")]
    #[value(name = "10min")]
    TenMinutes,
    #[serde(rename = "1hr")]
    #[value(name = "1hr")]
    OneHour,
}

impl Resolution {
    pub fn seconds(&self) -> i64 {
        match self {
            Resolution::OneMinute => 60,
            Resolution::TenMinutes => 600,
            Resolution::OneHour => 3600,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// Label used in archive keys and `index.json`.
    pub fn label(&self) -> &'static str {
        match self {
            Resolution::OneMinute => "1min",
            Resolution::TenMinutes => "10min",
            Resolution::OneHour => "1hr",
        }
    }

    /// Floor of `ts` onto this resolution's grid.
    pub fn align(&self, ts: &DateTime<Utc>) -> DateTime<Utc> {
        let width = self.seconds();
        let aligned = ts.timestamp().div_euclid(width) * width;
        DateTime::from_timestamp(aligned, 0).unwrap_or(*ts)
    }

    pub fn is_aligned(&self, ts: &DateTime<Utc>) -> bool {
        ts.timestamp().rem_euclid(self.seconds()) == 0 && ts.timestamp_subsec_nanos() == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Resolution {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "1min" | "1m" => Ok(Resolution::OneMinute),
            "10min" | "10m" => Ok(Resolution::TenMinutes),
            "1hr" | "1h" => Ok(Resolution::OneHour),
            other => Err(anyhow!(
                "Invalid resolution {}. Expected: 1min, 10min or 1hr",
                other
            )),
        }
    }
}
