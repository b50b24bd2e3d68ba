use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One per-second observation after loading. `metrics` is positionally aligned with
/// the owning series' `metric_names`; `None` marks a missing or non-finite value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub metrics: Vec<Option<f64>>,
}

/// A chronologically sorted, timestamp-unique run of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSeries {
    pub metric_names: Vec<String>,
    pub samples: Vec<Sample>,
}

impl SampleSeries {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.first().map(|s| s.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.last().map(|s| s.timestamp)
    }
}

/// Result of a shard load. `NoData` is a normal outcome, distinct from an empty series.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardLoad {
    NoData,
    Loaded(SampleSeries),
}

/// Row layout written by the sampler, one per tick.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub timestamp: String,
    pub asset: String,
    pub exchange: String,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    pub volume: f64,
    #[serde(rename = "spread_avg_L20")]
    pub spread_avg_l20: f64,
    #[serde(rename = "spread_avg_L20_pct")]
    pub spread_avg_l20_pct: f64,
}
