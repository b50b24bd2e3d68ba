use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

use crate::aggregators::time_series::Resolution;
use crate::samples::types::{Sample, SampleSeries};
use crate::utils::commons::{finite, format_timestamp, parse_timestamp_value};

#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct MovingAverage {
    pub value: Option<f64>,
    pub valid: bool,
}

/// One resampled bucket.
///
/// Serialized flat: `time`, `price`, one key per metric mean, then `ma_<N>` and
/// `ma_<N>_valid` per window. Non-finite numbers are written as `null`.
#[derive(Clone, Debug, PartialEq)]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub price: Option<f64>,
    pub metrics: BTreeMap<String, Option<f64>>,
    pub averages: BTreeMap<usize, MovingAverage>,
}

impl Candle {
    pub fn new(time: DateTime<Utc>, price: Option<f64>) -> Self {
        Self {
            time,
            price,
            metrics: BTreeMap::new(),
            averages: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, name: &str, value: Option<f64>) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().flatten().and_then(finite)
    }

    /// Builds a candle from one element of a previously published array. Accepts `time`
    /// or the legacy `timestamp` key in any format `parse_timestamp` understands.
    /// Returns `None` when the row has no usable time.
    pub fn from_json_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let time = object
            .get("time")
            .or_else(|| object.get("timestamp"))
            .and_then(parse_timestamp_value)?;

        let mut candle = Candle::new(time, object.get("price").and_then(Value::as_f64).and_then(finite));

        for (key, value) in object {
            if matches!(key.as_str(), "time" | "timestamp" | "price") {
                continue;
            }

            if let Some(window) = average_window(key, "_valid") {
                if let Some(valid) = value.as_bool() {
                    candle.averages.entry(window).or_default().valid = valid;
                }
                continue;
            }
            if let Some(window) = average_window(key, "") {
                if value.is_number() || value.is_null() {
                    candle.averages.entry(window).or_default().value = value.as_f64().and_then(finite);
                }
                continue;
            }

            match value {
                Value::Number(n) => {
                    candle.metrics.insert(key.clone(), n.as_f64().and_then(finite));
                }
                Value::Null => {
                    candle.metrics.insert(key.clone(), None);
                }
                _ => {}
            }
        }

        Some(candle)
    }
}

/// `ma_<N><suffix>` -> N
fn average_window(key: &str, suffix: &str) -> Option<usize> {
    let digits = key.strip_prefix("ma_")?.strip_suffix(suffix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

impl Serialize for Candle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2 + self.metrics.len() + self.averages.len() * 2))?;
        map.serialize_entry("time", &format_timestamp(&self.time))?;
        map.serialize_entry("price", &self.price.and_then(finite))?;
        for (name, value) in &self.metrics {
            map.serialize_entry(name, &value.and_then(finite))?;
        }
        for (window, average) in &self.averages {
            map.serialize_entry(&format!("ma_{}", window), &average.value.and_then(finite))?;
            map.serialize_entry(&format!("ma_{}_valid", window), &average.valid)?;
        }
        map.end()
    }
}

/// Parsed contents of a published view file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandleArray {
    pub candles: Vec<Candle>,
    pub dropped: usize,
}

/// Parses a JSON array of candles row by row. Rows without a usable time are dropped and
/// counted; anything other than a top-level array is an error.
pub fn parse_candle_array(bytes: &[u8]) -> Result<CandleArray> {
    let value: Value = serde_json::from_slice(bytes)?;
    let rows = match value {
        Value::Array(rows) => rows,
        other => return Err(anyhow!("expected a JSON array, found {}", json_kind(&other))),
    };

    let mut parsed = CandleArray::default();
    for row in &rows {
        match Candle::from_json_value(row) {
            Some(candle) => parsed.candles.push(candle),
            None => parsed.dropped += 1,
        }
    }
    Ok(parsed)
}

pub fn serialize_candles(candles: &[Candle]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(candles)?)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Accumulates the samples that fall into one bucket.
#[derive(Clone, Debug)]
pub struct AggregationBlock {
    pub start: DateTime<Utc>,
    last_price: f64,
    sums: Vec<f64>,
    counts: Vec<usize>,
}

impl AggregationBlock {
    pub fn open(start: DateTime<Utc>, sample: &Sample) -> Self {
        let mut block = Self {
            start,
            last_price: sample.price,
            sums: vec![0.0; sample.metrics.len()],
            counts: vec![0; sample.metrics.len()],
        };
        block.push(sample);
        block
    }

    pub fn push(&mut self, sample: &Sample) {
        self.last_price = sample.price;
        for (i, value) in sample.metrics.iter().enumerate() {
            if i >= self.sums.len() {
                self.sums.resize(i + 1, 0.0);
                self.counts.resize(i + 1, 0);
            }
            if let Some(v) = value.and_then(finite) {
                self.sums[i] += v;
                self.counts[i] += 1;
            }
        }
    }

    pub fn close(self, metric_names: &[String]) -> Candle {
        let mut candle = Candle::new(self.start, finite(self.last_price));
        for (i, name) in metric_names.iter().enumerate() {
            let mean = match (self.sums.get(i), self.counts.get(i)) {
                (Some(sum), Some(count)) if *count > 0 => finite(sum / *count as f64),
                _ => None,
            };
            candle.metrics.insert(name.clone(), mean);
        }
        candle
    }
}

/// Bins a sorted series into epoch-aligned buckets. Empty buckets are omitted and a
/// trailing bucket is emitted as soon as it holds one sample.
pub fn resample(series: &SampleSeries, resolution: Resolution) -> Vec<Candle> {
    let mut candles = Vec::new();
    let mut current: Option<AggregationBlock> = None;

    for sample in &series.samples {
        let start = resolution.align(&sample.timestamp);
        match current.as_mut() {
            Some(block) if block.start == start => block.push(sample),
            _ => {
                if let Some(done) = current.take() {
                    candles.push(done.close(&series.metric_names));
                }
                current = Some(AggregationBlock::open(start, sample));
            }
        }
    }

    if let Some(done) = current {
        candles.push(done.close(&series.metric_names));
    }

    candles
}
