use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::samples::shard::{ShardName, SHARD_EXTENSION};
use crate::samples::types::{Sample, SampleSeries, ShardLoad};
use crate::utils::commons::{finite, parse_timestamp};

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("failed to read shard {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("shard {path} has no `{column}` column")]
    MissingColumn { path: PathBuf, column: String },
    #[error("shard {path} line {line}: {message}")]
    Malformed {
        path: PathBuf,
        line: u64,
        message: String,
    },
}

/// Reads every shard in a directory into one deduplicated series.
#[derive(Debug, Clone)]
pub struct ShardLoader {
    dir: PathBuf,
    rotation_hours: u32,
    metric_names: Vec<String>,
}

impl ShardLoader {
    pub fn new(dir: impl Into<PathBuf>, rotation_hours: u32, metric_names: Vec<String>) -> Self {
        Self {
            dir: dir.into(),
            rotation_hours,
            metric_names,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metric_names(&self) -> &[String] {
        &self.metric_names
    }

    /// Shards in window, in discovery order. Lexical file name order follows bucket order.
    pub fn discover(&self, cutoff: Option<DateTime<Utc>>) -> Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(e).with_context(|| format!("listing {}", self.dir.display()));
            }
        };

        let mut shards = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(SHARD_EXTENSION) {
                continue;
            }

            if let Some(cutoff) = cutoff {
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .map(system_time_to_utc);
                let freshest = modified.or_else(|| {
                    path.file_name()
                        .and_then(|n| n.to_str())
                        .and_then(ShardName::parse)
                        .map(|name| name.latest_possible_sample(self.rotation_hours))
                });

                match freshest {
                    Some(ts) if ts < cutoff => {
                        debug!("Skipping {} (outside lookback)", path.display());
                        continue;
                    }
                    _ => {}
                }
            }

            shards.push(path);
        }

        shards.sort();
        Ok(shards)
    }

    /// Loads the shards touched within `lookback` of `now`, or every shard when it is `None`.
    ///
    /// A lookback reaching past the earliest representable time loads every shard.
    pub fn load(&self, lookback: Option<Duration>, now: DateTime<Utc>) -> Result<ShardLoad> {
        let cutoff = lookback.and_then(|window| now.checked_sub_signed(window));
        let shards = self.discover(cutoff)?;

        let mut rows: Vec<Sample> = Vec::new();
        let mut contributing = 0usize;

        for path in &shards {
            match self.parse_shard(path) {
                Ok(parsed) => {
                    let before = rows.len();
                    rows.extend(
                        parsed
                            .into_iter()
                            .filter(|s| cutoff.is_none_or(|c| s.timestamp >= c)),
                    );
                    if rows.len() > before {
                        contributing += 1;
                    }
                }
                Err(e) => warn!("Skipping shard: {}", e),
            }
        }

        if rows.is_empty() {
            info!("No sample data in {} shard(s) under {}", shards.len(), self.dir.display());
            return Ok(ShardLoad::NoData);
        }

        let loaded = rows.len();
        let samples = dedup_last_wins(rows);
        info!(
            "Loaded {} samples ({} unique) from {}/{} shard(s)",
            loaded,
            samples.len(),
            contributing,
            shards.len()
        );

        Ok(ShardLoad::Loaded(SampleSeries {
            metric_names: self.metric_names.clone(),
            samples,
        }))
    }

    fn parse_shard(&self, path: &Path) -> Result<Vec<Sample>, ShardError> {
        let bytes = std::fs::read(path).map_err(|source| ShardError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let complete = complete_lines(&bytes);
        if complete.is_empty() {
            return Ok(vec![]);
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(complete);

        let malformed = |line: u64, message: String| ShardError::Malformed {
            path: path.to_path_buf(),
            line,
            message,
        };

        let headers = reader
            .headers()
            .map_err(|e| malformed(1, e.to_string()))?
            .clone();
        let column = |name: &str| headers.iter().position(|h| h == name);
        let missing = |name: &str| ShardError::MissingColumn {
            path: path.to_path_buf(),
            column: name.to_string(),
        };

        let ts_idx = column("timestamp").ok_or_else(|| missing("timestamp"))?;
        let price_idx = column("price").ok_or_else(|| missing("price"))?;
        let metric_idx: Vec<Option<usize>> =
            self.metric_names.iter().map(|name| column(name)).collect();

        let mut samples = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| {
                let line = e.position().map(|p| p.line()).unwrap_or(0);
                malformed(line, e.to_string())
            })?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);

            let raw_ts = record.get(ts_idx).unwrap_or_default();
            let timestamp = parse_timestamp(raw_ts)
                .ok_or_else(|| malformed(line, format!("bad timestamp {:?}", raw_ts)))?;

            let raw_price = record.get(price_idx).unwrap_or_default();
            let price = raw_price
                .parse::<f64>()
                .ok()
                .and_then(finite)
                .ok_or_else(|| malformed(line, format!("bad price {:?}", raw_price)))?;

            let mut metrics = Vec::with_capacity(metric_idx.len());
            for (idx, name) in metric_idx.iter().zip(&self.metric_names) {
                let value = match idx.and_then(|i| record.get(i)) {
                    None | Some("") => None,
                    Some(raw) => {
                        let parsed = raw
                            .parse::<f64>()
                            .map_err(|_| malformed(line, format!("bad {} {:?}", name, raw)))?;
                        finite(parsed)
                    }
                };
                metrics.push(value);
            }

            samples.push(Sample {
                timestamp,
                price,
                metrics,
            });
        }

        Ok(samples)
    }
}

/// Everything up to and including the last newline. A trailing line without one is an
/// append still in flight.
fn complete_lines(bytes: &[u8]) -> &[u8] {
    match bytes.iter().rposition(|b| *b == b'\n') {
        Some(end) => &bytes[..=end],
        None => &[],
    }
}

/// Stable sort by timestamp, keeping the last occurrence of each timestamp.
pub fn dedup_last_wins(mut rows: Vec<Sample>) -> Vec<Sample> {
    rows.sort_by_key(|s| s.timestamp);

    let mut deduped: Vec<Sample> = Vec::with_capacity(rows.len());
    for sample in rows {
        match deduped.last_mut() {
            Some(last) if last.timestamp == sample.timestamp => *last = sample,
            _ => deduped.push(sample),
        }
    }
    deduped
}

fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fmt::Write as _;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 7, 0, 0, 0).unwrap()
    }

    fn shard_body(range: std::ops::Range<i64>, price: f64) -> String {
        let mut body = String::from("timestamp,asset,exchange,price,spread_avg_L20_pct\n");
        for t in range {
            let ts = base() + Duration::seconds(t);
            writeln!(body, "{},BTC-USD,Coinbase,{},{}", ts.to_rfc3339(), price, t as f64 / 1000.0).unwrap();
        }
        body
    }

    fn loader(dir: &Path) -> ShardLoader {
        ShardLoader::new(dir, 8, vec!["spread_avg_L20_pct".to_string()])
    }

    fn loaded(load: ShardLoad) -> SampleSeries {
        match load {
            ShardLoad::Loaded(series) => series,
            ShardLoad::NoData => panic!("expected data"),
        }
    }

    #[test]
    fn test_overlapping_shards_last_discovered_wins() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("2025-08-07_00.csv"), shard_body(0..100, 1.0))?;
        std::fs::write(dir.path().join("2025-08-07_08.csv"), shard_body(50..150, 2.0))?;
        std::fs::write(dir.path().join("2025-08-07_16.csv"), "")?;

        let series = loaded(loader(dir.path()).load(None, base())?);
        assert_eq!(series.len(), 150);

        for (i, sample) in series.samples.iter().enumerate() {
            assert_eq!(sample.timestamp, base() + Duration::seconds(i as i64));
            let expected = if i < 50 { 1.0 } else { 2.0 };
            assert_eq!(sample.price, expected, "price at t={}", i);
        }

        let unique: std::collections::BTreeSet<_> =
            series.samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(unique.len(), series.len());
        Ok(())
    }

    #[test]
    fn test_malformed_shard_is_skipped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("2025-08-07_00.csv"), shard_body(0..10, 1.0))?;

        let mut bad = shard_body(10..20, 3.0);
        bad.push_str("not-a-time,BTC-USD,Coinbase,1.0,0.1\n");
        std::fs::write(dir.path().join("2025-08-07_08.csv"), bad)?;

        std::fs::write(dir.path().join("2025-08-07_16.csv"), "asset,price\nBTC,1.0\n")?;

        let series = loaded(loader(dir.path()).load(None, base())?);
        assert_eq!(series.len(), 10);
        assert!(series.samples.iter().all(|s| s.price == 1.0));
        Ok(())
    }

    #[test]
    fn test_trailing_partial_line_is_ignored() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut body = shard_body(0..5, 1.0);
        body.push_str("2025-08-07T00:00:05+00:00,BTC-USD,Coin");
        std::fs::write(dir.path().join("2025-08-07_00.csv"), body)?;

        let series = loaded(loader(dir.path()).load(None, base())?);
        assert_eq!(series.len(), 5);
        Ok(())
    }

    #[test]
    fn test_missing_metric_values_are_none() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let body = "timestamp,price,spread_avg_L20_pct\n\
                    2025-08-07 00:00:00,100.0,\n\
                    2025-08-07 00:00:01,100.5,NaN\n\
                    2025-08-07 00:00:02,101.0,0.25\n";
        std::fs::write(dir.path().join("2025-08-07_00.csv"), body)?;

        let series = loaded(loader(dir.path()).load(None, base())?);
        let metrics: Vec<_> = series.samples.iter().map(|s| s.metrics[0]).collect();
        assert_eq!(metrics, vec![None, None, Some(0.25)]);
        Ok(())
    }

    #[test]
    fn test_lookback_filters_files_and_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let now = base() + Duration::seconds(200);

        let old = dir.path().join("2025-08-04_00.csv");
        std::fs::write(&old, shard_body(-3 * 86_400..-3 * 86_400 + 10, 9.0))?;
        let three_days_ago = SystemTime::now() - std::time::Duration::from_secs(3 * 86_400);
        std::fs::File::options()
            .write(true)
            .open(&old)?
            .set_modified(three_days_ago)?;

        std::fs::write(dir.path().join("2025-08-07_00.csv"), shard_body(0..200, 1.0))?;

        let l = loader(dir.path());
        // Files older than the window are not discovered
        assert_eq!(l.discover(Some(Utc::now() - Duration::hours(24)))?.len(), 1);

        // Rows older than the cutoff are dropped
        let series = loaded(l.load(Some(Duration::seconds(100)), now)?);
        assert_eq!(series.len(), 100);
        assert_eq!(series.first_timestamp(), Some(base() + Duration::seconds(100)));
        Ok(())
    }

    #[test]
    fn test_huge_lookback_loads_everything() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("2025-08-07_00.csv"), shard_body(0..50, 1.0))?;

        let l = loader(dir.path());
        let huge = Duration::hours(u32::MAX as i64);
        let series = loaded(l.load(Some(huge), base() + Duration::seconds(60))?);
        assert_eq!(series.len(), 50);
        assert_eq!(loaded(l.load(None, base())?).len(), 50);
        Ok(())
    }

    #[test]
    fn test_no_data_is_distinct() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(loader(&dir.path().join("missing")).load(None, base())?, ShardLoad::NoData);

        std::fs::write(dir.path().join("2025-08-07_00.csv"), "")?;
        assert_eq!(loader(dir.path()).load(None, base())?, ShardLoad::NoData);
        Ok(())
    }
}
