use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use tracing::warn;

use crate::samples::types::SnapshotRecord;

pub const SHARD_EXTENSION: &str = "csv";

/// The rotation bucket a shard file belongs to, encoded in its name as
/// `<YYYY-MM-DD>_<HH>.csv`. Older daily shards named `<YYYY-MM-DD>.csv` span a whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardName {
    pub start: DateTime<Utc>,
    pub span: Duration,
}

impl ShardName {
    /// The bucket containing `now` for a given rotation width.
    pub fn for_time(now: &DateTime<Utc>, rotation_hours: u32) -> Self {
        let rotation_hours = rotation_hours.clamp(1, 24);
        let block = (now.hour() / rotation_hours) * rotation_hours;
        let start = now
            .date_naive()
            .and_hms_opt(block, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(*now);

        Self {
            start,
            span: Duration::hours(rotation_hours as i64),
        }
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".csv")?;
        let (date_part, hour_part) = match stem.split_once('_') {
            Some((date, hour)) => (date, Some(hour)),
            None => (stem, None),
        };

        let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
        match hour_part {
            Some(hour) => {
                let hour: u32 = hour.parse().ok()?;
                let start = date.and_hms_opt(hour, 0, 0)?.and_utc();
                Some(Self {
                    start,
                    span: Duration::hours(1),
                })
            }
            None => Some(Self {
                start: date.and_hms_opt(0, 0, 0)?.and_utc(),
                span: Duration::days(1),
            }),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}_{:02}.{}", self.start.format("%Y-%m-%d"), self.start.hour(), SHARD_EXTENSION)
    }

    /// Upper bound for the samples the shard may hold. Hourly names only carry their start
    /// hour, so the width comes from the writer's rotation.
    pub fn latest_possible_sample(&self, rotation_hours: u32) -> DateTime<Utc> {
        if self.span >= Duration::days(1) {
            self.start + self.span
        } else {
            self.start + Duration::hours(rotation_hours.clamp(1, 24) as i64)
        }
    }
}

/// Appends snapshot rows to the active shard in `dir`.
#[derive(Debug, Clone)]
pub struct ShardWriter {
    dir: PathBuf,
    rotation_hours: u32,
}

impl ShardWriter {
    pub fn new(dir: impl Into<PathBuf>, rotation_hours: u32) -> Self {
        Self {
            dir: dir.into(),
            rotation_hours,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn active_path(&self, now: &DateTime<Utc>) -> PathBuf {
        self.dir
            .join(ShardName::for_time(now, self.rotation_hours).file_name())
    }

    /// Appends one row, writing the header first when the shard is new.
    ///
    /// An unterminated last line left by an interrupted write is cut off first.
    pub fn append(&self, record: &SnapshotRecord, now: &DateTime<Utc>) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let path = self.active_path(now);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening shard {}", path.display()))?;

        let before = file.metadata()?.len();
        let kept = trim_torn_tail(&mut file)
            .with_context(|| format!("repairing shard {}", path.display()))?;
        if kept < before {
            warn!("Dropped {} bytes of a torn line from {}", before - kept, path.display());
        }
        let is_new = kept == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        writer
            .serialize(record)
            .map_err(|e| anyhow!("writing to {}: {}", path.display(), e))?;
        writer.flush()?;

        Ok(path)
    }
}

/// Truncates `file` after its last newline and returns the kept length.
fn trim_torn_tail(file: &mut File) -> std::io::Result<u64> {
    let len = file.metadata()?.len();
    let mut buf = [0u8; 4096];
    let mut end = len;

    while end > 0 {
        let start = end.saturating_sub(buf.len() as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;

        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            let keep = start + pos as u64 + 1;
            if keep < len {
                file.set_len(keep)?;
            }
            return Ok(keep);
        }
        end = start;
    }

    if len > 0 {
        file.set_len(0)?;
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::loader::ShardLoader;
    use crate::samples::types::ShardLoad;
    use chrono::TimeZone;
    use std::io::Write as _;

    fn record(ts: &str, price: f64) -> SnapshotRecord {
        SnapshotRecord {
            timestamp: ts.to_string(),
            asset: "BTC-USD".to_string(),
            exchange: "Coinbase".to_string(),
            price,
            bid: price - 0.5,
            ask: price + 0.5,
            spread: 1.0,
            volume: 10.0,
            spread_avg_l20: 2.0,
            spread_avg_l20_pct: 0.002,
        }
    }

    #[test]
    fn test_bucket_names_for_eight_hour_rotation() {
        let cases = [(0, "00"), (7, "00"), (8, "08"), (15, "08"), (16, "16"), (23, "16")];
        for (hour, label) in cases {
            let now = Utc.with_ymd_and_hms(2025, 8, 7, hour, 30, 0).unwrap();
            assert_eq!(
                ShardName::for_time(&now, 8).file_name(),
                format!("2025-08-07_{}.csv", label)
            );
        }
    }

    #[test]
    fn test_parse_names() {
        let parsed = ShardName::parse("2025-08-07_16.csv").unwrap();
        assert_eq!(parsed.start, Utc.with_ymd_and_hms(2025, 8, 7, 16, 0, 0).unwrap());
        assert_eq!(
            parsed.latest_possible_sample(8),
            Utc.with_ymd_and_hms(2025, 8, 8, 0, 0, 0).unwrap()
        );

        let daily = ShardName::parse("2025-07-06.csv").unwrap();
        assert_eq!(daily.span, Duration::days(1));
        assert_eq!(
            daily.latest_possible_sample(8),
            Utc.with_ymd_and_hms(2025, 7, 7, 0, 0, 0).unwrap()
        );

        assert!(ShardName::parse("notes.txt").is_none());
        assert!(ShardName::parse("2025-08-07_xx.csv").is_none());
        assert!(ShardName::parse("2025-08-07_25.csv").is_none());
    }

    #[test]
    fn test_append_writes_header_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = ShardWriter::new(dir.path(), 8);
        let now = Utc.with_ymd_and_hms(2025, 8, 7, 9, 0, 0).unwrap();

        let path = writer.append(&record("2025-08-07T09:00:00Z", 100.0), &now)?;
        writer.append(&record("2025-08-07T09:00:01Z", 101.0), &now)?;
        assert_eq!(path.file_name().unwrap(), "2025-08-07_08.csv");

        let contents = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,asset,exchange,price"));
        assert!(lines[0].ends_with("spread_avg_L20,spread_avg_L20_pct"));
        assert_eq!(contents.matches("timestamp").count(), 1);
        Ok(())
    }

    #[test]
    fn test_append_after_torn_line_keeps_shard_loadable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = ShardWriter::new(dir.path(), 8);
        let now = Utc.with_ymd_and_hms(2025, 8, 7, 9, 0, 0).unwrap();

        writer.append(&record("2025-08-07T09:00:00Z", 100.0), &now)?;
        let path = writer.append(&record("2025-08-07T09:00:01Z", 101.0), &now)?;
        OpenOptions::new()
            .append(true)
            .open(&path)?
            .write_all(b"2025-08-07T09:00:02Z,BTC-USD,Coin")?;

        writer.append(&record("2025-08-07T09:00:03Z", 103.0), &now)?;

        let contents = std::fs::read_to_string(&path)?;
        assert!(!contents.contains(",Coin2025"));
        assert_eq!(contents.lines().count(), 4);

        let loader = ShardLoader::new(dir.path(), 8, vec!["spread_avg_L20_pct".to_string()]);
        match loader.load(None, now)? {
            ShardLoad::Loaded(series) => {
                let prices: Vec<_> = series.samples.iter().map(|s| s.price).collect();
                assert_eq!(prices, vec![100.0, 101.0, 103.0]);
            }
            ShardLoad::NoData => panic!("expected the repaired shard to load"),
        }
        Ok(())
    }

    #[test]
    fn test_torn_header_is_rewritten() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = ShardWriter::new(dir.path(), 8);
        let now = Utc.with_ymd_and_hms(2025, 8, 7, 9, 0, 0).unwrap();
        std::fs::write(writer.active_path(&now), b"timestamp,ass")?;

        let path = writer.append(&record("2025-08-07T09:00:00Z", 100.0), &now)?;
        let contents = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("timestamp,asset,exchange,price"));
        Ok(())
    }
}
