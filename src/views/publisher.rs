use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::aggregators::aggregation_block::{serialize_candles, Candle};
use crate::aggregators::checkpoint;
use crate::storage::{PutReport, StorageChain};
use crate::utils::commons::format_timestamp;
use crate::utils::kvstore::KvStore;
use crate::views::types::{Cadence, ViewSpec};

pub const INDEX_KEY: &str = "index.json";
const ARCHIVE_PREFIX: &str = "archive/";

#[derive(Serialize, Debug, Clone)]
pub struct PublishReport {
    pub key: String,
    pub rows: usize,
    pub bytes: usize,
    pub put: PutReport,
}

impl PublishReport {
    pub fn confirmed(&self) -> bool {
        self.put.primary_acknowledged
    }
}

/// Writes `candles` as `spec.key` to every backend and restamps the view's checkpoint
/// once the primary store has it.
pub async fn publish_view(
    chain: &StorageChain,
    checkpoints: &KvStore,
    spec: &ViewSpec,
    candles: &[Candle],
    now: DateTime<Utc>,
) -> Result<PublishReport> {
    let bytes = serialize_candles(candles)?;
    let put = chain.put_all(&spec.key, &bytes).await;

    if put.primary_acknowledged {
        checkpoint::save_last_write(checkpoints, &spec.name, now, candles.len()).await?;
        info!(
            "Published {} ({} rows, {} bytes) to {}",
            spec.key,
            candles.len(),
            bytes.len(),
            put.acknowledged.join(", ")
        );
    } else {
        warn!("Publishing {} was not confirmed by the primary store", spec.key);
    }

    Ok(PublishReport {
        key: spec.key.clone(),
        rows: candles.len(),
        bytes: bytes.len(),
        put,
    })
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct IndexViewEntry {
    pub file: String,
    pub resolution: String,
    pub records: Option<usize>,
    pub cap: usize,
    pub update_frequency: String,
    pub rotation: String,
    pub last_updated: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub generated_at: String,
    pub views: BTreeMap<String, IndexViewEntry>,
    /// Archived dates per resolution label, oldest first.
    pub archives: BTreeMap<String, Vec<String>>,
}

fn update_frequency(cadence: Cadence, fast_secs: u64, full_secs: u64) -> String {
    let secs = match cadence {
        Cadence::Fast => fast_secs,
        Cadence::Full => full_secs,
    };
    if secs % 3600 == 0 {
        format!("every {}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("every {}min", secs / 60)
    } else {
        format!("every {}s", secs)
    }
}

/// Groups `archive/<resolution>/<date>.json` keys by resolution.
pub fn group_archives<'a>(keys: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, Vec<String>> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(ARCHIVE_PREFIX) else {
            continue;
        };
        let Some((resolution, file)) = rest.split_once('/') else {
            continue;
        };
        if let Some(date) = file.strip_suffix(".json") {
            grouped.entry(resolution.to_string()).or_default().push(date.to_string());
        }
    }
    for dates in grouped.values_mut() {
        dates.sort();
        dates.dedup();
    }
    grouped
}

/// Builds and writes `index.json` from checkpoints and the archive listing.
pub async fn publish_index(
    chain: &StorageChain,
    checkpoints: &KvStore,
    specs: &[ViewSpec],
    pass_secs: (u64, u64),
    now: DateTime<Utc>,
) -> Result<IndexDocument> {
    let mut views = BTreeMap::new();
    for spec in specs {
        let last_write = checkpoint::get_last_write(checkpoints, &spec.name)
            .await
            .unwrap_or(None);
        views.insert(
            spec.name.clone(),
            IndexViewEntry {
                file: spec.key.clone(),
                resolution: spec.resolution.label().to_string(),
                records: checkpoint::get_record_count(checkpoints, &spec.name).await?,
                cap: spec.cap,
                update_frequency: update_frequency(spec.cadence, pass_secs.0, pass_secs.1),
                rotation: spec.rotation.describe(),
                last_updated: last_write.as_ref().map(format_timestamp),
            },
        );
    }

    let archives = match chain.list_first(ARCHIVE_PREFIX).await {
        Ok((_, objects)) => group_archives(objects.iter().map(|o| o.key.as_str())),
        Err(e) => {
            warn!("Could not list archives for the index: {}", e);
            BTreeMap::new()
        }
    };

    let document = IndexDocument {
        generated_at: format_timestamp(&now),
        views,
        archives,
    };

    let bytes = serde_json::to_vec_pretty(&document)?;
    let put = chain.put_all(INDEX_KEY, &bytes).await;
    if !put.any_acknowledged() {
        warn!("index.json was not stored on any backend");
    }

    Ok(document)
}
