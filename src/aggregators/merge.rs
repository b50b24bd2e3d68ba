use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::aggregators::aggregation_block::{parse_candle_array, Candle};
use crate::storage::StorageChain;

/// Previously published state of a view, as seen through the storage chain.
#[derive(Debug, Clone, PartialEq)]
pub enum PriorView {
    /// A parseable copy was found on `backend`.
    Found {
        backend: String,
        candles: Vec<Candle>,
        dropped: usize,
    },
    /// Every backend answered and none holds the key.
    Absent,
    /// No copy was found and at least one backend could not be read. Publishing now
    /// could overwrite newer data, so the view is left alone for this tick.
    Unavailable { errors: Vec<(String, String)> },
}

impl PriorView {
    pub fn candles(&self) -> &[Candle] {
        match self {
            PriorView::Found { candles, .. } => candles,
            _ => &[],
        }
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, PriorView::Unavailable { .. })
    }
}

/// Fetches the prior copy of `key` in chain order. The first backend holding a parseable
/// array wins; an unparseable copy is treated as absent on that backend.
pub async fn resolve_prior(chain: &StorageChain, key: &str) -> PriorView {
    let mut errors = Vec::new();

    for backend in chain.backends() {
        match backend.get(key).await {
            Ok(Some(bytes)) => match parse_candle_array(&bytes) {
                Ok(parsed) => {
                    if parsed.dropped > 0 {
                        warn!(
                            "Dropped {} unparseable row(s) from {} on {}",
                            parsed.dropped,
                            key,
                            backend.name()
                        );
                    }
                    debug!(
                        "Prior {} from {}: {} rows",
                        key,
                        backend.name(),
                        parsed.candles.len()
                    );
                    return PriorView::Found {
                        backend: backend.name().to_string(),
                        candles: parsed.candles,
                        dropped: parsed.dropped,
                    };
                }
                Err(e) => {
                    warn!("Ignoring unreadable {} on {}: {}", key, backend.name(), e);
                }
            },
            Ok(None) => debug!("{} not present on {}", key, backend.name()),
            Err(e) => {
                warn!("Failed to fetch {} from {}: {}", key, backend.name(), e);
                errors.push((backend.name().to_string(), e.to_string()));
            }
        }
    }

    if errors.is_empty() {
        PriorView::Absent
    } else {
        PriorView::Unavailable { errors }
    }
}

/// Result of reconciling fresh candles with a prior view.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedView {
    pub candles: Vec<Candle>,
    pub prior_rows: usize,
    pub fresh_rows: usize,
    pub replaced: usize,
    pub trimmed: usize,
}

/// Unions `prior` and `fresh` by `time`. Fresh rows replace prior rows at the same time,
/// the output is ascending, and only the newest `cap` rows are kept.
pub fn merge_views(prior: &[Candle], fresh: &[Candle], cap: usize) -> MergedView {
    let mut by_time: BTreeMap<DateTime<Utc>, Candle> = BTreeMap::new();

    for candle in prior {
        by_time.insert(candle.time, candle.clone());
    }

    let mut replaced = 0;
    for candle in fresh {
        if by_time.insert(candle.time, candle.clone()).is_some() {
            replaced += 1;
        }
    }

    let total = by_time.len();
    let trimmed = total.saturating_sub(cap);
    let candles: Vec<Candle> = by_time.into_values().skip(trimmed).collect();

    info!(
        "Merged view: {} existing + {} new = {} total ({} replaced, {} trimmed)",
        prior.len(),
        fresh.len(),
        total,
        replaced,
        trimmed
    );

    MergedView {
        candles,
        prior_rows: prior.len(),
        fresh_rows: fresh.len(),
        replaced,
        trimmed,
    }
}
