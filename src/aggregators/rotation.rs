use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::aggregators::aggregation_block::{serialize_candles, Candle};
use crate::aggregators::checkpoint;
use crate::aggregators::merge::{merge_views, resolve_prior, PriorView};
use crate::storage::StorageChain;
use crate::utils::kvstore::KvStore;
use crate::views::types::{RotationPolicy, ViewSpec};

/// What a rotation check did to one view.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RotationOutcome {
    NotDue,
    /// The view was frozen into `key` and reset.
    Archived { key: String, rows: usize },
    /// An archive for the covered date already existed; the view was reset without touching it.
    DiscardedExisting { key: String },
    /// Nothing covered the date, so no archive was written; the view was reset.
    ResetEmpty,
    /// The archive could not be confirmed; the view is untouched.
    Aborted { key: String, reason: String },
    /// The prior state could not be read, so nothing was decided.
    Skipped { reason: String },
}

impl RotationOutcome {
    /// The view was reset and starts empty.
    pub fn rotated(&self) -> bool {
        matches!(
            self,
            RotationOutcome::Archived { .. }
                | RotationOutcome::DiscardedExisting { .. }
                | RotationOutcome::ResetEmpty
        )
    }

    /// The view must not be published this tick.
    pub fn blocks_publish(&self) -> bool {
        matches!(self, RotationOutcome::Aborted { .. } | RotationOutcome::Skipped { .. })
    }
}

/// Whether `spec` has aged out, and for which date.
pub fn due_date(
    spec: &ViewSpec,
    newest_candle: Option<DateTime<Utc>>,
    last_write: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<NaiveDate> {
    let covered = newest_candle.unwrap_or(last_write).date_naive();

    let due = match spec.rotation {
        RotationPolicy::Never => false,
        RotationPolicy::MaxAgeHours(hours) => now - last_write > Duration::hours(hours as i64),
        RotationPolicy::CalendarDay => covered != now.date_naive(),
    };

    due.then_some(covered)
}

/// Candles frozen into the archive for `date`.
///
/// A calendar-day view stops taking candles of the covered day once the day is over,
/// so buckets recomputed after its last publish are folded in here.
fn archive_rows(spec: &ViewSpec, prior: &[Candle], computed: &[Candle], date: NaiveDate) -> Vec<Candle> {
    if spec.rotation != RotationPolicy::CalendarDay {
        return prior.to_vec();
    }
    let covered: Vec<Candle> = computed
        .iter()
        .filter(|c| c.time.date_naive() == date)
        .cloned()
        .collect();
    if covered.is_empty() {
        return prior.to_vec();
    }
    merge_views(prior, &covered, spec.cap).candles
}

/// Rotates `spec` if its policy says so, given the already resolved prior state.
///
/// `computed` holds this pass's candles at the view's resolution, before windowing.
pub async fn rotate_if_due(
    chain: &StorageChain,
    checkpoints: &KvStore,
    spec: &ViewSpec,
    prior: &PriorView,
    computed: &[Candle],
    now: DateTime<Utc>,
) -> Result<RotationOutcome> {
    if spec.rotation == RotationPolicy::Never {
        return Ok(RotationOutcome::NotDue);
    }

    if let PriorView::Unavailable { errors } = prior {
        let reason = format!("prior state unavailable ({} backend error(s))", errors.len());
        warn!("Rotation of {} skipped: {}", spec.name, reason);
        return Ok(RotationOutcome::Skipped { reason });
    }

    let last_write = match checkpoint::get_last_write(checkpoints, &spec.name).await {
        Ok(Some(at)) => Some(at),
        Ok(None) => chain.modified_time(&spec.key).await,
        Err(e) => {
            warn!("Ignoring checkpoint for {}: {}", spec.name, e);
            chain.modified_time(&spec.key).await
        }
    };
    let Some(last_write) = last_write else {
        return Ok(RotationOutcome::NotDue);
    };

    let candles = prior.candles();
    let newest = candles.last().map(|c| c.time);
    let Some(date) = due_date(spec, newest, last_write, now) else {
        return Ok(RotationOutcome::NotDue);
    };

    let archive_key = spec.archive_key(&date);
    let rows = archive_rows(spec, candles, computed, date);
    info!(
        "{} is due for rotation (covers {}, last write {})",
        spec.name, date, last_write
    );

    let outcome = match chain.exists_anywhere(&archive_key).await {
        Ok(true) => {
            info!("Archive {} already exists, discarding current {}", archive_key, spec.key);
            RotationOutcome::DiscardedExisting { key: archive_key }
        }
        Ok(false) if rows.is_empty() => {
            info!("{} is empty, nothing to archive", spec.key);
            RotationOutcome::ResetEmpty
        }
        Ok(false) => {
            let bytes = serialize_candles(&rows)?;
            let report = chain.put_all(&archive_key, &bytes).await;
            if !report.primary_acknowledged {
                let reason = format!("archive write not confirmed: {:?}", report.failed);
                warn!("Rotation of {} aborted: {}", spec.name, reason);
                return Ok(RotationOutcome::Aborted { key: archive_key, reason });
            }
            info!("Archived {} rows of {} to {}", rows.len(), spec.key, archive_key);
            RotationOutcome::Archived {
                key: archive_key,
                rows: rows.len(),
            }
        }
        Err(e) => {
            let reason = format!("could not check for an existing archive: {}", e);
            warn!("Rotation of {} aborted: {}", spec.name, reason);
            return Ok(RotationOutcome::Aborted { key: archive_key, reason });
        }
    };

    let reset = chain.put_all(&spec.key, b"[]").await;
    if !reset.primary_acknowledged {
        warn!("Reset of {} was not acknowledged by the primary store", spec.key);
    }
    checkpoint::save_last_write(checkpoints, &spec.name, now, 0).await?;

    Ok(outcome)
}

/// Standalone rotation check over `specs`.
pub async fn run_rotation_check(
    chain: &StorageChain,
    checkpoints: &KvStore,
    specs: &[ViewSpec],
    now: DateTime<Utc>,
) -> Result<Vec<(String, RotationOutcome)>> {
    let mut outcomes = Vec::new();
    for spec in specs {
        let prior = resolve_prior(chain, &spec.key).await;
        let outcome = rotate_if_due(chain, checkpoints, spec, &prior, &[], now).await?;
        outcomes.push((spec.name.clone(), outcome));
    }
    Ok(outcomes)
}
