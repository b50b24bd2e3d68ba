use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

use crate::utils::commons::{format_timestamp, parse_timestamp};
use crate::utils::kvstore::KvStore;

const LAST_BACKUP_KEY: &str = "backup:last_run";

fn last_write_key(view: &str) -> String {
    format!("views:{}:last_write", view)
}

fn records_key(view: &str) -> String {
    format!("views:{}:records", view)
}

fn parse_stamp(key: &str, raw: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(raw).ok_or_else(|| anyhow!("Failed to parse checkpoint {}: {:?}", key, raw))
}

/// When `view` was last published or rotated. `None` if never recorded.
pub async fn get_last_write(store: &KvStore, view: &str) -> Result<Option<DateTime<Utc>>> {
    let key = last_write_key(view);
    match store.get_value_kv(&key).await? {
        Some(raw) if !raw.is_empty() => Ok(Some(parse_stamp(&key, &raw)?)),
        _ => Ok(None),
    }
}

/// Records a successful write of `view` holding `records` rows.
pub async fn save_last_write(
    store: &KvStore,
    view: &str,
    at: DateTime<Utc>,
    records: usize,
) -> Result<()> {
    store.set_value_kv(&last_write_key(view), &format_timestamp(&at)).await?;
    store.set_value_kv(&records_key(view), &records.to_string()).await?;
    Ok(())
}

pub async fn get_record_count(store: &KvStore, view: &str) -> Result<Option<usize>> {
    Ok(store
        .get_value_kv(&records_key(view))
        .await?
        .and_then(|raw| raw.parse().ok()))
}

/// Forgets everything recorded for `view`.
pub async fn clear_checkpoint(store: &KvStore, view: &str) -> Result<bool> {
    let a = store.remove_value_kv(&last_write_key(view)).await?;
    let b = store.remove_value_kv(&records_key(view)).await?;
    Ok(a || b)
}

pub async fn get_last_backup(store: &KvStore) -> Result<Option<DateTime<Utc>>> {
    match store.get_value_kv(LAST_BACKUP_KEY).await? {
        Some(raw) if !raw.is_empty() => Ok(Some(parse_stamp(LAST_BACKUP_KEY, &raw)?)),
        _ => Ok(None),
    }
}

pub async fn save_last_backup(store: &KvStore, at: DateTime<Utc>) -> Result<()> {
    store.set_value_kv(LAST_BACKUP_KEY, &format_timestamp(&at)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_checkpoint_key_generation() {
        assert_eq!(last_write_key("recent"), "views:recent:last_write");
        assert_eq!(records_key("historical"), "views:historical:records");
    }

    #[tokio::test]
    async fn test_last_write_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = KvStore::new(dir.path().join("state.json"));
        let at = Utc.with_ymd_and_hms(2025, 8, 7, 23, 59, 0).unwrap();

        assert_eq!(get_last_write(&store, "intraday").await?, None);
        save_last_write(&store, "intraday", at, 1440).await?;
        assert_eq!(get_last_write(&store, "intraday").await?, Some(at));
        assert_eq!(get_record_count(&store, "intraday").await?, Some(1440));

        assert!(clear_checkpoint(&store, "intraday").await?);
        assert_eq!(get_last_write(&store, "intraday").await?, None);
        assert!(!clear_checkpoint(&store, "intraday").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_stamp_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = KvStore::new(dir.path().join("state.json"));
        store.set_value_kv("views:recent:last_write", "soon").await?;
        assert!(get_last_write(&store, "recent").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_last_backup() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = KvStore::new(dir.path().join("state.json"));
        let at = Utc.with_ymd_and_hms(2025, 8, 7, 10, 30, 0).unwrap();
        save_last_backup(&store, at).await?;
        assert_eq!(get_last_backup(&store).await?, Some(at));
        Ok(())
    }
}
