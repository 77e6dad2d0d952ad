//! Batched source deletion

use std::collections::BTreeMap;

use tracing::{info, warn};

use tarstitch_formats::{Entry, EntrySource};

use crate::error::{StoreError, StoreResult};
use crate::traits::{MAX_DELETE_BATCH, ObjectStore};

/// Delete `keys` from `bucket` in batches of at most 1000
///
/// Batches run in order. The first batch that reports failures stops the
/// run; its failed keys are returned in [`StoreError::PartialBatchDelete`]
/// and later batches are never issued. Returns the number of keys deleted.
pub async fn delete_keys(
    store: &dyn ObjectStore,
    bucket: &str,
    keys: &[String],
) -> StoreResult<usize> {
    let mut deleted = 0;
    for (index, batch) in keys.chunks(MAX_DELETE_BATCH).enumerate() {
        let failed = store.delete_objects(bucket, batch).await?;
        if !failed.is_empty() {
            warn!(
                "Delete batch {} in {} failed for {} of {} keys",
                index + 1,
                bucket,
                failed.len(),
                batch.len()
            );
            return Err(StoreError::PartialBatchDelete {
                bucket: bucket.to_string(),
                failed,
            });
        }
        deleted += batch.len();
    }
    info!("Deleted {} objects from {}", deleted, bucket);
    Ok(deleted)
}

/// Delete the stored sources of `entries`
///
/// Entries are grouped by bucket; in-memory entries are skipped.
pub async fn delete_entries(store: &dyn ObjectStore, entries: &[Entry]) -> StoreResult<usize> {
    let mut by_bucket: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for entry in entries {
        if let EntrySource::Object { bucket, key } = &entry.source {
            by_bucket.entry(bucket).or_default().push(key.clone());
        }
    }

    let mut deleted = 0;
    for (bucket, keys) in by_bucket {
        deleted += delete_keys(store, bucket, &keys).await?;
    }
    Ok(deleted)
}
