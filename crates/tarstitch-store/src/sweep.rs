//! Cleanup of abandoned multipart uploads

use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::traits::ObjectStore;

/// Abort every in-progress multipart upload in `bucket` under `prefix`
///
/// Returns the number of uploads aborted. Stops at the first abort that
/// fails, reporting its upload id and key.
pub async fn abort_all_uploads(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
) -> StoreResult<usize> {
    let uploads = store.list_multipart_uploads(bucket, prefix).await?;
    for upload in &uploads {
        info!(
            "Aborting upload {} for {}/{}",
            upload.upload_id, bucket, upload.key
        );
        store
            .abort_multipart_upload(bucket, &upload.key, &upload.upload_id)
            .await
            .map_err(|source| StoreError::AbortFailed {
                bucket: bucket.to_string(),
                key: upload.key.clone(),
                upload_id: upload.upload_id.clone(),
                source: Box::new(source),
            })?;
    }
    Ok(uploads.len())
}
