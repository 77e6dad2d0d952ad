//! Source enumeration

use bytes::Bytes;
use tracing::debug;

use tarstitch_formats::{ByteRange, Entry, HeaderMetadata, SourceRecord, parse_source_list};

use crate::error::{StoreError, StoreResult};
use crate::traits::ObjectStore;
use crate::types::{ObjectInfo, ObjectRef};

/// Turn a raw listing into archive entries
///
/// Directory placeholders (keys ending in `/`) are dropped wherever they
/// appear. The remaining objects keep listing order and are numbered from 1.
pub fn entries_from_listing(bucket: &str, objects: Vec<ObjectInfo>) -> Vec<Entry> {
    objects
        .into_iter()
        .filter(|object| !object.is_directory_marker())
        .enumerate()
        .map(|(index, object)| {
            let mtime = object.mtime();
            Entry::from_object(bucket, object.key, object.size, object.etag, index + 1)
                .with_metadata(HeaderMetadata::default().with_mtime(mtime))
        })
        .collect()
}

/// List every object under `prefix` as an archive entry
pub async fn list_entries(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
) -> StoreResult<Vec<Entry>> {
    let objects = store.list_objects(bucket, prefix).await?;
    let listed = objects.len();
    let entries = entries_from_listing(bucket, objects);
    debug!(
        "Listed {} objects under {}/{} ({} directory markers skipped)",
        entries.len(),
        bucket,
        prefix,
        listed - entries.len()
    );
    Ok(entries)
}

/// Turn source list rows into archive entries
///
/// Rows naming directory placeholders are dropped like they are from a
/// listing. The rest keep their order and are numbered from 1.
pub fn entries_from_manifest(records: Vec<SourceRecord>) -> Vec<Entry> {
    records
        .into_iter()
        .filter(|record| !record.key.ends_with('/'))
        .enumerate()
        .map(|(index, record)| {
            Entry::from_object(
                record.bucket,
                record.key,
                record.size,
                record.checksum,
                index + 1,
            )
        })
        .collect()
}

/// Read a source list from a local path or a `scheme://bucket/key` URL
pub async fn load_source_manifest(store: &dyn ObjectStore, location: &str) -> StoreResult<Bytes> {
    if !location.contains("://") {
        let body = tokio::fs::read(location).await.map_err(|e| {
            std::io::Error::new(e.kind(), format!("reading source list {location}: {e}"))
        })?;
        return Ok(Bytes::from(body));
    }

    let object = parse_store_url(location)?;
    if object.key.is_empty() {
        return Err(StoreError::InvalidConfig(format!(
            "source list {location} names no object key"
        )));
    }
    let info = store.head_object(&object.bucket, &object.key).await?;
    if info.size == 0 {
        return Ok(Bytes::new());
    }
    store
        .get_object_range(&object.bucket, &object.key, ByteRange::whole(info.size))
        .await
}

/// Entries named by the source list at `location`
pub async fn manifest_entries(
    store: &dyn ObjectStore,
    location: &str,
    skip_header: bool,
) -> StoreResult<Vec<Entry>> {
    let body = load_source_manifest(store, location).await?;
    let records = parse_source_list(&body, skip_header)?;
    let rows = records.len();
    let entries = entries_from_manifest(records);
    debug!(
        "Read {} entries from {} ({} directory markers skipped)",
        entries.len(),
        location,
        rows - entries.len()
    );
    Ok(entries)
}

/// Split a `s3://bucket/path` URL into bucket and path
///
/// The path may be empty. Any scheme is accepted as long as it is followed
/// by `://`.
pub fn parse_store_url(url: &str) -> StoreResult<ObjectRef> {
    let invalid =
        |reason: &str| StoreError::InvalidConfig(format!("invalid store URL {url:?}: {reason}"));

    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| invalid("expected scheme://bucket/path"))?;
    if scheme.is_empty() {
        return Err(invalid("missing scheme"));
    }
    let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(invalid("missing bucket"));
    }
    Ok(ObjectRef::new(bucket, path))
}
