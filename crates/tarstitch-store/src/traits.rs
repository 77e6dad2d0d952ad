//! Object store capability
//!
//! Every operation the archive builder needs from a store. Implementations
//! handle pagination and transport details themselves; callers see complete
//! results or a [`StoreError`](crate::StoreError) carrying operation, bucket
//! and key.

#![allow(missing_docs)]

use async_trait::async_trait;
use bytes::Bytes;

use tarstitch_formats::ByteRange;

use crate::error::StoreResult;
use crate::types::{CompletedPart, DeleteFailure, MultipartUpload, ObjectInfo, ObjectRef};

/// Largest key count accepted by one `delete_objects` call
pub const MAX_DELETE_BATCH: usize = 1000;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All objects whose key starts with `prefix`, in key order.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<ObjectInfo>>;

    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<ObjectInfo>;

    /// A range running past the end of the object is truncated to it.
    async fn get_object_range(&self, bucket: &str, key: &str, range: ByteRange)
    -> StoreResult<Bytes>;

    /// Returns the new object's etag.
    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> StoreResult<String>;

    /// Returns the upload id.
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> StoreResult<String>;

    /// Returns the part etag.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StoreResult<String>;

    /// Server-side copy of `range` of `source` into a part. Returns the part etag.
    async fn upload_part_copy(
        &self,
        source: &ObjectRef,
        range: ByteRange,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> StoreResult<String>;

    /// `parts` must be sorted by part number. Returns the final object's etag.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<String>;

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str)
    -> StoreResult<()>;

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> StoreResult<Vec<MultipartUpload>>;

    /// At most [`MAX_DELETE_BATCH`] keys. Returns the keys that could not be
    /// deleted; missing keys count as deleted.
    async fn delete_objects(&self, bucket: &str, keys: &[String])
    -> StoreResult<Vec<DeleteFailure>>;
}
