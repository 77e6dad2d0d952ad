//! In-process object store
//!
//! Behaves like an S3 bucket for everything the archive builder touches,
//! including multipart part-size limits on completion. Failures can be
//! injected so the assembler's error paths are testable.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use tarstitch_formats::{ByteRange, PartLimits};

use crate::error::{StoreError, StoreResult};
use crate::token::random_hex;
use crate::traits::{MAX_DELETE_BATCH, ObjectStore};
use crate::types::{CompletedPart, DeleteFailure, MultipartUpload, ObjectInfo, ObjectRef};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    last_modified: SystemTime,
}

impl StoredObject {
    fn new(data: Bytes) -> Self {
        let etag = hex::encode(md5::compute(&data).0);
        Self {
            data,
            etag,
            last_modified: SystemTime::now(),
        }
    }

    fn info(&self, key: &str) -> ObjectInfo {
        ObjectInfo {
            key: key.to_string(),
            size: self.data.len() as u64,
            etag: self.etag.clone(),
            last_modified: Some(self.last_modified),
        }
    }
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (Bytes, String)>,
}

#[derive(Debug, Default)]
struct Faults {
    /// Keys whose deletion is reported as failed
    undeletable: HashSet<String>,
    /// Remaining part writes that fail before touching state
    part_failures: usize,
    /// Whether injected part failures are transient
    part_failures_transient: bool,
}

#[derive(Debug, Default)]
struct Inner {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    uploads: HashMap<String, PendingUpload>,
    faults: Faults,
    delete_batches: Vec<usize>,
    part_writes: usize,
    head_calls: usize,
}

/// Object store held entirely in memory
#[derive(Debug)]
pub struct MemoryStore {
    limits: PartLimits,
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store enforcing the S3 multipart limits
    pub fn new() -> Self {
        Self::with_limits(PartLimits::S3)
    }

    /// Store enforcing custom multipart limits
    pub fn with_limits(limits: PartLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Multipart limits enforced on completion
    pub fn limits(&self) -> PartLimits {
        self.limits
    }

    /// Store an object directly, returning its etag
    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) -> String {
        let object = StoredObject::new(data.into());
        let etag = object.etag.clone();
        self.inner
            .lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
        etag
    }

    /// Content of an object, if present
    pub fn get(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.inner
            .lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|object| object.data.clone())
    }

    /// Keys currently stored in `bucket`, in order
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.inner
            .lock()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Report `key` as undeletable in every later batch delete
    pub fn fail_delete(&self, key: impl Into<String>) {
        self.inner.lock().faults.undeletable.insert(key.into());
    }

    /// Fail the next `count` part writes (upload or copy)
    pub fn fail_part_writes(&self, count: usize, transient: bool) {
        let mut inner = self.inner.lock();
        inner.faults.part_failures = count;
        inner.faults.part_failures_transient = transient;
    }

    /// Key counts of every batch delete issued so far
    pub fn delete_batches(&self) -> Vec<usize> {
        self.inner.lock().delete_batches.clone()
    }

    /// Part writes attempted so far, including failed ones
    pub fn part_writes(&self) -> usize {
        self.inner.lock().part_writes
    }

    /// `head_object` calls so far
    pub fn head_calls(&self) -> usize {
        self.inner.lock().head_calls
    }

    /// Number of multipart uploads not yet completed or aborted
    pub fn pending_uploads(&self) -> usize {
        self.inner.lock().uploads.len()
    }

    fn object<'a>(inner: &'a Inner, bucket: &str, key: &str) -> StoreResult<&'a StoredObject> {
        inner
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .ok_or_else(|| StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    fn slice(
        operation: &'static str,
        bucket: &str,
        key: &str,
        object: &StoredObject,
        range: ByteRange,
    ) -> StoreResult<Bytes> {
        let size = object.data.len() as u64;
        if range.start > size || (range.start == size && !range.is_empty()) {
            return Err(StoreError::Rejected {
                operation,
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: format!("range {range} not satisfiable for {size} bytes"),
            });
        }
        let end = range.end().min(size);
        Ok(object.data.slice(range.start as usize..end as usize))
    }

    fn take_part_fault(
        inner: &mut Inner,
        operation: &'static str,
        bucket: &str,
        key: &str,
    ) -> StoreResult<()> {
        inner.part_writes += 1;
        if inner.faults.part_failures == 0 {
            return Ok(());
        }
        inner.faults.part_failures -= 1;
        let message = "injected failure";
        Err(if inner.faults.part_failures_transient {
            StoreError::transient(operation, bucket, key, message)
        } else {
            StoreError::permanent(operation, bucket, key, message)
        })
    }

    fn upload<'a>(
        inner: &'a mut Inner,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StoreResult<&'a mut PendingUpload> {
        match inner.uploads.get_mut(upload_id) {
            Some(upload) if upload.bucket == bucket && upload.key == key => Ok(upload),
            _ => Err(StoreError::NoSuchUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                upload_id: upload_id.to_string(),
            }),
        }
    }

    fn check_part_number(&self, bucket: &str, key: &str, part_number: u32) -> StoreResult<()> {
        if part_number == 0 || u64::from(part_number) > self.limits.max_part_count {
            return Err(StoreError::Rejected {
                operation: "upload_part",
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: format!(
                    "part number {part_number} outside 1..={}",
                    self.limits.max_part_count
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<ObjectInfo>> {
        let inner = self.inner.lock();
        let Some(objects) = inner.buckets.get(bucket) else {
            return Ok(Vec::new());
        };
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| object.info(key))
            .collect())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<ObjectInfo> {
        let mut inner = self.inner.lock();
        inner.head_calls += 1;
        Ok(Self::object(&inner, bucket, key)?.info(key))
    }

    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        range: ByteRange,
    ) -> StoreResult<Bytes> {
        let inner = self.inner.lock();
        let object = Self::object(&inner, bucket, key)?;
        Self::slice("get_object_range", bucket, key, object, range)
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> StoreResult<String> {
        Ok(self.insert(bucket, key, data))
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> StoreResult<String> {
        let upload_id = random_hex(16);
        self.inner.lock().uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        debug!("Created upload {} for {}/{}", upload_id, bucket, key);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StoreResult<String> {
        self.check_part_number(bucket, key, part_number)?;
        let mut inner = self.inner.lock();
        Self::take_part_fault(&mut inner, "upload_part", bucket, key)?;
        let upload = Self::upload(&mut inner, bucket, key, upload_id)?;
        let etag = hex::encode(md5::compute(&data).0);
        upload.parts.insert(part_number, (data, etag.clone()));
        Ok(etag)
    }

    async fn upload_part_copy(
        &self,
        source: &ObjectRef,
        range: ByteRange,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> StoreResult<String> {
        self.check_part_number(bucket, key, part_number)?;
        let mut inner = self.inner.lock();
        Self::take_part_fault(&mut inner, "upload_part_copy", bucket, key)?;
        let object = Self::object(&inner, &source.bucket, &source.key)?;
        let data = Self::slice(
            "upload_part_copy",
            &source.bucket,
            &source.key,
            object,
            range,
        )?;
        if (data.len() as u64) < range.len {
            return Err(StoreError::Rejected {
                operation: "upload_part_copy",
                bucket: source.bucket.clone(),
                key: source.key.clone(),
                reason: format!("range {range} runs past the end of the object"),
            });
        }
        let upload = Self::upload(&mut inner, bucket, key, upload_id)?;
        let etag = hex::encode(md5::compute(&data).0);
        upload.parts.insert(part_number, (data, etag.clone()));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<String> {
        let rejected = |reason: String| StoreError::Rejected {
            operation: "complete_multipart_upload",
            bucket: bucket.to_string(),
            key: key.to_string(),
            reason,
        };

        let mut inner = self.inner.lock();
        let upload = Self::upload(&mut inner, bucket, key, upload_id)?;
        if parts.is_empty() {
            return Err(rejected("no parts given".to_string()));
        }
        if parts.len() as u64 > self.limits.max_part_count {
            return Err(rejected(format!("{} parts exceed the limit", parts.len())));
        }
        if !parts.is_sorted_by(|a, b| a.part_number < b.part_number) {
            return Err(rejected("parts are not in ascending order".to_string()));
        }

        let mut body = BytesMut::new();
        let mut digests = Vec::with_capacity(parts.len() * 16);
        for (index, part) in parts.iter().enumerate() {
            let Some((data, etag)) = upload.parts.get(&part.part_number) else {
                return Err(rejected(format!(
                    "part {} was never uploaded",
                    part.part_number
                )));
            };
            if *etag != part.etag {
                return Err(rejected(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            let len = data.len() as u64;
            let is_last = index + 1 == parts.len();
            if !is_last && len < self.limits.min_part_size {
                return Err(rejected(format!(
                    "part {} is {len} bytes, below the minimum {}",
                    part.part_number, self.limits.min_part_size
                )));
            }
            if len > self.limits.max_part_size {
                return Err(rejected(format!(
                    "part {} is {len} bytes, above the maximum {}",
                    part.part_number, self.limits.max_part_size
                )));
            }
            body.extend_from_slice(data);
            digests.extend_from_slice(&md5::compute(data).0);
        }

        let etag = format!("{}-{}", hex::encode(md5::compute(&digests).0), parts.len());
        let object = StoredObject {
            data: body.freeze(),
            etag: etag.clone(),
            last_modified: SystemTime::now(),
        };
        inner.uploads.remove(upload_id);
        inner
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
        debug!("Completed upload {} with {} parts", upload_id, parts.len());
        Ok(etag)
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        Self::upload(&mut inner, bucket, key, upload_id)?;
        inner.uploads.remove(upload_id);
        Ok(())
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> StoreResult<Vec<MultipartUpload>> {
        let inner = self.inner.lock();
        let mut uploads: Vec<MultipartUpload> = inner
            .uploads
            .iter()
            .filter(|(_, upload)| {
                upload.bucket == bucket && upload.key.starts_with(prefix)
            })
            .map(|(upload_id, upload)| MultipartUpload {
                key: upload.key.clone(),
                upload_id: upload_id.clone(),
            })
            .collect();
        uploads.sort_by(|a, b| (&a.key, &a.upload_id).cmp(&(&b.key, &b.upload_id)));
        Ok(uploads)
    }

    async fn delete_objects(
        &self,
        bucket: &str,
        keys: &[String],
    ) -> StoreResult<Vec<DeleteFailure>> {
        if keys.len() > MAX_DELETE_BATCH {
            return Err(StoreError::Rejected {
                operation: "delete_objects",
                bucket: bucket.to_string(),
                key: String::new(),
                reason: format!("{} keys exceed the batch limit", keys.len()),
            });
        }

        let mut inner = self.inner.lock();
        inner.delete_batches.push(keys.len());
        let Inner {
            buckets, faults, ..
        } = &mut *inner;

        let mut failed = Vec::new();
        for key in keys {
            if faults.undeletable.contains(key) {
                failed.push(DeleteFailure::new(
                    key.clone(),
                    "AccessDenied",
                    "Access Denied",
                ));
            } else if let Some(objects) = buckets.get_mut(bucket) {
                objects.remove(key);
            }
        }
        Ok(failed)
    }
}
