//! Directory-backed object store
//!
//! Each bucket is a sub-directory of the root and each key a relative path
//! inside it. Multipart uploads are staged outside every bucket:
//!
//! ```text
//! <root>/<bucket>/<key>
//! <root>/.multipart/<upload id>/upload.json
//! <root>/.multipart/<upload id>/part-00001
//! <root>/.multipart/<upload id>/part-00001.etag
//! ```
//!
//! Etags are weak: derived from size and modification time rather than
//! content, which is enough to notice a rewritten source.

use std::io::{self, ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};
use walkdir::WalkDir;

use tarstitch_formats::ByteRange;

use crate::error::{StoreError, StoreResult};
use crate::token::random_hex;
use crate::traits::{MAX_DELETE_BATCH, ObjectStore};
use crate::types::{CompletedPart, DeleteFailure, MultipartUpload, ObjectInfo, ObjectRef};

/// Directory under the root holding multipart staging areas
pub const STAGING_DIR: &str = ".multipart";

const UPLOAD_META: &str = "upload.json";
const COPY_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct UploadMeta {
    bucket: String,
    key: String,
}

/// Object store rooted at a local directory
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Store rooted at `root`; directories are created on first write
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, operation: &'static str, bucket: &str) -> StoreResult<PathBuf> {
        if bucket.is_empty()
            || bucket.starts_with('.')
            || bucket.contains(['/', '\\', '\0'])
        {
            return Err(StoreError::Rejected {
                operation,
                bucket: bucket.to_string(),
                key: String::new(),
                reason: "invalid bucket name".to_string(),
            });
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(
        &self,
        operation: &'static str,
        bucket: &str,
        key: &str,
    ) -> StoreResult<PathBuf> {
        let valid = !key.is_empty() && !key.contains('\0') && key.split('/').all(valid_component);
        if !valid {
            return Err(StoreError::Rejected {
                operation,
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: "key cannot be mapped to a file path".to_string(),
            });
        }
        Ok(self.bucket_path(operation, bucket)?.join(key))
    }

    fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    fn upload_dir(&self, bucket: &str, key: &str, upload_id: &str) -> StoreResult<PathBuf> {
        if upload_id.is_empty() || !upload_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(no_such_upload(bucket, key, upload_id));
        }
        Ok(self.staging_root().join(upload_id))
    }

    /// Staging directory of an upload that belongs to `bucket`/`key`
    async fn open_upload(&self, bucket: &str, key: &str, upload_id: &str) -> StoreResult<PathBuf> {
        let dir = self.upload_dir(bucket, key, upload_id)?;
        let raw = match fs::read(dir.join(UPLOAD_META)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(no_such_upload(bucket, key, upload_id));
            }
            Err(e) => return Err(io_error("read_upload", bucket, key, e)),
        };
        let meta: UploadMeta = serde_json::from_slice(&raw)?;
        if meta.bucket != bucket || meta.key != key {
            return Err(no_such_upload(bucket, key, upload_id));
        }
        Ok(dir)
    }

    async fn write_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: PartData<'_>,
    ) -> StoreResult<String> {
        if part_number == 0 {
            return Err(StoreError::Rejected {
                operation: "upload_part",
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: "part numbers start at 1".to_string(),
            });
        }
        let dir = self.open_upload(bucket, key, upload_id).await?;
        let part_path = dir.join(part_file_name(part_number));

        let etag = match data {
            PartData::Bytes(bytes) => {
                fs::write(&part_path, bytes)
                    .await
                    .map_err(|e| io_error("upload_part", bucket, key, e))?;
                hex::encode(md5::compute(bytes).0)
            }
            PartData::Copy(path, source, range) => {
                let (bucket, key) = (&source.bucket, &source.key);
                copy_range(path, range, &part_path)
                    .await
                    .map_err(|e| io_error("upload_part_copy", bucket, key, e))?
            }
        };

        fs::write(etag_path(&part_path), &etag)
            .await
            .map_err(|e| io_error("upload_part", bucket, key, e))?;
        Ok(etag)
    }

    /// Move a staged file into place, creating parent directories
    async fn replace_file(&self, staged: &Path, target: &Path) -> io::Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(staged, target).await
    }

    async fn prune_empty_dirs(&self, bucket_dir: &Path, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == bucket_dir || !dir.starts_with(bucket_dir) {
                break;
            }
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

enum PartData<'a> {
    Bytes(&'a [u8]),
    Copy(&'a Path, &'a ObjectRef, ByteRange),
}

fn valid_component(component: &str) -> bool {
    !component.is_empty() && component != "." && component != ".."
}

fn part_file_name(part_number: u32) -> String {
    format!("part-{part_number:05}")
}

fn etag_path(part_path: &Path) -> PathBuf {
    part_path.with_extension("etag")
}

fn no_such_upload(bucket: &str, key: &str, upload_id: &str) -> StoreError {
    StoreError::NoSuchUpload {
        bucket: bucket.to_string(),
        key: key.to_string(),
        upload_id: upload_id.to_string(),
    }
}

fn io_error(operation: &'static str, bucket: &str, key: &str, error: io::Error) -> StoreError {
    match error.kind() {
        ErrorKind::NotFound => StoreError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            StoreError::transient(operation, bucket, key, error.to_string())
        }
        _ => StoreError::permanent(operation, bucket, key, error.to_string()),
    }
}

fn weak_etag(len: u64, modified: Option<SystemTime>) -> String {
    let nanos = modified
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |elapsed| elapsed.as_nanos());
    format!("W/{len:x}-{nanos:x}")
}

fn info_from_metadata(key: String, metadata: &std::fs::Metadata) -> ObjectInfo {
    let modified = metadata.modified().ok();
    ObjectInfo {
        key,
        size: metadata.len(),
        etag: weak_etag(metadata.len(), modified),
        last_modified: modified,
    }
}

/// Copy `range` of `source` into `target`
///
/// The returned etag is an opaque token; only completion compares it.
async fn copy_range(source: &Path, range: ByteRange, target: &Path) -> io::Result<String> {
    let mut input = fs::File::open(source).await?;
    let size = input.metadata().await?.len();
    if range.end() > size {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("range {range} runs past the end of a {size} byte object"),
        ));
    }
    input.seek(SeekFrom::Start(range.start)).await?;

    let mut output = fs::File::create(target).await?;
    let mut remaining = range.len;
    let mut buffer = vec![0u8; COPY_CHUNK];
    while remaining > 0 {
        let want = remaining.min(COPY_CHUNK as u64) as usize;
        let read = input.read(&mut buffer[..want]).await?;
        if read == 0 {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "source truncated during copy",
            ));
        }
        output.write_all(&buffer[..read]).await?;
        remaining -= read as u64;
    }
    output.flush().await?;
    Ok(random_hex(16))
}

/// Walk a bucket directory; empty sub-directories are reported as `dir/` keys
fn walk_bucket(bucket_dir: &Path, prefix: &str) -> io::Result<Vec<ObjectInfo>> {
    let mut objects = Vec::new();
    for entry in WalkDir::new(bucket_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let Ok(relative) = entry.path().strip_prefix(bucket_dir) else {
            continue;
        };
        let mut key = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let metadata = entry.metadata().map_err(io::Error::other)?;
        if metadata.is_dir() {
            let is_empty = std::fs::read_dir(entry.path())?.next().is_none();
            if !is_empty {
                continue;
            }
            key.push('/');
        }
        if key.starts_with(prefix) {
            let mut info = info_from_metadata(key, &metadata);
            if metadata.is_dir() {
                info.size = 0;
            }
            objects.push(info);
        }
    }
    objects.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(objects)
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<ObjectInfo>> {
        let bucket_dir = self.bucket_path("list_objects", bucket)?;
        if !fs::try_exists(&bucket_dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let prefix_owned = prefix.to_string();
        tokio::task::spawn_blocking(move || walk_bucket(&bucket_dir, &prefix_owned))
            .await
            .map_err(|e| StoreError::Worker(e.to_string()))?
            .map_err(|e| io_error("list_objects", bucket, prefix, e))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<ObjectInfo> {
        let path = self.object_path("head_object", bucket, key)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| io_error("head_object", bucket, key, e))?;
        if !metadata.is_file() {
            return Err(StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(info_from_metadata(key.to_string(), &metadata))
    }

    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        range: ByteRange,
    ) -> StoreResult<Bytes> {
        let path = self.object_path("get_object_range", bucket, key)?;
        let read = async {
            let mut file = fs::File::open(&path).await?;
            let size = file.metadata().await?.len();
            if range.start > size || (range.start == size && !range.is_empty()) {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("range {range} not satisfiable for {size} bytes"),
                ));
            }
            let len = range.len.min(size - range.start);
            file.seek(SeekFrom::Start(range.start)).await?;
            let mut data = Vec::with_capacity(len as usize);
            file.take(len).read_to_end(&mut data).await?;
            Ok::<_, io::Error>(Bytes::from(data))
        };
        read.await
            .map_err(|e| io_error("get_object_range", bucket, key, e))
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> StoreResult<String> {
        let target = self.object_path("put_object", bucket, key)?;
        let staging = self.staging_root();
        let staged = staging.join(format!("put-{}", random_hex(8)));

        let write = async {
            fs::create_dir_all(&staging).await?;
            fs::write(&staged, &data).await?;
            self.replace_file(&staged, &target).await?;
            fs::metadata(&target).await
        };
        let metadata = write
            .await
            .map_err(|e| io_error("put_object", bucket, key, e))?;
        Ok(info_from_metadata(key.to_string(), &metadata).etag)
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> StoreResult<String> {
        self.object_path("create_multipart_upload", bucket, key)?;
        let upload_id = random_hex(16);
        let dir = self.upload_dir(bucket, key, &upload_id)?;
        let meta = serde_json::to_vec(&UploadMeta {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;

        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create_multipart_upload", bucket, key, e))?;
        fs::write(dir.join(UPLOAD_META), meta)
            .await
            .map_err(|e| io_error("create_multipart_upload", bucket, key, e))?;
        debug!("Staging upload {} in {}", upload_id, dir.display());
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
        self.write_part(bucket, key, upload_id, part_number, PartData::Bytes(&data))
            .await
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
        let path = self.object_path("upload_part_copy", &source.bucket, &source.key)?;
        self.write_part(
            bucket,
            key,
            upload_id,
            part_number,
            PartData::Copy(&path, source, range),
        )
        .await
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<String> {
        let target = self.object_path("complete_multipart_upload", bucket, key)?;
        let dir = self.open_upload(bucket, key, upload_id).await?;
        let rejected = |reason: String| StoreError::Rejected {
            operation: "complete_multipart_upload",
            bucket: bucket.to_string(),
            key: key.to_string(),
            reason,
        };

        if parts.is_empty() {
            return Err(rejected("no parts given".to_string()));
        }
        if !parts.is_sorted_by(|a, b| a.part_number < b.part_number) {
            return Err(rejected("parts are not in ascending order".to_string()));
        }
        for part in parts {
            let part_path = dir.join(part_file_name(part.part_number));
            match fs::read_to_string(etag_path(&part_path)).await {
                Ok(etag) if etag == part.etag => {}
                Ok(_) => {
                    return Err(rejected(format!(
                        "etag mismatch for part {}",
                        part.part_number
                    )));
                }
                Err(_) => {
                    return Err(rejected(format!(
                        "part {} was never uploaded",
                        part.part_number
                    )));
                }
            }
        }

        let assembled = dir.join("assembled");
        let concatenate = async {
            let mut output = fs::File::create(&assembled).await?;
            for part in parts {
                let mut input = fs::File::open(dir.join(part_file_name(part.part_number))).await?;
                tokio::io::copy(&mut input, &mut output).await?;
            }
            output.flush().await?;
            drop(output);
            self.replace_file(&assembled, &target).await?;
            fs::metadata(&target).await
        };
        let metadata = concatenate
            .await
            .map_err(|e| io_error("complete_multipart_upload", bucket, key, e))?;

        if let Err(e) = fs::remove_dir_all(&dir).await {
            warn!("Failed to remove staging directory {}: {e}", dir.display());
        }
        debug!("Completed upload {} with {} parts", upload_id, parts.len());
        Ok(info_from_metadata(key.to_string(), &metadata).etag)
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StoreResult<()> {
        let dir = self.open_upload(bucket, key, upload_id).await?;
        fs::remove_dir_all(&dir)
            .await
            .map_err(|e| io_error("abort_multipart_upload", bucket, key, e))
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> StoreResult<Vec<MultipartUpload>> {
        self.bucket_path("list_multipart_uploads", bucket)?;
        let mut entries = match fs::read_dir(self.staging_root()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("list_multipart_uploads", bucket, prefix, e)),
        };

        let mut uploads = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list_multipart_uploads", bucket, prefix, e))?
        {
            let Ok(raw) = fs::read(entry.path().join(UPLOAD_META)).await else {
                continue;
            };
            let Ok(meta) = serde_json::from_slice::<UploadMeta>(&raw) else {
                let path = entry.path();
                warn!("Ignoring unreadable upload metadata in {}", path.display());
                continue;
            };
            if meta.bucket == bucket && meta.key.starts_with(prefix) {
                uploads.push(MultipartUpload {
                    key: meta.key,
                    upload_id: entry.file_name().to_string_lossy().into_owned(),
                });
            }
        }
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
        let bucket_dir = self.bucket_path("delete_objects", bucket)?;

        let mut failed = Vec::new();
        for key in keys {
            let path = match self.object_path("delete_objects", bucket, key) {
                Ok(path) => path,
                Err(e) => {
                    failed.push(DeleteFailure::new(key.clone(), "InvalidKey", e.to_string()));
                    continue;
                }
            };
            match fs::remove_file(&path).await {
                Ok(()) => self.prune_empty_dirs(&bucket_dir, &path).await,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => failed.push(DeleteFailure::new(
                    key.clone(),
                    format!("{:?}", e.kind()),
                    e.to_string(),
                )),
            }
        }
        Ok(failed)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_put_get_list() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(dir.path());
        store
            .put_object("b", "logs/a.txt", Bytes::from_static(b"alpha"))
            .await
            .expect("put");
        store
            .put_object("b", "logs/nested/b.txt", Bytes::from_static(b"beta"))
            .await
            .expect("put");
        std::fs::create_dir_all(dir.path().join("b/logs/empty")).expect("mkdir");

        let listed = store.list_objects("b", "logs/").await.expect("list");
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["logs/a.txt", "logs/empty/", "logs/nested/b.txt"]);

        let bytes = store
            .get_object_range("b", "logs/a.txt", ByteRange::new(1, 10))
            .await
            .expect("range");
        assert_eq!(&bytes[..], b"lpha");

        let head = store.head_object("b", "logs/a.txt").await.expect("head");
        assert_eq!(head.size, 5);
        assert_eq!(head.etag, listed[0].etag);
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(dir.path());
        assert!(store.put_object("b", "../x", Bytes::new()).await.is_err());
        let reserved = store.put_object(".multipart", "x", Bytes::new()).await;
        assert!(reserved.is_err());
        assert!(store.head_object("b", "a//b").await.is_err());
    }

    #[tokio::test]
    async fn test_multipart_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(dir.path());
        store
            .put_object("src", "obj", Bytes::from_static(b"0123456789"))
            .await
            .expect("put");

        let id = store
            .create_multipart_upload("dst", "out.tar")
            .await
            .expect("create");
        let pending = store.list_multipart_uploads("dst", "").await.expect("list");
        assert_eq!(pending.len(), 1);
        let e1 = store
            .upload_part("dst", "out.tar", &id, 1, Bytes::from_static(b"head:"))
            .await
            .expect("part");
        let e2 = store
            .upload_part_copy(
                &ObjectRef::new("src", "obj"),
                ByteRange::new(3, 4),
                "dst",
                "out.tar",
                &id,
                2,
            )
            .await
            .expect("copy");
        store
            .complete_multipart_upload(
                "dst",
                "out.tar",
                &id,
                &[CompletedPart::new(1, e1), CompletedPart::new(2, e2)],
            )
            .await
            .expect("complete");

        let content = std::fs::read(dir.path().join("dst/out.tar")).expect("read");
        assert_eq!(content, b"head:3456");
        let pending = store.list_multipart_uploads("dst", "").await.expect("list");
        assert!(pending.is_empty());
        let aborted = store.abort_multipart_upload("dst", "out.tar", &id).await;
        assert!(aborted.is_err());
    }

    #[tokio::test]
    async fn test_delete_prunes_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsStore::new(dir.path());
        store
            .put_object("b", "x/y/z.bin", Bytes::from_static(b"z"))
            .await
            .expect("put");
        let failed = store
            .delete_objects("b", &["x/y/z.bin".to_string(), "never".to_string()])
            .await
            .expect("delete");
        assert!(failed.is_empty());
        assert!(store.list_objects("b", "").await.expect("list").is_empty());
        assert!(dir.path().join("b").exists());
    }
}
