//! Values exchanged with object stores

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Metadata of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Object key
    pub key: String,
    /// Size in bytes
    pub size: u64,
    /// Entity tag as reported by the store
    pub etag: String,
    /// Last modification time, if the store reports one
    pub last_modified: Option<SystemTime>,
}

impl ObjectInfo {
    /// Check if the key denotes a directory placeholder
    pub fn is_directory_marker(&self) -> bool {
        self.key.ends_with('/')
    }

    /// Modification time in seconds since the Unix epoch, 0 when unknown
    pub fn mtime(&self) -> u64 {
        self.last_modified
            .and_then(|time| time.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map_or(0, |elapsed| elapsed.as_secs())
    }
}

/// Bucket and key of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Bucket name
    pub bucket: String,
    /// Object key
    pub key: String,
}

impl ObjectRef {
    /// Create a new reference
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// An in-progress multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartUpload {
    /// Destination key
    pub key: String,
    /// Store-assigned upload id
    pub upload_id: String,
}

/// A finished part, as passed to completion
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompletedPart {
    /// 1-based part number
    pub part_number: u32,
    /// Entity tag returned for the part
    pub etag: String,
}

impl CompletedPart {
    /// Pair a part number with the etag the store returned for it
    pub fn new(part_number: u32, etag: impl Into<String>) -> Self {
        Self {
            part_number,
            etag: etag.into(),
        }
    }
}

/// A key a batch delete could not remove
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFailure {
    /// Key that remains
    pub key: String,
    /// Store error code
    pub code: String,
    /// Store error message
    pub message: String,
}

impl DeleteFailure {
    /// Create a new failure record
    pub fn new(
        key: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}
