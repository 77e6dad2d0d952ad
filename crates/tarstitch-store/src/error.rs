//! Error types for store access and archive assembly

use thiserror::Error;

use tarstitch_formats::LayoutError;

use crate::types::DeleteFailure;

/// Store operation result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by stores, helpers and the assembler
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist
    #[error("Object not found: {bucket}/{key}")]
    NotFound {
        /// Bucket searched
        bucket: String,
        /// Missing key
        key: String,
    },

    /// Multipart upload id is unknown or already finished
    #[error("No such multipart upload {upload_id} for {bucket}/{key}")]
    NoSuchUpload {
        /// Destination bucket
        bucket: String,
        /// Destination key
        key: String,
        /// Upload id that was not found
        upload_id: String,
    },

    /// Store call failed
    #[error("{operation} failed for {bucket}/{key}: {message}")]
    Backend {
        /// Store operation name
        operation: &'static str,
        /// Bucket involved
        bucket: String,
        /// Key involved, empty for bucket-level calls
        key: String,
        /// Backend error description
        message: String,
        /// Whether repeating the call may succeed
        transient: bool,
    },

    /// Request rejected by the store, e.g. a part below the minimum size
    #[error("{operation} rejected for {bucket}/{key}: {reason}")]
    Rejected {
        /// Store operation name
        operation: &'static str,
        /// Bucket involved
        bucket: String,
        /// Key involved
        key: String,
        /// Why the store refused the request
        reason: String,
    },

    /// A delete batch reported per-key failures
    #[error("Batch delete failed for {} keys in {bucket} (first: {})", .failed.len(), first_key(.failed))]
    PartialBatchDelete {
        /// Bucket being cleaned
        bucket: String,
        /// Keys the store could not delete
        failed: Vec<DeleteFailure>,
    },

    /// A source object changed between layout and assembly
    #[error("Source {bucket}/{key} changed since layout: expected {expected_size} bytes ({expected_checksum}), found {actual_size} bytes ({actual_checksum})")]
    Drift {
        /// Source bucket
        bucket: String,
        /// Source key
        key: String,
        /// Size recorded at layout time
        expected_size: u64,
        /// Size observed now
        actual_size: u64,
        /// Checksum recorded at layout time
        expected_checksum: String,
        /// Checksum observed now
        actual_checksum: String,
    },

    /// Aborting an in-progress upload failed
    #[error("Failed to abort upload {upload_id} for {bucket}/{key}: {source}")]
    AbortFailed {
        /// Bucket of the upload
        bucket: String,
        /// Destination key of the upload
        key: String,
        /// Upload that could not be aborted
        upload_id: String,
        /// Underlying store error
        source: Box<StoreError>,
    },

    /// Acknowledged parts do not match the planned parts
    #[error("Upload {upload_id} is missing parts {missing:?}")]
    MissingParts {
        /// Upload being completed
        upload_id: String,
        /// Part numbers never acknowledged
        missing: Vec<u32>,
    },

    /// A part was acknowledged twice
    #[error("Upload {upload_id} acknowledged part {part_number} twice")]
    DuplicatePart {
        /// Upload being completed
        upload_id: String,
        /// Repeated part number
        part_number: u32,
    },

    /// A part number outside the plan was acknowledged
    #[error("Upload {upload_id} acknowledged unplanned part {part_number}")]
    UnexpectedPart {
        /// Upload being completed
        upload_id: String,
        /// Part number that was never planned
        part_number: u32,
    },

    /// Work stopped by the caller's cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The source set named nothing to archive
    #[error("No objects found in {source_set}")]
    EmptySource {
        /// Prefix or source list that was read
        source_set: String,
    },

    /// Layout or part sizing failed
    #[error("Layout error: {0}")]
    Layout(#[from] LayoutError),

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata encoding failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Worker task panicked or was aborted
    #[error("Worker task failed: {0}")]
    Worker(String),
}

fn first_key(failed: &[DeleteFailure]) -> &str {
    failed.first().map_or("-", |failure| failure.key.as_str())
}

impl StoreError {
    /// Backend failure worth retrying
    pub fn transient(
        operation: &'static str,
        bucket: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Backend {
            operation,
            bucket: bucket.into(),
            key: key.into(),
            message: message.into(),
            transient: true,
        }
    }

    /// Backend failure that repeating will not fix
    pub fn permanent(
        operation: &'static str,
        bucket: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Backend {
            operation,
            bucket: bucket.into(),
            key: key.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// Check if error is retryable
    pub fn should_retry(&self) -> bool {
        match self {
            Self::Backend { transient, .. } => *transient,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Check if error was raised before any store call
    pub fn is_configuration_error(&self) -> bool {
        match self {
            Self::InvalidConfig(_) => true,
            Self::Layout(e) => e.is_configuration_error(),
            _ => false,
        }
    }

    /// Check if error reports a source that changed after layout
    pub fn is_drift(&self) -> bool {
        matches!(self, Self::Drift { .. })
    }

    /// Check if error is a missing object
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
