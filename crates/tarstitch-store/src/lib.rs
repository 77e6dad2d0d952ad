//! Object store access and multipart assembly for stitched tar archives
//!
#![allow(clippy::uninlined_format_args)] // Backwards compatibility
#![allow(clippy::return_self_not_must_use)] // Builder patterns
#![allow(clippy::missing_panics_doc)]
//! This crate takes an [`ArchiveLayout`](tarstitch_formats::ArchiveLayout)
//! and writes it into an object store as one multipart upload, copying
//! large member data server-side:
//!
//! - [`ObjectStore`]: the store operations the builder relies on, with an
//!   in-memory ([`MemoryStore`]) and a directory-backed ([`FsStore`])
//!   implementation
//! - [`PartPlanner`]: packs the archive into parts within the store's limits
//! - [`ArchiveAssembler`]: writes the parts with a bounded worker pool,
//!   checking sources for drift and aborting the upload on failure
//! - [`create_archive`]: list, lay out, assemble and optionally delete the
//!   sources in one call
//! - Helpers for batched deletion and for sweeping abandoned uploads
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tarstitch_store::{
//!     ArchiveRequest, AssemblyConfig, MemoryStore, ObjectRef, create_archive,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> tarstitch_store::StoreResult<()> {
//! let store = Arc::new(MemoryStore::new());
//! store.insert("logs", "2024/app.log", &b"hello"[..]);
//!
//! let request = ArchiveRequest::new(
//!     ObjectRef::new("logs", "2024/"),
//!     ObjectRef::new("archives", "2024.tar"),
//! );
//! let report = create_archive(
//!     store,
//!     &AssemblyConfig::default(),
//!     &request,
//!     &CancellationToken::new(),
//! )
//! .await?;
//! println!("wrote {} bytes", report.archive.size);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod assemble;
pub mod config;
pub mod delete;
pub mod error;
pub mod fs;
pub mod listing;
pub mod memory;
pub mod pipeline;
pub mod plan;
pub mod retry;
pub mod sweep;
pub mod token;
pub mod traits;
pub mod types;

pub use assemble::{ArchiveAssembler, AssembledArchive};
pub use config::{AssemblyConfig, DriftCheck, MAX_THREADS, parse_split_strategy};
pub use delete::{delete_entries, delete_keys};
pub use error::{StoreError, StoreResult};
pub use fs::FsStore;
pub use listing::{
    entries_from_listing, entries_from_manifest, list_entries, load_source_manifest,
    manifest_entries, parse_store_url,
};
pub use memory::MemoryStore;
pub use pipeline::{ArchiveReport, ArchiveRequest, SourceSet, create_archive};
pub use plan::{AssemblyPlan, PartPiece, PartPlanner, PartSource, PlannedPart};
pub use retry::RetryPolicy;
pub use sweep::abort_all_uploads;
pub use token::random_hex;
pub use traits::{MAX_DELETE_BATCH, ObjectStore};
pub use types::{CompletedPart, DeleteFailure, MultipartUpload, ObjectInfo, ObjectRef};
