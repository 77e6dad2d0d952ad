//! Layout engine for tar archives stitched together inside an object store
//!
#![allow(clippy::cast_lossless)] // Sometimes clearer than From
#![allow(clippy::uninlined_format_args)] // Backwards compatibility
#![allow(clippy::return_self_not_must_use)] // Builder patterns
#![allow(clippy::redundant_closure_for_method_calls)] // Iterator chains
//! This crate computes everything needed to build a tar archive out of
//! objects that already live in a store, without touching their bytes:
//!
//! - **Block arithmetic**: padding to the 512-byte tar block boundary
//! - **Headers**: GNU tar header sequences for each member
//! - **Manifest**: a CSV first member listing the offset of every other member
//! - **Layout**: the fixed point that sizes the manifest, which must know its
//!   own length before it can record any offset
//! - **Part sizing**: part counts that respect multipart upload limits
//!
//! Nothing in this crate performs I/O. The result of a layout is a list of
//! [`ArchiveSegment`]s, in-memory bytes interleaved with ranges of stored
//! objects, which an assembler turns into a multipart upload.
//!
//! # Example
//!
//! ```
//! use tarstitch_formats::{ArchiveLayoutEngine, Entry};
//!
//! let entries = vec![
//!     Entry::from_object("logs", "2024/app.log", 100, "etag-a", 1),
//!     Entry::from_object("logs", "2024/empty.log", 0, "etag-b", 2),
//! ];
//! let layout = ArchiveLayoutEngine::new().layout(&entries)?;
//! assert_eq!(layout.records()[0].offset, layout.manifest_span());
//! # Ok::<(), tarstitch_formats::LayoutError>(())
//! ```

#![warn(missing_docs)]

pub mod block;
pub mod entry;
pub mod error;
pub mod header;
pub mod layout;
pub mod manifest;
pub mod parts;
pub mod range;

pub use block::{BLOCK_SIZE, END_OF_ARCHIVE_LEN, align_up, manifest_padding, padding};
pub use entry::{Entry, EntrySource};
pub use error::{LayoutError, LayoutResult};
pub use header::{GnuHeaderSynthesizer, HeaderMetadata, HeaderSynthesizer};
pub use layout::{
    ArchiveLayout, ArchiveLayoutEngine, ArchiveSegment, DEFAULT_MAX_ITERATIONS, PlacedEntry,
    SourceFingerprint,
};
pub use manifest::{
    MANIFEST_NAME, Manifest, ManifestObject, ManifestOptions, ManifestReader, ManifestRecord,
    SourceRecord, parse_source_list,
};
pub use parts::{
    MAX_PART_COUNT, MAX_PART_SIZE, MIN_PART_SIZE, PartLimits, PartRange, SplitStrategy,
};
pub use range::{ByteRange, split_range};
