//! Archive layout
//!
//! The manifest lists the offset of every member, but it is itself the first
//! member, so those offsets depend on the manifest's own length. The engine
//! resolves this by fixed-point iteration:
//!
//! 1. Serialize the manifest with the entries placed right after offset 0 and
//!    take its span as the first estimate.
//! 2. Place the entries after the estimated span, serialize again and measure.
//! 3. Stop when the measured span equals the estimate, otherwise adopt the
//!    measurement and repeat.
//!
//! Spans are whole blocks and grow only when an offset gains a digit, so the
//! loop settles within a few rounds. It is still bounded; running out of
//! iterations is reported as [`LayoutError::Convergence`].
//!
//! # Archive structure
//!
//! ```text
//! [manifest header][manifest body][manifest pad]
//! [entry 1 header][entry 1 data][pad]
//! ...
//! [entry N header][entry N data][pad]
//! [2 zero blocks]
//! ```

use std::collections::HashSet;

use bytes::{BufMut, Bytes, BytesMut};

use crate::block::{END_OF_ARCHIVE_LEN, align_up, padding};
use crate::entry::{Entry, EntrySource};
use crate::error::{LayoutError, LayoutResult};
use crate::header::{GnuHeaderSynthesizer, HeaderSynthesizer};
use crate::manifest::{Manifest, ManifestOptions, ManifestRecord};
use crate::range::ByteRange;

/// Iteration cap for the manifest fixed point
pub const DEFAULT_MAX_ITERATIONS: usize = 64;

/// Computes member offsets and the manifest for a list of entries
#[derive(Debug, Clone)]
pub struct ArchiveLayoutEngine<H = GnuHeaderSynthesizer> {
    synthesizer: H,
    options: ManifestOptions,
    max_iterations: usize,
}

impl Default for ArchiveLayoutEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveLayoutEngine {
    /// Engine producing GNU tar headers
    pub fn new() -> Self {
        Self::with_synthesizer(GnuHeaderSynthesizer)
    }
}

impl<H: HeaderSynthesizer> ArchiveLayoutEngine<H> {
    /// Engine using a custom header synthesizer
    pub fn with_synthesizer(synthesizer: H) -> Self {
        Self {
            synthesizer,
            options: ManifestOptions::default(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Set how the manifest member is written
    #[must_use]
    pub fn with_options(mut self, options: ManifestOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the iteration cap
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Manifest options in effect
    pub fn options(&self) -> &ManifestOptions {
        &self.options
    }

    /// Lay out `entries` in order behind the manifest
    pub fn layout(&self, entries: &[Entry]) -> LayoutResult<ArchiveLayout> {
        let headers = self.prepare(entries)?;
        let seed = self.serialize(entries, &headers, 0)?.span();
        self.iterate(entries, headers, seed)
    }

    /// Run the fixed point from an arbitrary manifest span estimate
    ///
    /// Seeding with the span of an earlier layout of the same entries must
    /// reproduce that layout in a single round.
    pub fn resolve_from_seed(&self, entries: &[Entry], seed: u64) -> LayoutResult<ArchiveLayout> {
        let headers = self.prepare(entries)?;
        self.iterate(entries, headers, seed)
    }

    fn prepare(&self, entries: &[Entry]) -> LayoutResult<Vec<Vec<u8>>> {
        let mut names = HashSet::with_capacity(entries.len() + 1);
        names.insert(self.options.name.as_str());

        entries
            .iter()
            .map(|entry| {
                if !names.insert(entry.name.as_str()) {
                    return Err(LayoutError::DuplicateName(entry.name.clone()));
                }
                self.synthesizer
                    .synthesize(&entry.name, entry.size, &entry.metadata)
            })
            .collect()
    }

    fn iterate(
        &self,
        entries: &[Entry],
        headers: Vec<Vec<u8>>,
        seed: u64,
    ) -> LayoutResult<ArchiveLayout> {
        let mut estimate = seed;
        for iteration in 1..=self.max_iterations {
            let manifest = self.serialize(entries, &headers, estimate)?;
            let span = manifest.span();
            if span == estimate {
                return Ok(ArchiveLayout::new(manifest, entries, headers, iteration));
            }
            estimate = span;
        }
        Err(LayoutError::Convergence {
            iterations: self.max_iterations,
            estimate,
        })
    }

    fn serialize(
        &self,
        entries: &[Entry],
        headers: &[Vec<u8>],
        estimate: u64,
    ) -> LayoutResult<Manifest> {
        let records = place(entries, headers, align_up(estimate))
            .map(|(entry, offset)| {
                ManifestRecord::new(
                    entry.name.clone(),
                    offset,
                    entry.size,
                    entry.checksum.clone(),
                )
            })
            .collect();
        Manifest::build(records, &self.options, &self.synthesizer)
    }
}

/// Header offsets of `entries` when the first header starts at `start`
fn place<'a>(
    entries: &'a [Entry],
    headers: &'a [Vec<u8>],
    start: u64,
) -> impl Iterator<Item = (&'a Entry, u64)> + 'a {
    let mut cursor = start;
    entries.iter().zip(headers).map(move |(entry, header)| {
        let offset = cursor;
        cursor += header.len() as u64 + entry.size + padding(entry.size);
        (entry, offset)
    })
}

/// An entry at its final position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedEntry {
    /// The member
    pub entry: Entry,
    /// Header sequence written before the data
    pub header: Vec<u8>,
    /// Absolute offset of the first header byte
    pub offset: u64,
}

impl PlacedEntry {
    /// Absolute offset of the first data byte
    pub fn data_offset(&self) -> u64 {
        self.offset + self.header.len() as u64
    }

    /// Zero bytes after the data
    pub fn padding(&self) -> u64 {
        padding(self.entry.size)
    }

    /// Offset just past the data padding
    pub fn end(&self) -> u64 {
        self.data_offset() + self.entry.size + self.padding()
    }
}

/// Piece of the final archive, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSegment {
    /// Bytes held in memory: manifest, headers, padding, inline data
    Inline(Bytes),
    /// Range of a stored object
    Remote {
        /// Source bucket
        bucket: String,
        /// Source key
        key: String,
        /// Bytes to copy from the source
        range: ByteRange,
        /// Object size and checksum observed at layout time
        expected: SourceFingerprint,
    },
}

/// What a source object looked like when the layout was computed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFingerprint {
    /// Object size in bytes
    pub size: u64,
    /// Object checksum
    pub checksum: String,
}

impl ArchiveSegment {
    /// Length in bytes
    pub fn len(&self) -> u64 {
        match self {
            Self::Inline(bytes) => bytes.len() as u64,
            Self::Remote { range, .. } => range.len,
        }
    }

    /// Check if the segment carries no bytes
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a converged layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    manifest: Manifest,
    entries: Vec<PlacedEntry>,
    iterations: usize,
}

impl ArchiveLayout {
    fn new(
        manifest: Manifest,
        entries: &[Entry],
        headers: Vec<Vec<u8>>,
        iterations: usize,
    ) -> Self {
        let entries = entries
            .iter()
            .zip(headers)
            .zip(manifest.records())
            .map(|((entry, header), record)| PlacedEntry {
                entry: entry.clone(),
                header,
                offset: record.offset,
            })
            .collect();
        Self {
            manifest,
            entries,
            iterations,
        }
    }

    /// The manifest member
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Manifest records, one per entry
    pub fn records(&self) -> &[ManifestRecord] {
        self.manifest.records()
    }

    /// Entries in archive order
    pub fn entries(&self) -> &[PlacedEntry] {
        &self.entries
    }

    /// Rounds the fixed point needed
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Bytes taken by the manifest member
    pub fn manifest_span(&self) -> u64 {
        self.manifest.span()
    }

    /// Offset just past the last entry's padding
    pub fn data_end(&self) -> u64 {
        self.entries
            .last()
            .map_or_else(|| self.manifest_span(), PlacedEntry::end)
    }

    /// Length of the whole archive, end-of-archive marker included
    pub fn total_len(&self) -> u64 {
        self.data_end() + END_OF_ARCHIVE_LEN
    }

    /// Archive content as a sequence of inline and remote segments
    ///
    /// Adjacent in-memory bytes are merged, so every remote segment is
    /// surrounded by inline ones. Empty stored objects contribute only their
    /// header.
    pub fn segments(&self) -> Vec<ArchiveSegment> {
        let mut segments = Vec::with_capacity(self.entries.len() * 2 + 1);
        let mut pending = BytesMut::from(self.manifest.to_bytes().as_ref());

        for placed in &self.entries {
            pending.put_slice(&placed.header);
            match &placed.entry.source {
                EntrySource::Inline(data) => pending.put_slice(data),
                EntrySource::Object { bucket, key } if placed.entry.size > 0 => {
                    segments.push(ArchiveSegment::Inline(pending.split().freeze()));
                    segments.push(ArchiveSegment::Remote {
                        bucket: bucket.clone(),
                        key: key.clone(),
                        range: ByteRange::whole(placed.entry.size),
                        expected: SourceFingerprint {
                            size: placed.entry.size,
                            checksum: placed.entry.checksum.clone(),
                        },
                    });
                }
                EntrySource::Object { .. } => {}
            }
            pending.put_bytes(0, placed.padding() as usize);
        }

        pending.put_bytes(0, END_OF_ARCHIVE_LEN as usize);
        segments.push(ArchiveSegment::Inline(pending.freeze()));
        segments
    }
}
