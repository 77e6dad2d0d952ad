//! Manifest entry
//!
//! The manifest is the first member of every archive. Its body lists each
//! following member as a CSV record `name,offset,size,etag`, where `offset` is
//! the absolute position of the member's first header byte:
//!
//! ```text
//! [manifest header][body][pad: 1..=512 zero bytes][entry 1 header]...
//! ```
//!
//! The pad always ends the manifest on a block boundary and is never empty:
//! a body that is already aligned is followed by one full zero block.

mod reader;
mod record;
mod source;
mod writer;

pub use reader::{ManifestReader, parse};
pub use record::ManifestRecord;
pub use source::{SOURCE_HEADER_ROW, SourceRecord, parse_source_list};
pub use writer::{HEADER_ROW, ManifestWriter, encode, format_record};

use bytes::{BufMut, Bytes, BytesMut};

use crate::block::manifest_padding;
use crate::error::LayoutResult;
use crate::header::{HeaderMetadata, HeaderSynthesizer};

/// Reserved member name of the manifest
pub const MANIFEST_NAME: &str = "manifest.csv";

/// Permission bits of the manifest member
pub const MANIFEST_MODE: u32 = 0o600;

/// How the manifest member is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestOptions {
    /// Emit the `name,offset,size,etag` row before the records
    pub include_header_row: bool,
    /// Member name
    pub name: String,
    /// Header fields of the manifest member
    pub metadata: HeaderMetadata,
}

impl Default for ManifestOptions {
    fn default() -> Self {
        Self {
            include_header_row: false,
            name: MANIFEST_NAME.to_string(),
            metadata: HeaderMetadata::default().with_mode(MANIFEST_MODE),
        }
    }
}

impl ManifestOptions {
    /// Options with the column header row enabled or disabled
    #[must_use]
    pub fn with_header_row(mut self, include: bool) -> Self {
        self.include_header_row = include;
        self
    }

    /// Options with the given manifest modification time
    #[must_use]
    pub fn with_mtime(mut self, mtime: u64) -> Self {
        self.metadata.mtime = mtime;
        self
    }
}

/// Serialized manifest member: header, body and trailing pad
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    name: String,
    records: Vec<ManifestRecord>,
    header: Vec<u8>,
    body: Vec<u8>,
}

/// Describes the stored manifest in the destination bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestObject {
    /// Destination bucket
    pub bucket: String,
    /// Member name
    pub name: String,
    /// Body length in bytes
    pub size: u64,
    /// Hex MD5 of the body
    pub checksum: String,
}

impl Manifest {
    /// Encode `records` and wrap them in a header
    pub fn build<H: HeaderSynthesizer + ?Sized>(
        records: Vec<ManifestRecord>,
        options: &ManifestOptions,
        synthesizer: &H,
    ) -> LayoutResult<Self> {
        let body = encode(&records, options.include_header_row);
        let header = synthesizer.synthesize(&options.name, body.len() as u64, &options.metadata)?;
        Ok(Self {
            name: options.name.clone(),
            records,
            header,
            body,
        })
    }

    /// Member name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records in archive order
    pub fn records(&self) -> &[ManifestRecord] {
        &self.records
    }

    /// Header sequence of the manifest member
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// CSV body
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Zero bytes following the body
    pub fn padding_len(&self) -> u64 {
        manifest_padding(self.body.len() as u64)
    }

    /// Bytes the manifest occupies at the start of the archive
    pub fn span(&self) -> u64 {
        self.header.len() as u64 + self.body.len() as u64 + self.padding_len()
    }

    /// Hex MD5 of the body
    pub fn checksum(&self) -> String {
        hex::encode(md5::compute(&self.body).0)
    }

    /// The complete member as one buffer: header, body and pad
    pub fn to_bytes(&self) -> Bytes {
        let span = self.span() as usize;
        let mut out = BytesMut::with_capacity(span);
        out.put_slice(&self.header);
        out.put_slice(&self.body);
        out.resize(span, 0);
        out.freeze()
    }

    /// Metadata for the manifest as stored in `bucket`
    pub fn describe(&self, bucket: impl Into<String>) -> ManifestObject {
        ManifestObject {
            bucket: bucket.into(),
            name: self.name.clone(),
            size: self.body.len() as u64,
            checksum: self.checksum(),
        }
    }
}
