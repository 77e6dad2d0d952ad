//! Tar header synthesis
//!
//! Headers are produced up front for every entry; their length never depends
//! on where the entry lands in the archive, only on its name.
//!
//! # Format
//!
//! Headers are GNU tar. Names up to 100 bytes fit in the ustar name field and
//! yield exactly one 512-byte block. Longer names are preceded by a GNU
//! `././@LongLink` entry carrying the full name, so the header sequence is
//! three or more blocks:
//!
//! ```text
//! [LongLink header][name + NUL, padded][entry header (truncated name)]
//! ```

use tar::{EntryType, Header};

use crate::block::{BLOCK_SIZE, padding};
use crate::error::{LayoutError, LayoutResult};

/// Length of the ustar name field
const NAME_FIELD_LEN: usize = 100;

/// Name GNU tar uses for long-name extension entries
const LONG_LINK_NAME: &[u8] = b"././@LongLink";

/// Per-entry header fields besides name and size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderMetadata {
    /// Permission bits
    pub mode: u32,
    /// Modification time, seconds since the Unix epoch
    pub mtime: u64,
    /// Owner user id
    pub uid: u64,
    /// Owner group id
    pub gid: u64,
}

impl Default for HeaderMetadata {
    fn default() -> Self {
        Self {
            mode: 0o644,
            mtime: 0,
            uid: 0,
            gid: 0,
        }
    }
}

impl HeaderMetadata {
    /// Metadata with the given modification time
    #[must_use]
    pub fn with_mtime(mut self, mtime: u64) -> Self {
        self.mtime = mtime;
        self
    }

    /// Metadata with the given permission bits
    #[must_use]
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }
}

/// Produces the header bytes that precede an entry's data
pub trait HeaderSynthesizer {
    /// Build the header sequence for an entry
    ///
    /// The returned buffer is a non-empty multiple of 512 bytes.
    fn synthesize(&self, name: &str, size: u64, metadata: &HeaderMetadata)
    -> LayoutResult<Vec<u8>>;
}

/// GNU tar header encoder backed by the `tar` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct GnuHeaderSynthesizer;

impl GnuHeaderSynthesizer {
    /// Create a new synthesizer
    pub const fn new() -> Self {
        Self
    }

    fn regular_header(name: &[u8], size: u64, metadata: &HeaderMetadata) -> Header {
        let mut header = Header::new_gnu();
        let field = &mut header.as_old_mut().name;
        let len = name.len().min(NAME_FIELD_LEN);
        field[..len].copy_from_slice(&name[..len]);

        header.set_mode(metadata.mode);
        header.set_uid(metadata.uid);
        header.set_gid(metadata.gid);
        header.set_mtime(metadata.mtime);
        header.set_size(size);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        header
    }

    fn long_name_header(name_len: usize) -> Header {
        let mut header = Header::new_gnu();
        let name = &mut header.as_old_mut().name;
        name[..LONG_LINK_NAME.len()].copy_from_slice(LONG_LINK_NAME);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        // Stored name carries a trailing NUL
        header.set_size(name_len as u64 + 1);
        header.set_entry_type(EntryType::GNULongName);
        header.set_cksum();
        header
    }
}

impl HeaderSynthesizer for GnuHeaderSynthesizer {
    fn synthesize(
        &self,
        name: &str,
        size: u64,
        metadata: &HeaderMetadata,
    ) -> LayoutResult<Vec<u8>> {
        validate_name(name)?;
        let bytes = name.as_bytes();

        if bytes.len() <= NAME_FIELD_LEN {
            let header = Self::regular_header(bytes, size, metadata);
            return Ok(header.as_bytes().to_vec());
        }

        let stored_len = bytes.len() as u64 + 1;
        let data_len = stored_len + padding(stored_len);
        let total = 2 * BLOCK_SIZE + data_len;

        let mut out = Vec::with_capacity(total as usize);
        out.extend_from_slice(Self::long_name_header(bytes.len()).as_bytes());
        out.extend_from_slice(bytes);
        out.resize((BLOCK_SIZE + data_len) as usize, 0);
        out.extend_from_slice(Self::regular_header(bytes, size, metadata).as_bytes());
        Ok(out)
    }
}

/// Reject names a tar reader could not reproduce
pub fn validate_name(name: &str) -> LayoutResult<()> {
    if name.is_empty() {
        return Err(LayoutError::InvalidName {
            name: name.to_string(),
            reason: "name is empty".to_string(),
        });
    }
    if name.as_bytes().contains(&0) {
        return Err(LayoutError::InvalidName {
            name: name.to_string(),
            reason: "name contains a NUL byte".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    fn read_back(header: &[u8], data: &[u8]) -> (String, Vec<u8>) {
        let mut archive_bytes = header.to_vec();
        archive_bytes.extend_from_slice(data);
        archive_bytes.resize(archive_bytes.len() + padding(data.len() as u64) as usize, 0);
        archive_bytes.extend_from_slice(&[0u8; 1024]);

        let mut archive = tar::Archive::new(Cursor::new(archive_bytes));
        let mut entries = archive.entries().expect("entries should open");
        let mut entry = entries
            .next()
            .expect("one entry expected")
            .expect("entry should parse");
        let path = entry
            .path()
            .expect("path should decode")
            .to_string_lossy()
            .into_owned();
        let mut content = Vec::new();
        entry
            .read_to_end(&mut content)
            .expect("content should read");
        (path, content)
    }

    #[test]
    fn test_short_name_single_block() {
        let header = GnuHeaderSynthesizer
            .synthesize("logs/app.log", 5, &HeaderMetadata::default())
            .expect("synthesize should succeed");
        assert_eq!(header.len(), 512);

        let (path, content) = read_back(&header, b"hello");
        assert_eq!(path, "logs/app.log");
        assert_eq!(content, b"hello");
    }

    #[test]
    fn test_name_exactly_field_width() {
        let name = "n".repeat(100);
        let header = GnuHeaderSynthesizer
            .synthesize(&name, 0, &HeaderMetadata::default())
            .expect("synthesize should succeed");
        assert_eq!(header.len(), 512);
        let (path, _) = read_back(&header, b"");
        assert_eq!(path, name);
    }

    #[test]
    fn test_long_name_uses_extension() {
        let name = format!("{}/object.bin", "deep".repeat(40));
        let header = GnuHeaderSynthesizer
            .synthesize(&name, 3, &HeaderMetadata::default())
            .expect("synthesize should succeed");
        assert_eq!(header.len() % 512, 0);
        assert_eq!(header.len(), 512 * 3);

        let (path, content) = read_back(&header, b"abc");
        assert_eq!(path, name);
        assert_eq!(content, b"abc");
    }

    #[test]
    fn test_header_records_metadata() {
        let metadata = HeaderMetadata::default()
            .with_mode(0o600)
            .with_mtime(1_700_000_000);
        let bytes = GnuHeaderSynthesizer
            .synthesize("manifest.csv", 42, &metadata)
            .expect("synthesize should succeed");
        let header = Header::from_byte_slice(&bytes);
        assert_eq!(header.size().expect("size"), 42);
        assert_eq!(header.mode().expect("mode"), 0o600);
        assert_eq!(header.mtime().expect("mtime"), 1_700_000_000);
        assert!(header.as_gnu().is_some());
    }

    #[test]
    fn test_rejects_bad_names() {
        let synth = GnuHeaderSynthesizer::new();
        assert!(synth.synthesize("", 0, &HeaderMetadata::default()).is_err());
        assert!(
            synth
                .synthesize("a\0b", 0, &HeaderMetadata::default())
                .is_err()
        );
    }
}
