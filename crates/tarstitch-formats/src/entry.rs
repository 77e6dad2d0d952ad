//! Archive members

use bytes::Bytes;

use crate::header::HeaderMetadata;

/// Where an entry's bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    /// Object already resident in the store
    Object {
        /// Source bucket
        bucket: String,
        /// Source key
        key: String,
    },
    /// Bytes built in memory
    Inline(Bytes),
}

/// One member of the archive
///
/// The size must match the source object at layout time. Nothing here
/// re-reads the source, so a change between layout and assembly goes
/// unnoticed unless the assembler checks for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Member name inside the archive
    pub name: String,
    /// Data size in bytes
    pub size: u64,
    /// Content tag, usually the store's ETag
    pub checksum: String,
    /// Data location
    pub source: EntrySource,
    /// 1-based position in listing order
    pub sequence: usize,
    /// Header fields other than name and size
    pub metadata: HeaderMetadata,
}

impl Entry {
    /// Entry backed by a store object
    pub fn from_object(
        bucket: impl Into<String>,
        key: impl Into<String>,
        size: u64,
        checksum: impl Into<String>,
        sequence: usize,
    ) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            size,
            checksum: checksum.into(),
            source: EntrySource::Object {
                bucket: bucket.into(),
                key,
            },
            sequence,
            metadata: HeaderMetadata::default(),
        }
    }

    /// Entry whose bytes are held in memory
    ///
    /// The checksum is the hex MD5 of the data.
    pub fn inline(name: impl Into<String>, data: impl Into<Bytes>, sequence: usize) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            checksum: hex::encode(md5::compute(&data).0),
            source: EntrySource::Inline(data),
            sequence,
            metadata: HeaderMetadata::default(),
        }
    }

    /// Override the member name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Override the header metadata
    #[must_use]
    pub fn with_metadata(mut self, metadata: HeaderMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check if the entry has no data
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Source bucket and key, if the entry lives in the store
    pub fn object(&self) -> Option<(&str, &str)> {
        match &self.source {
            EntrySource::Object { bucket, key } => Some((bucket, key)),
            EntrySource::Inline(_) => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_checksum() {
        let entry = Entry::inline("hello.txt", &b"hello"[..], 1);
        assert_eq!(entry.size, 5);
        assert_eq!(entry.checksum, "5d41402abc4b2a76b9719d911017c592");
        assert!(entry.object().is_none());
    }

    #[test]
    fn test_object_entry_uses_key_as_name() {
        let entry = Entry::from_object("bucket", "dir/file.bin", 10, "etag", 3);
        assert_eq!(entry.name, "dir/file.bin");
        assert_eq!(entry.object(), Some(("bucket", "dir/file.bin")));
        assert_eq!(entry.sequence, 3);
    }
}
