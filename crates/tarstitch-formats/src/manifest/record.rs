use std::fmt;

/// One manifest row: where an entry's header starts in the archive
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestRecord {
    /// Member name
    pub name: String,
    /// Absolute offset of the member's first header byte
    pub offset: u64,
    /// Data size in bytes
    pub size: u64,
    /// Content checksum
    pub checksum: String,
}

impl ManifestRecord {
    /// Create a new record
    pub fn new(
        name: impl Into<String>,
        offset: u64,
        size: u64,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            offset,
            size,
            checksum: checksum.into(),
        }
    }
}

impl fmt::Display for ManifestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {} ({} bytes, {})",
            self.name, self.offset, self.size, self.checksum
        )
    }
}
