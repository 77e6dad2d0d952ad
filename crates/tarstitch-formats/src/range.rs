//! Byte ranges within source objects and the destination archive

use std::fmt;

use serde::{Deserialize, Serialize};

/// Half-open byte range `[start, start + len)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// First byte of the range
    pub start: u64,
    /// Number of bytes in the range
    pub len: u64,
}

impl ByteRange {
    /// Create a range from offset and length
    pub const fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// Range covering a whole object of `len` bytes
    pub const fn whole(len: u64) -> Self {
        Self { start: 0, len }
    }

    /// One past the last byte
    pub const fn end(&self) -> u64 {
        self.start + self.len
    }

    /// Last byte (inclusive), `None` for an empty range
    pub const fn last(&self) -> Option<u64> {
        if self.len == 0 {
            None
        } else {
            Some(self.start + self.len - 1)
        }
    }

    /// Check if the range is empty
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check if this range contains the given offset
    pub const fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }

    /// First `len` bytes of this range
    #[must_use]
    pub fn head(&self, len: u64) -> Self {
        Self::new(self.start, len.min(self.len))
    }

    /// Everything after the first `len` bytes
    #[must_use]
    pub fn tail(&self, len: u64) -> Self {
        let skip = len.min(self.len);
        Self::new(self.start + skip, self.len - skip)
    }

    /// Convert this range to an HTTP Range header value
    ///
    /// Returns `None` for empty ranges, which HTTP cannot express.
    pub fn to_header_value(&self) -> Option<String> {
        self.last()
            .map(|last| format!("bytes={}-{}", self.start, last))
    }

    /// Split this range into `parts` contiguous ranges
    ///
    /// Sizes differ by at most one byte; the first `len % parts` ranges carry
    /// the extra byte. `parts` is clamped to `[1, len]`.
    pub fn split(&self, parts: u64) -> Vec<Self> {
        if self.len == 0 {
            return vec![*self];
        }
        let parts = parts.clamp(1, self.len);
        let base = self.len / parts;
        let extra = self.len % parts;

        let mut ranges = Vec::with_capacity(parts as usize);
        let mut start = self.start;
        for index in 0..parts {
            let len = base + u64::from(index < extra);
            ranges.push(Self::new(start, len));
            start += len;
        }
        ranges
    }
}

/// Split `len` bytes starting at zero into `parts` near-equal ranges
pub fn split_range(len: u64, parts: u64) -> Vec<ByteRange> {
    ByteRange::whole(len).split(parts)
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last() {
            Some(last) => write!(f, "{}-{}", self.start, last),
            None => write!(f, "{}-(empty)", self.start),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_header_value() {
        assert_eq!(
            ByteRange::new(100, 50).to_header_value().as_deref(),
            Some("bytes=100-149")
        );
        assert_eq!(ByteRange::new(7, 0).to_header_value(), None);
    }

    #[test]
    fn test_split_even() {
        let ranges = ByteRange::new(10, 30).split(3);
        assert_eq!(
            ranges,
            vec![
                ByteRange::new(10, 10),
                ByteRange::new(20, 10),
                ByteRange::new(30, 10)
            ]
        );
    }

    #[test]
    fn test_split_remainder_spread() {
        let ranges = ByteRange::new(0, 11).split(3);
        let lens: Vec<u64> = ranges.iter().map(|r| r.len).collect();
        assert_eq!(lens, vec![4, 4, 3]);
        assert_eq!(ranges.last().map(ByteRange::end), Some(11));
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end(), pair[1].start);
        }
    }

    #[test]
    fn test_split_clamps_part_count() {
        assert_eq!(ByteRange::new(0, 2).split(10).len(), 2);
        assert_eq!(ByteRange::new(0, 2).split(0).len(), 1);
    }

    #[test]
    fn test_head_tail() {
        let range = ByteRange::new(100, 50);
        assert_eq!(range.head(20), ByteRange::new(100, 20));
        assert_eq!(range.tail(20), ByteRange::new(120, 30));
        assert!(range.tail(80).is_empty());
        assert!(range.contains(149));
        assert!(!range.contains(150));
    }
}
