//! Source lists
//!
//! A source list names the objects to archive explicitly, one CSV row per
//! object: `bucket,key,size,etag`. Rows use the same quoting rules as the
//! manifest body.

use super::reader::{decode, split_rows};
use crate::error::{LayoutError, LayoutResult};

/// Column names of a source list header row
pub const SOURCE_HEADER_ROW: [&str; 4] = ["bucket", "key", "size", "etag"];

/// One object named by a source list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    /// Bucket holding the object
    pub bucket: String,
    /// Object key, also used as the member name
    pub key: String,
    /// Object size in bytes
    pub size: u64,
    /// Entity tag recorded for the object
    pub checksum: String,
}

impl SourceRecord {
    /// Create a record
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        size: u64,
        checksum: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            size,
            checksum: checksum.into(),
        }
    }
}

/// Parse a source list
///
/// With `skip_header` the first row is dropped whatever it contains.
/// Otherwise a first row equal to [`SOURCE_HEADER_ROW`] is still recognized
/// and skipped.
pub fn parse_source_list(body: &[u8], skip_header: bool) -> LayoutResult<Vec<SourceRecord>> {
    let rows = split_rows(decode(body)?)?;
    let mut records = Vec::with_capacity(rows.len());
    for (index, (line, fields)) in rows.into_iter().enumerate() {
        let is_header = skip_header || fields.iter().map(String::as_str).eq(SOURCE_HEADER_ROW);
        if index == 0 && is_header {
            continue;
        }
        records.push(parse_source(line, fields)?);
    }
    Ok(records)
}

fn parse_source(line: usize, fields: Vec<String>) -> LayoutResult<SourceRecord> {
    let invalid = |reason: String| LayoutError::InvalidManifest { line, reason };

    let count = fields.len();
    let Ok([bucket, key, size, checksum]) = <[String; 4]>::try_from(fields) else {
        return Err(invalid(format!("expected 4 fields, found {count}")));
    };
    if bucket.is_empty() {
        return Err(invalid("empty bucket".to_string()));
    }
    if key.is_empty() {
        return Err(invalid("empty key".to_string()));
    }
    let size = size
        .parse::<u64>()
        .map_err(|e| invalid(format!("invalid size {size:?}: {e}")))?;

    Ok(SourceRecord {
        bucket,
        key,
        size,
        checksum,
    })
}
