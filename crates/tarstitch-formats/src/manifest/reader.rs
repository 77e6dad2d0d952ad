use std::io::Read;

use super::record::ManifestRecord;
use super::writer::HEADER_ROW;
use crate::error::{LayoutError, LayoutResult};

/// Manifest body parser
///
/// Accepts bodies with or without the column header row, LF or CRLF record
/// terminators, and trailing NUL padding left over from the tar block.
pub struct ManifestReader<R> {
    reader: R,
}

impl<R: Read> ManifestReader<R> {
    /// Create a new reader from any `Read` source
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read and parse every record
    pub fn read_records(&mut self) -> LayoutResult<Vec<ManifestRecord>> {
        let mut body = Vec::new();
        self.reader.read_to_end(&mut body)?;
        parse(&body)
    }
}

impl<'a> ManifestReader<&'a [u8]> {
    /// Create a reader from a byte slice
    #[must_use]
    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        Self::new(bytes)
    }
}

/// Parse a manifest body into records
pub fn parse(body: &[u8]) -> LayoutResult<Vec<ManifestRecord>> {
    let mut records = Vec::new();
    for (index, (line, fields)) in split_rows(decode(body)?)?.into_iter().enumerate() {
        if index == 0 && fields.iter().map(String::as_str).eq(HEADER_ROW) {
            continue;
        }
        records.push(parse_record(line, fields)?);
    }
    Ok(records)
}

/// Body text with trailing NUL padding removed
pub(super) fn decode(body: &[u8]) -> LayoutResult<&str> {
    let end = body.iter().rposition(|&b| b != 0).map_or(0, |pos| pos + 1);
    std::str::from_utf8(&body[..end]).map_err(|e| LayoutError::InvalidManifest {
        line: 1,
        reason: format!("body is not UTF-8: {e}"),
    })
}

fn parse_record(line: usize, fields: Vec<String>) -> LayoutResult<ManifestRecord> {
    let [name, offset, size, checksum]: [String; 4] =
        fields
            .try_into()
            .map_err(|fields: Vec<String>| LayoutError::InvalidManifest {
                line,
                reason: format!("expected 4 fields, found {}", fields.len()),
            })?;

    let parse_number = |value: &str, column: &str| {
        value
            .parse::<u64>()
            .map_err(|e| LayoutError::InvalidManifest {
                line,
                reason: format!("invalid {column} {value:?}: {e}"),
            })
    };

    Ok(ManifestRecord {
        offset: parse_number(&offset, "offset")?,
        size: parse_number(&size, "size")?,
        name,
        checksum,
    })
}

/// Split CSV text into rows of fields, keyed by the line each row starts on
pub(super) fn split_rows(text: &str) -> LayoutResult<Vec<(usize, Vec<String>)>> {
    let mut rows = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut was_quoted = false;
    let mut line = 1;
    let mut row_line = 1;

    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => {
                    in_quotes = false;
                    was_quoted = true;
                }
                '\n' => {
                    line += 1;
                    field.push(ch);
                }
                _ => field.push(ch),
            }
            continue;
        }

        match ch {
            ',' => {
                fields.push(std::mem::take(&mut field));
                was_quoted = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                fields.push(std::mem::take(&mut field));
                was_quoted = false;
                // Blank lines carry no record
                if !(fields.len() == 1 && fields[0].is_empty()) {
                    rows.push((row_line, std::mem::take(&mut fields)));
                }
                fields.clear();
                line += 1;
                row_line = line;
            }
            '"' if field.is_empty() && !was_quoted => in_quotes = true,
            _ if was_quoted => {
                return Err(LayoutError::InvalidManifest {
                    line,
                    reason: format!("unexpected {ch:?} after closing quote"),
                });
            }
            '"' => {
                return Err(LayoutError::InvalidManifest {
                    line,
                    reason: "bare quote in unquoted field".to_string(),
                });
            }
            _ => field.push(ch),
        }
    }

    if in_quotes {
        return Err(LayoutError::InvalidManifest {
            line,
            reason: "unterminated quoted field".to_string(),
        });
    }
    if !field.is_empty() || !fields.is_empty() || was_quoted {
        fields.push(field);
        rows.push((row_line, fields));
    }
    Ok(rows)
}
