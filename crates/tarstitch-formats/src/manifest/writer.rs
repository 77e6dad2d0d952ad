use super::record::ManifestRecord;

/// Column names emitted when a header row is requested
pub const HEADER_ROW: [&str; 4] = ["name", "offset", "size", "etag"];

/// CSV encoder for manifest bodies
///
/// Records are newline-terminated. Fields are quoted only when they contain a
/// comma, a quote, CR or LF, or start with whitespace; quotes are doubled.
#[derive(Debug, Clone, Default)]
pub struct ManifestWriter {
    buffer: String,
}

impl ManifestWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with room for `records` rows
    pub fn with_capacity(records: usize) -> Self {
        Self {
            buffer: String::with_capacity(records * 64),
        }
    }

    /// Write the column header row
    pub fn write_header(&mut self) -> &mut Self {
        self.write_fields(&HEADER_ROW);
        self
    }

    /// Write one record
    pub fn write_record(&mut self, record: &ManifestRecord) -> &mut Self {
        let offset = record.offset.to_string();
        let size = record.size.to_string();
        self.write_fields(&[
            record.name.as_str(),
            offset.as_str(),
            size.as_str(),
            record.checksum.as_str(),
        ]);
        self
    }

    /// Write every record in order
    pub fn write_records<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a ManifestRecord>,
    ) -> &mut Self {
        for record in records {
            self.write_record(record);
        }
        self
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if nothing was written
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Finish and return the encoded body
    pub fn finish(self) -> Vec<u8> {
        self.buffer.into_bytes()
    }

    fn write_fields(&mut self, fields: &[&str]) {
        for (index, field) in fields.iter().enumerate() {
            if index > 0 {
                self.buffer.push(',');
            }
            write_field(&mut self.buffer, field);
        }
        self.buffer.push('\n');
    }
}

fn needs_quotes(field: &str) -> bool {
    field.starts_with([' ', '\t']) || field.contains([',', '"', '\r', '\n'])
}

fn write_field(out: &mut String, field: &str) {
    if !needs_quotes(field) {
        out.push_str(field);
        return;
    }
    out.push('"');
    for ch in field.chars() {
        if ch == '"' {
            out.push('"');
        }
        out.push(ch);
    }
    out.push('"');
}

/// Encode records into a manifest body
pub fn encode(records: &[ManifestRecord], header_row: bool) -> Vec<u8> {
    let mut writer = ManifestWriter::with_capacity(records.len() + usize::from(header_row));
    if header_row {
        writer.write_header();
    }
    writer.write_records(records);
    writer.finish()
}

/// Format a single record as it appears in the body, newline included
pub fn format_record(record: &ManifestRecord) -> String {
    let mut writer = ManifestWriter::new();
    writer.write_record(record);
    writer.buffer
}
