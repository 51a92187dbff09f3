//! CSV report writer.
//!
//! Quoting follows RFC 4180: a field containing a comma, a double quote, CR or
//! LF is wrapped in double quotes with inner quotes doubled. Every other field
//! is written bare. [`parse_document`] reverses the encoding exactly.

#![allow(missing_docs)]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;

use crate::core::errors::{AuditError, Result};
use crate::inventory::metadata::GIB;
use crate::inventory::record::{ResourceRecord, UNKNOWN};
use crate::report::ReportSink;

/// Column names in output order.
pub const HEADER: [&str; 13] = [
    "project",
    "resource_type",
    "resource_name",
    "location",
    "creation_time",
    "created_by",
    "last_updated",
    "class_or_type",
    "labels",
    "size_gb",
    "size_bytes",
    "status",
    "detail",
];

/// Append-only CSV sink. The header is written on construction; each row is
/// assembled in memory and written with one `write_all` under the lock.
pub struct CsvReportSink<W: Write + Send> {
    inner: Mutex<CsvState<W>>,
    path: Option<PathBuf>,
}

struct CsvState<W> {
    writer: W,
    rows: u64,
}

impl CsvReportSink<BufWriter<File>> {
    /// Create (truncate) `path` and write the header.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| AuditError::io(parent, source))?;
        }
        let file = File::create(path).map_err(|source| AuditError::io(path, source))?;
        let mut sink = Self::new(BufWriter::new(file))?;
        sink.path = Some(path.to_path_buf());
        Ok(sink)
    }
}

impl<W: Write + Send> CsvReportSink<W> {
    pub fn new(mut writer: W) -> Result<Self> {
        writer
            .write_all(render_line(HEADER.iter().copied()).as_bytes())
            .map_err(write_error)?;
        Ok(Self {
            inner: Mutex::new(CsvState { writer, rows: 0 }),
            path: None,
        })
    }

    /// File backing this sink, when created with [`CsvReportSink::create`].
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Data rows written so far (header excluded).
    #[must_use]
    pub fn rows_written(&self) -> u64 {
        self.inner.lock().rows
    }

    /// Flush and hand back the writer.
    pub fn into_inner(self) -> Result<W> {
        let mut state = self.inner.into_inner();
        state.writer.flush().map_err(write_error)?;
        Ok(state.writer)
    }
}

impl<W: Write + Send> ReportSink for CsvReportSink<W> {
    fn emit(&self, record: &ResourceRecord) -> Result<()> {
        let line = render_record(record);
        let mut state = self.inner.lock();
        state.writer.write_all(line.as_bytes()).map_err(write_error)?;
        state.rows += 1;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.inner.lock().writer.flush().map_err(write_error)
    }
}

fn write_error(e: std::io::Error) -> AuditError {
    AuditError::ReportWrite {
        sink: "csv",
        details: e.to_string(),
    }
}

/// Field values of one record, in [`HEADER`] order.
#[must_use]
pub fn record_fields(record: &ResourceRecord) -> Vec<String> {
    vec![
        record.project_id.clone(),
        record.resource_type.as_str().to_string(),
        record.name.clone(),
        record.location.clone(),
        format_time(record.created_at.as_ref()),
        record
            .created_by
            .clone()
            .unwrap_or_else(|| UNKNOWN.to_string()),
        format_time(record.updated_at.as_ref()),
        record.class_or_type.clone(),
        format_labels(record),
        format_gib(record.size_bytes),
        record.size_bytes.to_string(),
        record.status.as_str().to_string(),
        record.detail(),
    ]
}

/// One CSV line (with trailing `\n`) for a record.
#[must_use]
pub fn render_record(record: &ResourceRecord) -> String {
    let fields = record_fields(record);
    render_line(fields.iter().map(String::as_str))
}

fn render_line<'a>(fields: impl IntoIterator<Item = &'a str>) -> String {
    let mut line = String::new();
    for (i, field) in fields.into_iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        escape_into(&mut line, field);
    }
    // A lone empty field must not read back as a blank line.
    if line.is_empty() {
        line.push_str("\"\"");
    }
    line.push('\n');
    line
}

fn needs_quoting(field: &str) -> bool {
    let bytes = field.as_bytes();
    memchr::memchr3(b',', b'"', b'\n', bytes).is_some() || memchr::memchr(b'\r', bytes).is_some()
}

/// Append `field`, quoted when required.
pub fn escape_into(out: &mut String, field: &str) {
    if !needs_quoting(field) {
        out.push_str(field);
        return;
    }
    out.push('"');
    let mut rest = field;
    while let Some(pos) = memchr::memchr(b'"', rest.as_bytes()) {
        out.push_str(&rest[..=pos]);
        out.push('"');
        rest = &rest[pos + 1..];
    }
    out.push_str(rest);
    out.push('"');
}

#[must_use]
pub fn escape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len() + 2);
    escape_into(&mut out, field);
    out
}

fn format_time(ts: Option<&DateTime<Utc>>) -> String {
    ts.map_or_else(
        || UNKNOWN.to_string(),
        |t| t.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

/// `k=v;k=v` in key order; empty when the resource has no labels.
fn format_labels(record: &ResourceRecord) -> String {
    record
        .labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(";")
}

/// Bytes as GiB with two decimals.
#[must_use]
pub fn format_gib(bytes: u64) -> String {
    #[allow(clippy::cast_precision_loss)]
    let gib = bytes as f64 / GIB as f64;
    format!("{gib:.2}")
}

/// Parse CSV text into rows of fields.
///
/// Accepts LF or CRLF row ends. Returns `Serialization` on an unterminated
/// quoted field or stray characters after a closing quote.
pub fn parse_document(text: &str) -> Result<Vec<Vec<String>>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut chars = text.chars().peekable();
    let mut row_has_content = false;

    while let Some(c) = chars.next() {
        match c {
            '"' if field.is_empty() => {
                row_has_content = true;
                loop {
                    match chars.next() {
                        Some('"') if chars.peek() == Some(&'"') => {
                            chars.next();
                            field.push('"');
                        }
                        Some('"') => break,
                        Some(other) => field.push(other),
                        None => return Err(parse_error("unterminated quoted field")),
                    }
                }
                match chars.peek() {
                    None | Some(',' | '\n' | '\r') => {}
                    Some(other) => {
                        return Err(parse_error(&format!(
                            "unexpected {other:?} after closing quote"
                        )));
                    }
                }
            }
            ',' => {
                row_has_content = true;
                row.push(std::mem::take(&mut field));
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                if row_has_content || !field.is_empty() {
                    row.push(std::mem::take(&mut field));
                    rows.push(std::mem::take(&mut row));
                }
                row_has_content = false;
            }
            other => {
                row_has_content = true;
                field.push(other);
            }
        }
    }
    if row_has_content || !field.is_empty() {
        row.push(field);
        rows.push(row);
    }
    Ok(rows)
}

fn parse_error(details: &str) -> AuditError {
    AuditError::Serialization {
        context: "csv",
        details: details.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::record::{
        IssueKind, ProbeIssue, ResourceRef, ResourceType, ScanTask, SizeSource,
    };
    use proptest::prelude::*;

    fn record() -> ResourceRecord {
        let mut r = ResourceRecord::for_task(&ScanTask {
            project_id: "proj-a".to_string(),
            resource_type: ResourceType::Bucket,
            resource: ResourceRef::named("logs"),
            sequence_index: 0,
        });
        r.set_size(5_000_000_000, SizeSource::Primary);
        r
    }

    #[test]
    fn header_then_one_line_per_row() {
        let sink = CsvReportSink::new(Vec::new()).unwrap();
        sink.emit(&record()).unwrap();
        sink.emit(&record()).unwrap();
        assert_eq!(sink.rows_written(), 2);
        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("project,resource_type,resource_name,location"));
        assert_eq!(
            lines[1],
            "proj-a,bucket,logs,unknown,unknown,unknown,unknown,unknown,,4.66,5000000000,success,"
        );
    }

    #[test]
    fn special_characters_are_quoted() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_field("two\nlines"), "\"two\nlines\"");
        assert_eq!(escape_field("cr\r"), "\"cr\r\"");
    }

    #[test]
    fn labels_and_detail_columns() {
        let mut r = record();
        r.labels.insert("team".to_string(), "data, eng".to_string());
        r.labels.insert("env".to_string(), "prod".to_string());
        r.mark_failed(ProbeIssue::new(IssueKind::Transport, "403 \"forbidden\""));
        let fields = record_fields(&r);
        assert_eq!(fields[8], "env=prod;team=data, eng");
        assert_eq!(fields[10], "0");
        assert_eq!(fields[11], "error");
        assert_eq!(fields[12], "transport: 403 \"forbidden\"");

        let parsed = parse_document(&render_record(&r)).unwrap();
        assert_eq!(parsed, vec![fields]);
    }

    #[test]
    fn gib_column_has_two_decimals() {
        assert_eq!(format_gib(0), "0.00");
        assert_eq!(format_gib(100 * GIB), "100.00");
        assert_eq!(format_gib(GIB / 2), "0.50");
    }

    #[test]
    fn parser_handles_crlf_and_empty_fields() {
        let rows = parse_document("a,,\"\"\r\nb,c,d\r\n").unwrap();
        assert_eq!(rows, vec![vec!["a", "", ""], vec!["b", "c", "d"]]);
    }

    #[test]
    fn parser_rejects_unterminated_quote() {
        let err = parse_document("a,\"open\n").unwrap_err();
        assert_eq!(err.code(), "CSA-2101");
    }

    #[test]
    fn create_writes_header_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("report.csv");
        let sink = CsvReportSink::create(&path).unwrap();
        sink.emit(&record()).unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.path(), Some(path.as_path()));
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(parse_document(&text).unwrap().len(), 2);
    }

    proptest! {
        #[test]
        fn fields_round_trip_losslessly(fields in prop::collection::vec(".{0,24}", 1..8)) {
            let line = render_line(fields.iter().map(String::as_str));
            let rows = parse_document(&line).unwrap();
            prop_assert_eq!(rows.len(), 1);
            prop_assert_eq!(&rows[0], &fields);
        }
    }
}
