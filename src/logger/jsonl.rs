//! JSONL activity log: one self-contained JSON object per line.
//!
//! Lines are serialized in memory and handed to a single `write_all`, so a
//! concurrent `tail -f` never sees half a record. When the log cannot be
//! written the writer degrades instead of failing the audit:
//! primary path → fallback path → stderr (`[CSA-JSONL]` prefix) → discard.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{AuditError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Activity event identifiers as written to the `event` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AuditStart,
    ProjectStart,
    ProjectComplete,
    ResourceFailed,
    FallbackUsed,
    ParseFailed,
    EnumerationFailed,
    FallbackUnavailable,
    AuditComplete,
    Error,
}

/// One log line. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp with milliseconds.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Resource or project count, depending on the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Empty entry stamped with the current UTC time.
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: format_utc_now(),
            event,
            severity,
            project: None,
            resource_type: None,
            resource: None,
            size_bytes: None,
            count: None,
            errors: None,
            duration_ms: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Normal,
    Fallback,
    Stderr,
    Discard,
}

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the current file would exceed this size.
    pub max_size_bytes: u64,
    /// Rotated generations kept as `<path>.1` .. `<path>.N`.
    pub max_rotated_files: u32,
}

impl JsonlConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback_path: None,
            max_size_bytes: 50 * 1024 * 1024,
            max_rotated_files: 3,
        }
    }
}

/// Append-only writer with size rotation and a degradation chain.
pub struct JsonlWriter {
    config: JsonlConfig,
    writer: Option<BufWriter<File>>,
    state: WriterState,
    bytes_written: u64,
}

impl JsonlWriter {
    /// Open the log, falling down the chain if the primary path is unusable.
    pub fn open(config: JsonlConfig) -> Self {
        let mut w = Self {
            config,
            writer: None,
            state: WriterState::Discard,
            bytes_written: 0,
        };
        match open_append(&w.config.path) {
            Ok((file, size)) => w.attach(file, size, WriterState::Normal),
            Err(e) => {
                let _ = writeln!(io::stderr(), "[CSA-JSONL] {e}");
                w.open_fallback();
            }
        }
        w
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(json) => self.write_line(&format!("{json}\n")),
            Err(e) => {
                let _ = writeln!(io::stderr(), "[CSA-JSONL] serialize error: {e}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(w) = self.writer.as_mut()
            && w.flush().is_err()
        {
            self.degrade();
        }
    }

    /// Current degradation level.
    #[must_use]
    pub fn state(&self) -> &'static str {
        match self.state {
            WriterState::Normal => "normal",
            WriterState::Fallback => "fallback",
            WriterState::Stderr => "stderr",
            WriterState::Discard => "discard",
        }
    }

    fn attach(&mut self, file: File, size: u64, state: WriterState) {
        self.writer = Some(BufWriter::with_capacity(64 * 1024, file));
        self.bytes_written = size;
        self.state = state;
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        if self.bytes_written + len > self.config.max_size_bytes
            && matches!(self.state, WriterState::Normal | WriterState::Fallback)
        {
            self.rotate();
        }

        match self.state {
            WriterState::Normal | WriterState::Fallback => {
                let written = self
                    .writer
                    .as_mut()
                    .is_some_and(|w| w.write_all(line.as_bytes()).is_ok());
                if written {
                    self.bytes_written += len;
                } else {
                    self.degrade();
                    self.write_line(line);
                }
            }
            WriterState::Stderr => {
                if write!(io::stderr(), "[CSA-JSONL] {line}").is_err() {
                    self.state = WriterState::Discard;
                }
            }
            WriterState::Discard => {}
        }
    }

    fn open_fallback(&mut self) {
        let opened = self
            .config
            .fallback_path
            .as_deref()
            .and_then(|fb| open_append(fb).ok().map(|opened| (fb.to_path_buf(), opened)));
        match opened {
            Some((fb, (file, size))) => {
                let _ = writeln!(
                    io::stderr(),
                    "[CSA-JSONL] primary log unavailable, using fallback: {}",
                    fb.display()
                );
                self.attach(file, size, WriterState::Fallback);
            }
            None => {
                let _ = writeln!(io::stderr(), "[CSA-JSONL] no writable log path, using stderr");
                self.writer = None;
                self.state = WriterState::Stderr;
            }
        }
    }

    fn degrade(&mut self) {
        self.writer = None;
        match self.state {
            WriterState::Normal => self.open_fallback(),
            WriterState::Fallback => {
                let _ = writeln!(io::stderr(), "[CSA-JSONL] fallback write failed, using stderr");
                self.state = WriterState::Stderr;
            }
            WriterState::Stderr | WriterState::Discard => self.state = WriterState::Discard,
        }
    }

    fn rotate(&mut self) {
        if let Some(mut w) = self.writer.take() {
            let _ = w.flush();
        }
        let base = match self.state {
            WriterState::Normal => self.config.path.clone(),
            WriterState::Fallback => match &self.config.fallback_path {
                Some(p) => p.clone(),
                None => return,
            },
            WriterState::Stderr | WriterState::Discard => return,
        };

        let keep = self.config.max_rotated_files;
        let _ = fs::remove_file(rotated_name(&base, keep));
        for i in (1..keep).rev() {
            let _ = fs::rename(rotated_name(&base, i), rotated_name(&base, i + 1));
        }
        if keep > 0 {
            let _ = fs::rename(&base, rotated_name(&base, 1));
        } else {
            let _ = fs::remove_file(&base);
        }

        match open_append(&base) {
            Ok((file, _)) => self.attach(file, 0, self.state),
            Err(_) => self.degrade(),
        }
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
    }
}

/// Open or create `path` for appending; returns the file and its current length.
fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| AuditError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| AuditError::io(path, source))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((file, size))
}

/// `activity.jsonl` → `activity.jsonl.2`.
fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

pub(crate) fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> JsonlConfig {
        JsonlConfig::new(dir.join("activity.jsonl"))
    }

    #[test]
    fn entries_are_valid_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = JsonlWriter::open(config(dir.path()));
        let mut entry = LogEntry::new(EventType::FallbackUsed, Severity::Info);
        entry.project = Some("proj-a".to_string());
        entry.resource = Some("logs".to_string());
        entry.size_bytes = Some(1_500_000_000);
        writer.write_entry(&entry);
        writer.write_entry(&LogEntry::new(EventType::AuditComplete, Severity::Info));
        writer.flush();

        let contents = fs::read_to_string(dir.path().join("activity.jsonl")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "fallback_used");
        assert_eq!(first["size_bytes"], 1_500_000_000_u64);
        assert!(first.get("error_code").is_none());
        assert_eq!(writer.state(), "normal");
    }

    #[test]
    fn rotation_keeps_generations() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_size_bytes = 200;
        cfg.max_rotated_files = 2;
        let mut writer = JsonlWriter::open(cfg);
        for _ in 0..20 {
            let mut entry = LogEntry::new(EventType::ProjectComplete, Severity::Info);
            entry.details = Some("x".repeat(40));
            writer.write_entry(&entry);
        }
        writer.flush();

        let base = dir.path().join("activity.jsonl");
        assert!(base.exists());
        assert!(rotated_name(&base, 1).exists());
        assert!(rotated_name(&base, 2).exists());
        assert!(!rotated_name(&base, 3).exists());
    }

    #[test]
    fn falls_back_when_primary_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "file").unwrap();
        let cfg = JsonlConfig {
            path: blocker.join("activity.jsonl"),
            fallback_path: Some(dir.path().join("fallback.jsonl")),
            ..config(dir.path())
        };
        let mut writer = JsonlWriter::open(cfg);
        assert_eq!(writer.state(), "fallback");
        writer.write_entry(&LogEntry::new(EventType::Error, Severity::Warning));
        writer.flush();
        let contents = fs::read_to_string(dir.path().join("fallback.jsonl")).unwrap();
        assert!(contents.contains("\"event\":\"error\""));
    }

    #[test]
    fn degrades_to_stderr_without_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "file").unwrap();
        let writer = JsonlWriter::open(JsonlConfig::new(blocker.join("x.jsonl")));
        assert_eq!(writer.state(), "stderr");
    }

    #[test]
    fn rotated_name_appends_index() {
        assert_eq!(
            rotated_name(Path::new("/var/log/a.jsonl"), 3),
            PathBuf::from("/var/log/a.jsonl.3")
        );
    }
}
