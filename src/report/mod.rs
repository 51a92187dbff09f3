//! Report sinks: where normalized inventory rows go.
//!
//! A sink is append-only. Rows arrive one at a time, possibly from several
//! project threads at once; implementations serialize appends internally so a
//! row is never interleaved with another.

#![allow(missing_docs)]

pub mod csv;
pub mod summary;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::errors::Result;
use crate::inventory::record::ResourceRecord;

pub use self::csv::CsvReportSink;
pub use self::summary::AuditSummary;

/// Destination for one row per scanned resource.
pub trait ReportSink: Send + Sync {
    /// Append one row. Must not reorder or drop rows it accepted.
    fn emit(&self, record: &ResourceRecord) -> Result<()>;

    /// Push buffered rows to their destination.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl<S: ReportSink + ?Sized> ReportSink for Arc<S> {
    fn emit(&self, record: &ResourceRecord) -> Result<()> {
        (**self).emit(record)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

/// Keeps every row in memory, in arrival order.
#[derive(Default)]
pub struct MemorySink {
    rows: Mutex<Vec<ResourceRecord>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<ResourceRecord> {
        self.rows.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

impl ReportSink for MemorySink {
    fn emit(&self, record: &ResourceRecord) -> Result<()> {
        self.rows.lock().push(record.clone());
        Ok(())
    }
}

/// Fans each row out to several sinks; the first failure is returned.
#[derive(Default)]
pub struct TeeSink {
    sinks: Vec<Arc<dyn ReportSink>>,
}

impl TeeSink {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn ReportSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn ReportSink>) {
        self.sinks.push(sink);
    }
}

impl ReportSink for TeeSink {
    fn emit(&self, record: &ResourceRecord) -> Result<()> {
        self.sinks.iter().try_for_each(|sink| sink.emit(record))
    }

    fn flush(&self) -> Result<()> {
        self.sinks.iter().try_for_each(|sink| sink.flush())
    }
}
