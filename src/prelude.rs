//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use cloud_storage_audit::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{AuditError, Result};

// Backends
pub use crate::backend::BackendSet;
pub use crate::backend::fixture::FixtureInventory;

// Inventory
pub use crate::inventory::aggregate::{Accumulator, GrandTotals, ProjectTotals};
pub use crate::inventory::audit::{AuditOptions, Auditor};
pub use crate::inventory::pool::{PoolConfig, WorkerPool};
pub use crate::inventory::probe::{Probe, ResourceProber};
pub use crate::inventory::record::{
    ResourceRecord, ResourceStatus, ResourceType, ScanTask, SizeSource,
};

// Reporting
pub use crate::report::{AuditSummary, CsvReportSink, MemorySink, ReportSink};
