//! End-of-audit summary: grand totals, per-project totals and everything that
//! went wrong, in human and JSON form.

#![allow(missing_docs)]

use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::inventory::aggregate::{GrandTotals, ProjectTotals};
use crate::inventory::record::ResourceType;

/// A resource type that could not be listed in a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerationFailure {
    pub project_id: String,
    pub resource_type: ResourceType,
    /// Backend failure class: `api_disabled`, `access_denied`, `transport`, `timeout`.
    pub class: String,
    pub reason: String,
}

/// A resource type skipped because its API is disabled in the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedType {
    pub project_id: String,
    pub resource_type: ResourceType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub grand_totals: GrandTotals,
    pub projects: Vec<ProjectTotals>,
    pub rows: u64,
    pub error_rows: u64,
    pub empty_rows: u64,
    pub unverified_rows: u64,
    pub fallback_rows: u64,
    pub enumeration_failures: Vec<EnumerationFailure>,
    pub skipped_disabled: Vec<SkippedType>,
    /// Why the secondary bucket measurement was unavailable for this run.
    pub fallback_unavailable: Option<String>,
    pub report_path: Option<PathBuf>,
}

impl AuditSummary {
    /// Build from the accumulator snapshot and per-project totals.
    #[must_use]
    pub fn new(
        started_at: DateTime<Utc>,
        elapsed_ms: u64,
        grand_totals: GrandTotals,
        mut projects: Vec<ProjectTotals>,
    ) -> Self {
        projects.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        let sum = |f: fn(&crate::inventory::aggregate::TypeTotals) -> u64| {
            grand_totals.by_type.values().map(f).sum::<u64>()
        };
        Self {
            started_at,
            elapsed_ms,
            rows: sum(|t| t.resource_count),
            error_rows: sum(|t| t.error_count),
            empty_rows: sum(|t| t.empty_count),
            unverified_rows: sum(|t| t.unverified_count),
            fallback_rows: sum(|t| t.fallback_count),
            grand_totals,
            projects,
            enumeration_failures: Vec::new(),
            skipped_disabled: Vec::new(),
            fallback_unavailable: None,
            report_path: None,
        }
    }

    /// Whether every resource was measured and every listing succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.error_rows == 0 && self.enumeration_failures.is_empty()
    }

    /// Multi-line human rendering.
    #[must_use]
    pub fn render_human(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Storage audit summary");
        let _ = writeln!(
            out,
            "  projects scanned: {}   resources: {}   elapsed: {}",
            self.grand_totals.projects,
            self.rows,
            format_elapsed(self.elapsed_ms)
        );
        let _ = writeln!(out);
        for resource_type in ResourceType::ALL {
            let t = self.grand_totals.get(resource_type);
            let _ = writeln!(
                out,
                "  {:<11} {:>6} resources  {:>12}  ({} bytes)",
                resource_type.as_str(),
                t.resource_count,
                format_bytes(t.total_bytes),
                t.total_bytes
            );
        }
        let _ = writeln!(
            out,
            "  {:<11} {:>6} resources  {:>12}  ({} bytes)",
            "total",
            self.rows,
            format_bytes(self.grand_totals.total_bytes()),
            self.grand_totals.total_bytes()
        );

        if self.projects.len() > 1 {
            let _ = writeln!(out);
            let _ = writeln!(out, "  per project:");
            for project in &self.projects {
                let _ = writeln!(
                    out,
                    "    {:<30} {:>12}  {} resources, {} errors",
                    project.project_id,
                    format_bytes(project.total_bytes()),
                    project.resource_count(),
                    project.error_count()
                );
            }
        }

        let _ = writeln!(out);
        if self.error_rows > 0 {
            let _ = writeln!(
                out,
                "  WARNING: {} resources could not be measured; their size is reported as 0",
                self.error_rows
            );
        }
        if self.unverified_rows > 0 {
            let _ = writeln!(
                out,
                "  note: {} empty rows are unverified (size output could not be parsed)",
                self.unverified_rows
            );
        }
        if self.fallback_rows > 0 {
            let _ = writeln!(
                out,
                "  note: {} bucket sizes came from the secondary measurement",
                self.fallback_rows
            );
        }
        if let Some(reason) = &self.fallback_unavailable {
            let _ = writeln!(
                out,
                "  WARNING: secondary bucket measurement unavailable, no fallback was possible: {reason}"
            );
        }
        for failure in &self.enumeration_failures {
            let _ = writeln!(
                out,
                "  WARNING: could not list {} in {} ({}): {}",
                failure.resource_type, failure.project_id, failure.class, failure.reason
            );
        }
        if !self.skipped_disabled.is_empty() {
            let _ = writeln!(
                out,
                "  skipped {} resource listings with disabled APIs",
                self.skipped_disabled.len()
            );
        }
        if let Some(path) = &self.report_path {
            let _ = writeln!(out, "  report: {}", path.display());
        }
        out
    }
}

/// Human-readable binary size.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;
    const TIB: u64 = 1024 * GIB;

    #[allow(clippy::cast_precision_loss)]
    let scaled = |unit: u64| bytes as f64 / unit as f64;
    if bytes >= TIB {
        format!("{:.2} TiB", scaled(TIB))
    } else if bytes >= GIB {
        format!("{:.2} GiB", scaled(GIB))
    } else if bytes >= MIB {
        format!("{:.1} MiB", scaled(MIB))
    } else if bytes >= KIB {
        format!("{:.1} KiB", scaled(KIB))
    } else {
        format!("{bytes} B")
    }
}

fn format_elapsed(ms: u64) -> String {
    let secs = ms / 1000;
    if secs < 60 {
        format!("{}.{:01}s", secs, (ms % 1000) / 100)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
