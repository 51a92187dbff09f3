//! Resource records, scan tasks, and the status vocabulary shared by the engine.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Literal rendered for any metadata field no source could supply.
pub const UNKNOWN: &str = "unknown";

/// Category of storage asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Bucket,
    Disk,
    FileShare,
}

impl ResourceType {
    pub const ALL: [Self; 3] = [Self::Bucket, Self::Disk, Self::FileShare];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bucket => "bucket",
            Self::Disk => "disk",
            Self::FileShare => "file_share",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Success,
    EmptyOrZero,
    Error,
}

impl ResourceStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::EmptyOrZero => "empty_or_zero",
            Self::Error => "error",
        }
    }
}

/// Which measurement produced `size_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeSource {
    /// Primary summarization call.
    Primary,
    /// Secondary size query, used because the primary gave no positive count.
    Fallback,
    /// Size field of the resource's describe document.
    Metadata,
    /// Nothing measured a positive size.
    None,
}

/// Classification of a per-resource failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Backend call failed outright (auth, network, disabled API, non-zero exit).
    Transport,
    /// Attempt exceeded its allotted time.
    Timeout,
    /// Call succeeded but its output held no usable size.
    Parse,
    /// The worker executing the probe died before producing a record.
    WorkerLost,
}

impl IssueKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Parse => "parse",
            Self::WorkerLost => "worker_lost",
        }
    }
}

/// Retained cause of a failed or unverified measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeIssue {
    pub kind: IssueKind,
    pub message: String,
}

impl ProbeIssue {
    pub fn new(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProbeIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Identifier of one enumerated resource.
///
/// `scope` carries the zone/region some resource kinds need to be addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl ResourceRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: None,
        }
    }

    pub fn scoped(name: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: Some(scope.into()),
        }
    }
}

/// Unit of work submitted to the scheduler. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTask {
    pub project_id: String,
    pub resource_type: ResourceType,
    pub resource: ResourceRef,
    pub sequence_index: usize,
}

/// One scanned resource.
///
/// Invariant: `status == Error` implies `size_bytes == 0` and `issue.is_some()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub sequence_index: usize,
    pub project_id: String,
    pub resource_type: ResourceType,
    pub name: String,
    pub location: String,
    pub created_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub class_or_type: String,
    pub labels: BTreeMap<String, String>,
    pub size_bytes: u64,
    pub status: ResourceStatus,
    pub size_source: SizeSource,
    pub issue: Option<ProbeIssue>,
}

impl ResourceRecord {
    /// Blank record for a task: unknown metadata, zero size, `EmptyOrZero`.
    #[must_use]
    pub fn for_task(task: &ScanTask) -> Self {
        Self {
            sequence_index: task.sequence_index,
            project_id: task.project_id.clone(),
            resource_type: task.resource_type,
            name: task.resource.name.clone(),
            location: task
                .resource
                .scope
                .clone()
                .unwrap_or_else(|| UNKNOWN.to_string()),
            created_at: None,
            created_by: None,
            updated_at: None,
            class_or_type: UNKNOWN.to_string(),
            labels: BTreeMap::new(),
            size_bytes: 0,
            status: ResourceStatus::EmptyOrZero,
            size_source: SizeSource::None,
            issue: None,
        }
    }

    /// Error record for a task whose probe failed.
    #[must_use]
    pub fn failed(task: &ScanTask, issue: ProbeIssue) -> Self {
        let mut record = Self::for_task(task);
        record.mark_failed(issue);
        record
    }

    /// Transition to `Error`, dropping any partial size.
    pub fn mark_failed(&mut self, issue: ProbeIssue) {
        self.status = ResourceStatus::Error;
        self.size_bytes = 0;
        self.size_source = SizeSource::None;
        self.issue = Some(issue);
    }

    /// Record a measured size. Zero yields `EmptyOrZero`.
    pub fn set_size(&mut self, size_bytes: u64, source: SizeSource) {
        self.size_bytes = size_bytes;
        if size_bytes > 0 {
            self.status = ResourceStatus::Success;
            self.size_source = source;
        } else {
            self.status = ResourceStatus::EmptyOrZero;
            self.size_source = SizeSource::None;
        }
    }

    /// Whether the size came from the secondary strategy.
    #[must_use]
    pub fn used_fallback(&self) -> bool {
        self.size_source == SizeSource::Fallback
    }

    /// Whether the record was measured-empty only because output was unparseable.
    #[must_use]
    pub fn is_unverified_empty(&self) -> bool {
        self.status == ResourceStatus::EmptyOrZero
            && self
                .issue
                .as_ref()
                .is_some_and(|issue| issue.kind == IssueKind::Parse)
    }

    /// Short human explanation for the report's `detail` column.
    #[must_use]
    pub fn detail(&self) -> String {
        match (self.status, &self.issue) {
            (ResourceStatus::Error, Some(issue)) => issue.to_string(),
            (ResourceStatus::EmptyOrZero, Some(issue)) => format!("unverified {issue}"),
            (ResourceStatus::EmptyOrZero, None) => "confirmed empty".to_string(),
            (ResourceStatus::Success, _) if self.used_fallback() => "fallback".to_string(),
            _ => String::new(),
        }
    }
}
