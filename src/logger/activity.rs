//! Activity logger thread.
//!
//! A dedicated thread owns the [`JsonlWriter`]. Every other thread sends
//! [`ActivityEvent`]s through a bounded crossbeam channel with `try_send`, so a
//! slow disk never stalls a probe. Events that do not fit are counted and the
//! count is written as a warning with the next event that gets through.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{AuditError, Result};
use crate::inventory::record::{ResourceRecord, ResourceType};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum ActivityEvent {
    AuditStarted {
        version: String,
        config_hash: String,
        projects: usize,
    },
    ProjectStarted {
        project_id: String,
        resources: usize,
    },
    ProjectCompleted {
        project_id: String,
        total_bytes: u64,
        resources: usize,
        errors: usize,
        duration_ms: u64,
    },
    ResourceFailed {
        project_id: String,
        resource_type: ResourceType,
        name: String,
        kind: String,
        message: String,
    },
    FallbackUsed {
        project_id: String,
        name: String,
        size_bytes: u64,
    },
    ParseFailed {
        project_id: String,
        resource_type: ResourceType,
        name: String,
        message: String,
    },
    EnumerationFailed {
        project_id: String,
        resource_type: ResourceType,
        reason: String,
    },
    /// The secondary size tool failed its availability check; buckets are
    /// measured by the primary strategy alone.
    FallbackUnavailable {
        backend: String,
        reason: String,
    },
    AuditCompleted {
        projects: usize,
        total_bytes: u64,
        error_rows: usize,
        duration_ms: u64,
    },
    Error {
        code: String,
        message: String,
    },
    /// Sentinel: flush and stop the logger thread.
    Shutdown,
}

impl ActivityEvent {
    /// Event describing a noteworthy record, if any.
    #[must_use]
    pub fn for_record(record: &ResourceRecord) -> Option<Self> {
        use crate::inventory::record::ResourceStatus;

        let issue = record.issue.as_ref();
        match record.status {
            ResourceStatus::Error => Some(Self::ResourceFailed {
                project_id: record.project_id.clone(),
                resource_type: record.resource_type,
                name: record.name.clone(),
                kind: issue.map_or("unknown", |i| i.kind.as_str()).to_string(),
                message: issue.map(|i| i.message.clone()).unwrap_or_default(),
            }),
            ResourceStatus::EmptyOrZero if record.is_unverified_empty() => Some(Self::ParseFailed {
                project_id: record.project_id.clone(),
                resource_type: record.resource_type,
                name: record.name.clone(),
                message: issue.map(|i| i.message.clone()).unwrap_or_default(),
            }),
            ResourceStatus::Success if record.used_fallback() => Some(Self::FallbackUsed {
                project_id: record.project_id.clone(),
                name: record.name.clone(),
                size_bytes: record.size_bytes,
            }),
            _ => None,
        }
    }
}

/// Cloneable sender side of the logger.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Non-blocking send; a full channel drops the event and bumps the counter.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit. Blocks only if the channel is full.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }

    /// Handle connected to nothing; every event is discarded.
    #[must_use]
    pub fn disabled() -> Self {
        let (tx, _rx) = bounded(1);
        Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }
}

pub struct ActivityLoggerConfig {
    pub jsonl: JsonlConfig,
    pub channel_capacity: usize,
}

impl ActivityLoggerConfig {
    pub fn new(jsonl: JsonlConfig) -> Self {
        Self {
            jsonl,
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the logger thread.
///
/// The thread exits on [`ActivityLoggerHandle::shutdown`] or once every handle
/// has been dropped.
pub fn spawn_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: Arc::clone(&dropped),
    };

    let join = thread::Builder::new()
        .name("csa-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config.jsonl, &dropped))
        .map_err(|e| AuditError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

fn logger_thread_main(rx: &Receiver<ActivityEvent>, jsonl: JsonlConfig, dropped: &AtomicU64) {
    let mut writer = JsonlWriter::open(jsonl);

    for event in rx {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.count = Some(lost);
            warn.details = Some(format!("{lost} activity events dropped under back-pressure"));
            writer.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        writer.write_entry(&to_log_entry(&event));
    }

    writer.flush();
}

fn to_log_entry(event: &ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::AuditStarted {
            version,
            config_hash,
            projects,
        } => {
            let mut e = LogEntry::new(EventType::AuditStart, Severity::Info);
            e.count = Some(*projects as u64);
            e.details = Some(format!("version={version} config_hash={config_hash}"));
            e
        }
        ActivityEvent::ProjectStarted {
            project_id,
            resources,
        } => {
            let mut e = LogEntry::new(EventType::ProjectStart, Severity::Info);
            e.project = Some(project_id.clone());
            e.count = Some(*resources as u64);
            e
        }
        ActivityEvent::ProjectCompleted {
            project_id,
            total_bytes,
            resources,
            errors,
            duration_ms,
        } => {
            let severity = if *errors > 0 {
                Severity::Warning
            } else {
                Severity::Info
            };
            let mut e = LogEntry::new(EventType::ProjectComplete, severity);
            e.project = Some(project_id.clone());
            e.size_bytes = Some(*total_bytes);
            e.count = Some(*resources as u64);
            e.errors = Some(*errors as u64);
            e.duration_ms = Some(*duration_ms);
            e
        }
        ActivityEvent::ResourceFailed {
            project_id,
            resource_type,
            name,
            kind,
            message,
        } => {
            let mut e = LogEntry::new(EventType::ResourceFailed, Severity::Warning);
            e.project = Some(project_id.clone());
            e.resource_type = Some(resource_type.as_str().to_string());
            e.resource = Some(name.clone());
            e.error_code = Some(kind.clone());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::FallbackUsed {
            project_id,
            name,
            size_bytes,
        } => {
            let mut e = LogEntry::new(EventType::FallbackUsed, Severity::Info);
            e.project = Some(project_id.clone());
            e.resource_type = Some(ResourceType::Bucket.as_str().to_string());
            e.resource = Some(name.clone());
            e.size_bytes = Some(*size_bytes);
            e
        }
        ActivityEvent::ParseFailed {
            project_id,
            resource_type,
            name,
            message,
        } => {
            let mut e = LogEntry::new(EventType::ParseFailed, Severity::Warning);
            e.project = Some(project_id.clone());
            e.resource_type = Some(resource_type.as_str().to_string());
            e.resource = Some(name.clone());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::EnumerationFailed {
            project_id,
            resource_type,
            reason,
        } => {
            let mut e = LogEntry::new(EventType::EnumerationFailed, Severity::Warning);
            e.project = Some(project_id.clone());
            e.resource_type = Some(resource_type.as_str().to_string());
            e.error_message = Some(reason.clone());
            e
        }
        ActivityEvent::FallbackUnavailable { backend, reason } => {
            let mut e = LogEntry::new(EventType::FallbackUnavailable, Severity::Warning);
            e.resource_type = Some(ResourceType::Bucket.as_str().to_string());
            e.details = Some(backend.clone());
            e.error_message = Some(reason.clone());
            e
        }
        ActivityEvent::AuditCompleted {
            projects,
            total_bytes,
            error_rows,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::AuditComplete, Severity::Info);
            e.count = Some(*projects as u64);
            e.size_bytes = Some(*total_bytes);
            e.errors = Some(*error_rows as u64);
            e.duration_ms = Some(*duration_ms);
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::AuditComplete, Severity::Info),
    }
}
