//! Resource probe: size plus metadata for one resource, never blocking past
//! its deadline.
//!
//! Every backend call runs on its own scoped thread, receives the probe
//! deadline and is awaited until that deadline; an unanswered call is reported
//! as a timeout. A probe returns only after all of its calls have returned, so
//! the caller's concurrency slot covers every backend call in flight. Buckets are measured by two independent strategies at once and
//! reconciled: a positive primary count wins, else a positive secondary count
//! (flagged as fallback), else zero. Disks and file shares take their size from
//! the describe document.

#![allow(missing_docs)]

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use serde_json::Value;

use crate::backend::{BackendError, BackendResult, MetadataBackend, SizeBackend};
use crate::inventory::metadata::{FieldSchema, apply_metadata, size_from_metadata};
use crate::inventory::parse::parse_size;
use crate::inventory::record::{
    IssueKind, ProbeIssue, ResourceRecord, ResourceType, ScanTask, SizeSource,
};

/// Anything that turns a scan task into exactly one record.
///
/// Implementations must not panic for ordinary failures and must return within
/// a bounded time; failures become `Error` records.
pub trait Probe: Send + Sync {
    fn probe(&self, task: &ScanTask) -> ResourceRecord;
}

impl<F> Probe for F
where
    F: Fn(&ScanTask) -> ResourceRecord + Send + Sync,
{
    fn probe(&self, task: &ScanTask) -> ResourceRecord {
        self(task)
    }
}

/// Longest excerpt of unparseable output kept in a parse issue.
const OUTPUT_EXCERPT_CHARS: usize = 80;

/// Probe backed by the size and metadata backends.
pub struct ResourceProber {
    primary: Arc<dyn SizeBackend>,
    secondary: Option<Arc<dyn SizeBackend>>,
    metadata: Arc<dyn MetadataBackend>,
    attempt_timeout: Duration,
}

impl ResourceProber {
    pub fn new(
        primary: Arc<dyn SizeBackend>,
        secondary: Option<Arc<dyn SizeBackend>>,
        metadata: Arc<dyn MetadataBackend>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            primary,
            secondary,
            metadata,
            attempt_timeout,
        }
    }

    fn probe_bucket(&self, task: &ScanTask) -> ResourceRecord {
        let deadline = Instant::now() + self.attempt_timeout;

        let (primary, secondary, metadata) = thread::scope(|scope| {
            let primary = spawn_attempt(scope, || measure(&self.primary, task, deadline));
            let secondary = self.secondary.as_ref().map(|backend| {
                spawn_attempt(scope, move || measure(backend, task, deadline))
            });
            let metadata = spawn_attempt(scope, || describe(&self.metadata, task, deadline));

            (
                await_attempt(&primary, deadline, self.attempt_timeout),
                secondary.map(|rx| await_attempt(&rx, deadline, self.attempt_timeout)),
                await_attempt(&metadata, deadline, self.attempt_timeout),
            )
        });

        let mut record = ResourceRecord::for_task(task);
        if let Ok(doc) = &metadata {
            apply_metadata(&mut record, doc);
        }

        reconcile_bucket_size(&mut record, &primary, secondary.as_ref());
        record
    }

    fn probe_provisioned(&self, task: &ScanTask) -> ResourceRecord {
        let deadline = Instant::now() + self.attempt_timeout;
        let metadata = thread::scope(|scope| {
            let rx = spawn_attempt(scope, || describe(&self.metadata, task, deadline));
            await_attempt(&rx, deadline, self.attempt_timeout)
        });

        match metadata {
            Ok(doc) => {
                let mut record = ResourceRecord::for_task(task);
                apply_metadata(&mut record, &doc);
                match size_from_metadata(&doc, FieldSchema::for_type(task.resource_type)) {
                    Some(bytes) => record.set_size(bytes, SizeSource::Metadata),
                    None => {
                        record.set_size(0, SizeSource::None);
                        record.issue = Some(ProbeIssue::new(
                            IssueKind::Parse,
                            "describe document has no size field",
                        ));
                    }
                }
                record
            }
            Err(issue) => ResourceRecord::failed(task, issue),
        }
    }
}

impl Probe for ResourceProber {
    fn probe(&self, task: &ScanTask) -> ResourceRecord {
        match task.resource_type {
            ResourceType::Bucket => self.probe_bucket(task),
            ResourceType::Disk | ResourceType::FileShare => self.probe_provisioned(task),
        }
    }
}

/// Apply the dual-strategy policy to a bucket record.
///
/// Preference order: positive primary, positive secondary (fallback), zero.
/// The record is `Error` only when no strategy's call succeeded at all; a call
/// that succeeded with unusable output leaves `EmptyOrZero` plus a parse issue.
pub fn reconcile_bucket_size(
    record: &mut ResourceRecord,
    primary: &Result<String, ProbeIssue>,
    secondary: Option<&Result<String, ProbeIssue>>,
) {
    let primary_bytes = primary.as_ref().ok().and_then(|raw| parse_size(raw));
    let secondary_bytes = secondary
        .and_then(|s| s.as_ref().ok())
        .and_then(|raw| parse_size(raw));

    if let Some(bytes) = primary_bytes.filter(|&b| b > 0) {
        record.set_size(bytes, SizeSource::Primary);
        return;
    }
    if let Some(bytes) = secondary_bytes.filter(|&b| b > 0) {
        record.set_size(bytes, SizeSource::Fallback);
        return;
    }

    let any_call_succeeded = primary.is_ok() || secondary.is_some_and(|s| s.is_ok());
    if !any_call_succeeded {
        if let Err(p) = primary {
            let issue = match secondary {
                Some(Err(s)) => ProbeIssue::new(
                    p.kind,
                    format!("{}; secondary: {}", p.message, s.message),
                ),
                _ => p.clone(),
            };
            record.mark_failed(issue);
        }
        return;
    }

    record.set_size(0, SizeSource::None);
    let confirmed_zero = primary_bytes == Some(0) || secondary_bytes == Some(0);
    if !confirmed_zero {
        let raw = primary
            .as_ref()
            .ok()
            .or_else(|| secondary.and_then(|s| s.as_ref().ok()))
            .map(String::as_str)
            .unwrap_or_default();
        record.issue = Some(ProbeIssue::new(
            IssueKind::Parse,
            format!("no byte count in output {:?}", excerpt(raw)),
        ));
    }
}

fn excerpt(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= OUTPUT_EXCERPT_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(OUTPUT_EXCERPT_CHARS).collect();
        format!("{cut}...")
    }
}

type Attempt<T> = channel::Receiver<BackendResult<T>>;

fn measure(
    backend: &Arc<dyn SizeBackend>,
    task: &ScanTask,
    deadline: Instant,
) -> BackendResult<String> {
    backend.measure(&task.project_id, task.resource_type, &task.resource, deadline)
}

fn describe(
    backend: &Arc<dyn MetadataBackend>,
    task: &ScanTask,
    deadline: Instant,
) -> BackendResult<Value> {
    backend.describe(&task.project_id, task.resource_type, &task.resource, deadline)
}

/// Run one backend call on a thread of `scope`; the result arrives on the
/// channel and the scope joins the thread before the probe returns.
fn spawn_attempt<'scope, 'env, T, F>(
    scope: &'scope thread::Scope<'scope, 'env>,
    call: F,
) -> Attempt<T>
where
    T: Send + 'scope,
    F: FnOnce() -> BackendResult<T> + Send + 'scope,
{
    let (tx, rx) = channel::bounded(1);
    let spawned = thread::Builder::new()
        .name("csa-probe-attempt".to_string())
        .spawn_scoped(scope, move || {
            let result = panic::catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|_| {
                Err(BackendError::Transport("backend call panicked".to_string()))
            });
            // Receiver may be gone after a timeout.
            let _ = tx.send(result);
        });
    if let Err(e) = spawned {
        let (tx, rx) = channel::bounded(1);
        let _ = tx.send(Err(BackendError::Transport(format!(
            "failed to spawn probe thread: {e}"
        ))));
        return rx;
    }
    rx
}

/// Wait for an attempt until the shared deadline.
fn await_attempt<T>(
    rx: &Attempt<T>,
    deadline: Instant,
    timeout: Duration,
) -> Result<T, ProbeIssue> {
    match rx.recv_deadline(deadline) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(BackendError::Timeout(message))) => Err(ProbeIssue::new(IssueKind::Timeout, message)),
        Ok(Err(other)) => Err(ProbeIssue::new(IssueKind::Transport, other.to_string())),
        Err(channel::RecvTimeoutError::Timeout) => Err(ProbeIssue::new(
            IssueKind::Timeout,
            format!("no answer within {}s", timeout.as_secs_f64()),
        )),
        Err(channel::RecvTimeoutError::Disconnected) => Err(ProbeIssue::new(
            IssueKind::Transport,
            "backend call aborted before answering",
        )),
    }
}
