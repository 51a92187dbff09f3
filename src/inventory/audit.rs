//! One audit pass: setup checks, project selection, per-project scanning and
//! the final summary.
//!
//! Only setup failures (backend unreachable, project listing failed, nothing to
//! scan) and report-write failures abort the run. Everything that goes wrong
//! for a single resource or a single listing ends up in the report and the
//! summary instead.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel as channel;
use parking_lot::Mutex;

use crate::backend::{BackendError, BackendSet};
use crate::core::config::{Config, DisabledApiPolicy};
use crate::core::errors::{AuditError, Result};
use crate::inventory::aggregate::{Accumulator, ProjectAggregator, ProjectTotals};
use crate::inventory::filter::ProjectFilter;
use crate::inventory::pool::{PoolConfig, WorkerPool};
use crate::inventory::probe::{Probe, ResourceProber};
use crate::inventory::record::{ResourceType, ScanTask};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::progress::{ProgressEvent, ProgressHandle};
use crate::report::ReportSink;
use crate::report::summary::{AuditSummary, EnumerationFailure, SkippedType};

/// Scheduling knobs for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditOptions {
    pub pool: PoolConfig,
    pub project_parallelism: usize,
    pub probe_timeout: Duration,
    pub disabled_api_policy: DisabledApiPolicy,
}

impl AuditOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            pool: PoolConfig {
                concurrency_limit: config.audit.concurrency_limit,
                release_batch: config.audit.effective_release_batch(),
            },
            project_parallelism: config.audit.project_parallelism.max(1),
            probe_timeout: Duration::from_secs(config.audit.probe_timeout_secs),
            disabled_api_policy: config.audit.disabled_api_policy,
        }
    }
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What happened while scanning one project.
struct ProjectOutcome {
    totals: ProjectTotals,
    failures: Vec<EnumerationFailure>,
    skipped: Vec<SkippedType>,
}

pub struct Auditor {
    backends: BackendSet,
    probe: Arc<dyn Probe>,
    filter: ProjectFilter,
    options: AuditOptions,
    explicit_projects: Option<Vec<String>>,
    logger: ActivityLoggerHandle,
    progress: Option<ProgressHandle>,
    config_hash: String,
}

impl Auditor {
    /// Auditor probing through the backends' size and metadata services.
    #[must_use]
    pub fn new(backends: BackendSet, options: AuditOptions) -> Self {
        let probe = Arc::new(ResourceProber::new(
            Arc::clone(&backends.primary_size),
            backends.secondary_size.clone(),
            Arc::clone(&backends.metadata),
            options.probe_timeout,
        ));
        Self {
            backends,
            probe,
            filter: ProjectFilter::allow_all(),
            options,
            explicit_projects: None,
            logger: ActivityLoggerHandle::disabled(),
            progress: None,
            config_hash: String::new(),
        }
    }

    /// Auditor configured from the effective config.
    pub fn from_config(config: &Config, backends: BackendSet) -> Result<Self> {
        let mut auditor = Self::new(backends, AuditOptions::from_config(config));
        auditor.filter = ProjectFilter::new(&config.projects.include, &config.projects.exclude)?;
        auditor.config_hash = config.stable_hash()?;
        Ok(auditor)
    }

    /// Replace the probe, e.g. with a test double.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: ProjectFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Scan exactly these projects instead of listing them.
    #[must_use]
    pub fn with_projects(mut self, projects: Vec<String>) -> Self {
        self.explicit_projects = Some(projects);
        self
    }

    #[must_use]
    pub fn with_logger(mut self, logger: ActivityLoggerHandle) -> Self {
        self.logger = logger;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressHandle) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Check the backend and resolve the projects that will be scanned.
    ///
    /// Failures are logged as activity errors before being returned.
    pub fn resolve_projects(&self) -> Result<Vec<String>> {
        self.select_projects().inspect_err(|e| {
            self.logger.send(ActivityEvent::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            });
        })
    }

    fn select_projects(&self) -> Result<Vec<String>> {
        self.backends
            .projects
            .check_available()
            .map_err(|e| AuditError::BackendUnavailable {
                backend: "project listing",
                details: e.to_string(),
            })?;

        let listed = match &self.explicit_projects {
            Some(projects) => projects.clone(),
            None => self
                .backends
                .projects
                .list_projects()
                .map_err(|e| AuditError::Setup {
                    details: format!("cannot list projects: {e}"),
                })?,
        };
        let listed_count = listed.len();
        let selected = self.filter.apply(listed);
        if selected.is_empty() {
            return Err(AuditError::NoProjects {
                details: format!("{listed_count} listed, none selected by the project filter"),
            });
        }
        Ok(selected)
    }

    /// Check the secondary size tool when buckets are scanned. A missing tool
    /// only costs the bucket fallback, so it is logged and reported, not fatal.
    fn check_fallback(&self) -> Option<String> {
        let scans_buckets = self
            .backends
            .enumerators
            .iter()
            .any(|e| e.resource_type() == ResourceType::Bucket);
        let backend = self.backends.secondary_size.as_ref().filter(|_| scans_buckets)?;
        let reason = backend.check_available().err()?.to_string();
        self.logger.send(ActivityEvent::FallbackUnavailable {
            backend: backend.name().to_string(),
            reason: reason.clone(),
        });
        Some(format!("{}: {reason}", backend.name()))
    }

    /// Run the audit, streaming one row per resource into `sink`.
    pub fn run(&self, sink: &dyn ReportSink) -> Result<AuditSummary> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let projects = self.resolve_projects()?;

        self.logger.send(ActivityEvent::AuditStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash: self.config_hash.clone(),
            projects: projects.len(),
        });
        self.notify(ProgressEvent::AuditStarted {
            projects: projects.len(),
        });
        let fallback_unavailable = self.check_fallback();

        let accumulator = Accumulator::new();
        let outcomes = self.scan_projects(&projects, sink, &accumulator)?;
        sink.flush()?;

        let grand_totals = accumulator.snapshot();
        let elapsed_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        let mut project_totals = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        let mut skipped = Vec::new();
        for outcome in outcomes {
            project_totals.push(outcome.totals);
            failures.extend(outcome.failures);
            skipped.extend(outcome.skipped);
        }

        let mut summary = AuditSummary::new(started_at, elapsed_ms, grand_totals, project_totals);
        summary.enumeration_failures = failures;
        summary.skipped_disabled = skipped;
        summary.fallback_unavailable = fallback_unavailable;

        self.logger.send(ActivityEvent::AuditCompleted {
            projects: projects.len(),
            total_bytes: summary.grand_totals.total_bytes(),
            error_rows: usize::try_from(summary.error_rows).unwrap_or(usize::MAX),
            duration_ms: elapsed_ms,
        });
        Ok(summary)
    }

    /// Scan projects with up to `project_parallelism` at once.
    fn scan_projects(
        &self,
        projects: &[String],
        sink: &dyn ReportSink,
        accumulator: &Accumulator,
    ) -> Result<Vec<ProjectOutcome>> {
        let (work_tx, work_rx) = channel::unbounded::<&str>();
        for project in projects {
            let _ = work_tx.send(project.as_str());
        }
        drop(work_tx);

        let outcomes = Mutex::new(Vec::with_capacity(projects.len()));
        let first_error: Mutex<Option<AuditError>> = Mutex::new(None);
        let abort = AtomicBool::new(false);
        let workers = self.options.project_parallelism.min(projects.len()).max(1);

        thread::scope(|scope| {
            for worker_id in 0..workers {
                let work_rx = work_rx.clone();
                let (outcomes, first_error, abort) = (&outcomes, &first_error, &abort);
                let spawned = thread::Builder::new()
                    .name(format!("csa-project-{worker_id}"))
                    .spawn_scoped(scope, move || {
                        for project_id in &work_rx {
                            if abort.load(Ordering::Acquire) {
                                return;
                            }
                            match self.scan_project(project_id, sink, accumulator) {
                                Ok(outcome) => outcomes.lock().push(outcome),
                                Err(e) => {
                                    abort.store(true, Ordering::Release);
                                    first_error.lock().get_or_insert(e);
                                    return;
                                }
                            }
                        }
                    });
                if let Err(e) = spawned {
                    first_error.lock().get_or_insert(AuditError::Runtime {
                        details: format!("failed to spawn project worker: {e}"),
                    });
                }
            }
        });

        if let Some(e) = first_error.into_inner() {
            self.logger.send(ActivityEvent::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            });
            return Err(e);
        }
        Ok(outcomes.into_inner())
    }

    fn scan_project(
        &self,
        project_id: &str,
        sink: &dyn ReportSink,
        accumulator: &Accumulator,
    ) -> Result<ProjectOutcome> {
        let clock = Instant::now();
        let mut failures = Vec::new();
        let mut skipped = Vec::new();
        let mut tasks = Vec::new();

        for enumerator in &self.backends.enumerators {
            let resource_type = enumerator.resource_type();
            match enumerator.list_resources(project_id) {
                Ok(resources) => {
                    for resource in resources {
                        tasks.push(ScanTask {
                            project_id: project_id.to_string(),
                            resource_type,
                            resource,
                            sequence_index: tasks.len(),
                        });
                    }
                }
                Err(BackendError::ApiDisabled(_))
                    if self.options.disabled_api_policy == DisabledApiPolicy::Zero =>
                {
                    skipped.push(SkippedType {
                        project_id: project_id.to_string(),
                        resource_type,
                    });
                }
                Err(e) => {
                    self.record_enumeration_failure(project_id, resource_type, &e, &mut failures);
                }
            }
        }

        self.logger.send(ActivityEvent::ProjectStarted {
            project_id: project_id.to_string(),
            resources: tasks.len(),
        });
        self.notify(ProgressEvent::ProjectStarted {
            project_id: project_id.to_string(),
            resources: tasks.len(),
        });

        let mut pool = WorkerPool::new(self.options.pool);
        if let Some(progress) = &self.progress {
            pool = pool.with_progress(progress.clone());
        }
        let outcome = pool.run(self.probe.as_ref(), tasks);

        let mut aggregator = ProjectAggregator::new(project_id, sink);
        for record in &outcome.records {
            if let Some(event) = ActivityEvent::for_record(record) {
                self.logger.send(event);
            }
            aggregator.observe(record)?;
        }
        let totals = aggregator.finish();
        accumulator.accumulate(&totals);

        self.logger.send(ActivityEvent::ProjectCompleted {
            project_id: project_id.to_string(),
            total_bytes: totals.total_bytes(),
            resources: outcome.records.len(),
            errors: usize::try_from(totals.error_count()).unwrap_or(usize::MAX),
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
        });
        self.notify(ProgressEvent::ProjectFinished {
            project_id: project_id.to_string(),
        });

        Ok(ProjectOutcome {
            totals,
            failures,
            skipped,
        })
    }

    fn record_enumeration_failure(
        &self,
        project_id: &str,
        resource_type: ResourceType,
        error: &BackendError,
        failures: &mut Vec<EnumerationFailure>,
    ) {
        self.logger.send(ActivityEvent::EnumerationFailed {
            project_id: project_id.to_string(),
            resource_type,
            reason: error.to_string(),
        });
        failures.push(EnumerationFailure {
            project_id: project_id.to_string(),
            resource_type,
            class: error.label().to_string(),
            reason: error.message().to_string(),
        });
    }

    fn notify(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress.notify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fixture::FixtureInventory;
    use crate::inventory::record::{ResourceRecord, ResourceStatus, SizeSource};
    use crate::report::MemorySink;
    use serde_json::json;

    fn inventory(value: serde_json::Value) -> BackendSet {
        serde_json::from_value::<FixtureInventory>(value)
            .unwrap()
            .backend_set()
    }

    fn options() -> AuditOptions {
        AuditOptions {
            pool: PoolConfig::with_limit(4),
            project_parallelism: 2,
            probe_timeout: Duration::from_secs(5),
            disabled_api_policy: DisabledApiPolicy::Zero,
        }
    }

    #[test]
    fn unreachable_backend_is_setup_failure() {
        let auditor = Auditor::new(inventory(json!({"unreachable": true})), options());
        let err = auditor.run(&MemorySink::new()).unwrap_err();
        assert!(matches!(err, AuditError::BackendUnavailable { .. }));
        assert!(err.is_setup_failure());
    }

    #[test]
    fn failed_project_listing_is_setup_failure() {
        let auditor = Auditor::new(
            inventory(json!({"project_listing_error": "auth expired"})),
            options(),
        );
        let err = auditor.run(&MemorySink::new()).unwrap_err();
        assert!(matches!(err, AuditError::Setup { .. }));
    }

    #[test]
    fn no_selected_projects_is_setup_failure() {
        let backends = inventory(json!({"projects": [{"id": "dev-1"}]}));
        let filter = ProjectFilter::new(&["prod-*".to_string()], &[]).unwrap();
        let err = Auditor::new(backends, options())
            .with_filter(filter)
            .run(&MemorySink::new())
            .unwrap_err();
        assert!(matches!(err, AuditError::NoProjects { .. }));
    }

    #[test]
    fn disabled_api_is_skipped_or_failed_by_policy() {
        let doc = json!({"projects": [{"id": "p1", "disabled": ["file_share"], "denied": ["disk"]}]});

        let summary = Auditor::new(inventory(doc.clone()), options())
            .run(&MemorySink::new())
            .unwrap();
        assert_eq!(summary.skipped_disabled.len(), 1);
        assert_eq!(summary.enumeration_failures.len(), 1);
        assert_eq!(summary.enumeration_failures[0].class, "access_denied");

        let mut strict = options();
        strict.disabled_api_policy = DisabledApiPolicy::Error;
        let summary = Auditor::new(inventory(doc), strict)
            .run(&MemorySink::new())
            .unwrap();
        assert!(summary.skipped_disabled.is_empty());
        assert_eq!(summary.enumeration_failures.len(), 2);
    }

    #[test]
    fn explicit_projects_bypass_listing() {
        let backends = inventory(json!({
            "project_listing_error": "listing not allowed",
            "projects": [{"id": "p1", "buckets": [{"name": "b", "primary": "7"}]}]
        }));
        let sink = MemorySink::new();
        let summary = Auditor::new(backends, options())
            .with_projects(vec!["p1".to_string()])
            .run(&sink)
            .unwrap();
        assert_eq!(summary.grand_totals.get(ResourceType::Bucket).total_bytes, 7);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn injected_probe_sees_per_project_sequence() {
        let backends = inventory(json!({"projects": [
            {"id": "p1", "buckets": [{"name": "a"}, {"name": "b"}], "disks": [{"name": "d"}]}
        ]}));
        let probe = Arc::new(|task: &ScanTask| {
            let mut r = ResourceRecord::for_task(task);
            r.set_size(task.sequence_index as u64 + 1, SizeSource::Primary);
            r
        });
        let sink = MemorySink::new();
        let summary = Auditor::new(backends, options())
            .with_probe(probe)
            .run(&sink)
            .unwrap();
        let sizes: Vec<u64> = sink.records().iter().map(|r| r.size_bytes).collect();
        assert_eq!(sizes, vec![1, 2, 3]);
        assert_eq!(summary.rows, 3);
        assert!(sink.records().iter().all(|r| r.status == ResourceStatus::Success));
    }

    #[test]
    fn missing_fallback_tool_is_reported_not_fatal() {
        let doc = json!({
            "secondary_unreachable": true,
            "projects": [{"id": "p1", "buckets": [{"name": "b", "primary": "7"}]}]
        });
        let summary = Auditor::new(inventory(doc), options())
            .run(&MemorySink::new())
            .unwrap();
        assert_eq!(summary.grand_totals.get(ResourceType::Bucket).total_bytes, 7);
        let reason = summary.fallback_unavailable.unwrap();
        assert!(reason.contains("fixture-secondary"));
        assert!(reason.contains("unreachable"));
    }

    #[test]
    fn fallback_tool_is_not_checked_without_buckets() {
        let backends = inventory(json!({
            "secondary_unreachable": true,
            "projects": [{"id": "p1", "disks": [{"name": "d", "metadata": {"sizeGb": "1"}}]}]
        }))
        .restricted_to(&[ResourceType::Disk]);
        let summary = Auditor::new(backends, options())
            .run(&MemorySink::new())
            .unwrap();
        assert!(summary.fallback_unavailable.is_none());
    }
}
