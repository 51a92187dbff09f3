//! Bounded worker pool that runs one probe per scan task.
//!
//! Guarantees:
//! - never more than `concurrency_limit` probes execute at once;
//! - once the ceiling is reached, no new probe starts until `release_batch`
//!   slots have drained, so admissions happen in bursts;
//! - every submitted task yields exactly one record, returned in submission
//!   order; a probe that panics or a worker that never ran its task yields an
//!   `Error` record with [`IssueKind::WorkerLost`].

#![allow(missing_docs)]

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam_channel as channel;
use parking_lot::{Condvar, Mutex};

use crate::inventory::probe::Probe;
use crate::inventory::record::{IssueKind, ProbeIssue, ResourceRecord, ScanTask};
use crate::progress::{ProgressEvent, ProgressHandle};

/// Sizing of one pool run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub concurrency_limit: usize,
    pub release_batch: usize,
}

impl PoolConfig {
    /// Ceiling with the default batch of half the ceiling (at least one).
    #[must_use]
    pub fn with_limit(concurrency_limit: usize) -> Self {
        let concurrency_limit = concurrency_limit.max(1);
        Self {
            concurrency_limit,
            release_batch: (concurrency_limit / 2).max(1),
        }
    }
}

/// Counters observed during one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub peak_in_flight: usize,
    /// Times the ceiling was hit and admissions paused for a drain.
    pub drain_cycles: usize,
    pub worker_panics: usize,
    /// Tasks that never produced a record and were synthesized as lost.
    pub lost_tasks: usize,
}

/// Records in submission order plus run counters.
#[derive(Debug)]
pub struct PoolOutcome {
    pub records: Vec<ResourceRecord>,
    pub stats: PoolStats,
}

pub struct WorkerPool {
    config: PoolConfig,
    progress: Option<ProgressHandle>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let concurrency_limit = config.concurrency_limit.max(1);
        Self {
            config: PoolConfig {
                concurrency_limit,
                release_batch: config.release_batch.clamp(1, concurrency_limit),
            },
            progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressHandle) -> Self {
        self.progress = Some(progress);
        self
    }

    #[must_use]
    pub const fn config(&self) -> PoolConfig {
        self.config
    }

    /// Probe every task and block until all have a record.
    pub fn run<P>(&self, probe: &P, tasks: Vec<ScanTask>) -> PoolOutcome
    where
        P: Probe + ?Sized,
    {
        if tasks.is_empty() {
            return PoolOutcome {
                records: Vec::new(),
                stats: PoolStats::default(),
            };
        }

        let workers = self.config.concurrency_limit.min(tasks.len());
        let gate = AdmissionGate::new(self.config.concurrency_limit, self.config.release_batch);

        let (work_tx, work_rx) = channel::unbounded::<(usize, ScanTask)>();
        let (result_tx, result_rx) = channel::unbounded::<(usize, ResourceRecord, bool)>();
        for (slot, task) in tasks.iter().enumerate() {
            // Receiver is alive until the scope below ends.
            let _ = work_tx.send((slot, task.clone()));
        }
        drop(work_tx);

        thread::scope(|scope| {
            for worker_id in 0..workers {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                let gate = &gate;
                let progress = self.progress.as_ref();
                let spawned = thread::Builder::new()
                    .name(format!("csa-probe-{worker_id}"))
                    .spawn_scoped(scope, move || {
                        worker_loop(probe, &work_rx, &result_tx, gate, progress);
                    });
                if let Err(e) = spawned {
                    eprintln!("[CSA-POOL] failed to spawn worker {worker_id}: {e}");
                }
            }
        });
        drop(result_tx);

        let mut slots: Vec<Option<ResourceRecord>> = vec![None; tasks.len()];
        let mut stats = PoolStats::default();
        for (slot, record, panicked) in result_rx.try_iter() {
            if panicked {
                stats.worker_panics += 1;
            }
            if let Some(entry) = slots.get_mut(slot)
                && entry.is_none()
            {
                *entry = Some(record);
            }
        }

        let records = tasks
            .iter()
            .zip(slots)
            .map(|(task, record)| {
                record.unwrap_or_else(|| {
                    stats.lost_tasks += 1;
                    ResourceRecord::failed(
                        task,
                        ProbeIssue::new(IssueKind::WorkerLost, "no result returned for task"),
                    )
                })
            })
            .collect();

        let gate_state = gate.state.lock();
        stats.peak_in_flight = gate_state.peak_in_flight;
        stats.drain_cycles = gate_state.drain_cycles;
        drop(gate_state);

        PoolOutcome { records, stats }
    }
}

fn worker_loop<P>(
    probe: &P,
    work_rx: &channel::Receiver<(usize, ScanTask)>,
    result_tx: &channel::Sender<(usize, ResourceRecord, bool)>,
    gate: &AdmissionGate,
    progress: Option<&ProgressHandle>,
) where
    P: Probe + ?Sized,
{
    for (slot, task) in work_rx {
        let permit = gate.acquire();
        let (record, panicked) = probe_isolated(probe, &task);
        drop(permit);

        if let Some(progress) = progress {
            progress.notify(ProgressEvent::ResourceDone {
                project_id: record.project_id.clone(),
                status: record.status,
            });
        }
        if result_tx.send((slot, record, panicked)).is_err() {
            return;
        }
    }
}

/// Run the probe, converting a panic into an `Error` record.
fn probe_isolated<P>(probe: &P, task: &ScanTask) -> (ResourceRecord, bool)
where
    P: Probe + ?Sized,
{
    match panic::catch_unwind(AssertUnwindSafe(|| probe.probe(task))) {
        Ok(mut record) => {
            record.sequence_index = task.sequence_index;
            (record, false)
        }
        Err(payload) => {
            let issue = ProbeIssue::new(
                IssueKind::WorkerLost,
                format!("probe panicked: {}", panic_message(payload.as_ref())),
            );
            (ResourceRecord::failed(task, issue), true)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Counting semaphore with batch release.
///
/// Filling the last slot switches the gate to draining; while draining nobody
/// is admitted until in-flight work falls to `limit - batch`.
struct AdmissionGate {
    limit: usize,
    resume_at: usize,
    state: Mutex<GateState>,
    cv: Condvar,
}

#[derive(Default)]
struct GateState {
    in_flight: usize,
    draining: bool,
    peak_in_flight: usize,
    drain_cycles: usize,
}

struct Permit<'a> {
    gate: &'a AdmissionGate,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

impl AdmissionGate {
    fn new(limit: usize, batch: usize) -> Self {
        let limit = limit.max(1);
        let batch = batch.clamp(1, limit);
        Self {
            limit,
            resume_at: limit - batch,
            state: Mutex::new(GateState::default()),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self) -> Permit<'_> {
        let mut state = self.state.lock();
        while state.draining || state.in_flight >= self.limit {
            self.cv.wait(&mut state);
        }
        state.in_flight += 1;
        state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
        if state.in_flight == self.limit {
            state.draining = true;
            state.drain_cycles += 1;
        }
        Permit { gate: self }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.draining {
            if state.in_flight <= self.resume_at {
                state.draining = false;
                self.cv.notify_all();
            }
        } else {
            self.cv.notify_one();
        }
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }
}
