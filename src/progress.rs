//! Live progress line on stderr.
//!
//! Producers push [`ProgressEvent`]s through a bounded channel with
//! `try_send`; a full channel drops the event. The reporter thread exits once
//! every [`ProgressHandle`] is dropped, so no stop flag is needed.

#![allow(missing_docs)]

use std::io::{self, Write};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{self as channel, Receiver, Sender};

use crate::inventory::record::ResourceStatus;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    AuditStarted { projects: usize },
    ProjectStarted { project_id: String, resources: usize },
    ResourceDone { project_id: String, status: ResourceStatus },
    ProjectFinished { project_id: String },
}

/// Cheap, cloneable sender side.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    tx: Sender<ProgressEvent>,
}

impl ProgressHandle {
    /// Best-effort send; never blocks.
    pub fn notify(&self, event: ProgressEvent) {
        let _ = self.tx.try_send(event);
    }

    /// Handle whose events go nowhere, for runs without a progress line.
    #[must_use]
    pub fn detached() -> Self {
        let (tx, _rx) = channel::bounded(1);
        Self { tx }
    }
}

/// Aggregate view rendered by the reporter.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProgressState {
    pub projects_total: usize,
    pub projects_done: usize,
    pub resources_total: usize,
    pub resources_done: usize,
    pub errors: usize,
    pub current_project: Option<String>,
}

impl ProgressState {
    pub fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::AuditStarted { projects } => self.projects_total = *projects,
            ProgressEvent::ProjectStarted {
                project_id,
                resources,
            } => {
                self.resources_total += resources;
                self.current_project = Some(project_id.clone());
            }
            ProgressEvent::ResourceDone { status, .. } => {
                self.resources_done += 1;
                if *status == ResourceStatus::Error {
                    self.errors += 1;
                }
            }
            ProgressEvent::ProjectFinished { .. } => self.projects_done += 1,
        }
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut line = format!(
            "[csa] projects {}/{} | resources {}/{}",
            self.projects_done, self.projects_total, self.resources_done, self.resources_total
        );
        if self.errors > 0 {
            line.push_str(&format!(" | {} errors", self.errors));
        }
        if let Some(project) = &self.current_project {
            line.push_str(&format!(" | {project}"));
        }
        line
    }
}

/// Start the reporter thread. Drop every handle, then join, to finish the line.
pub fn spawn_reporter() -> io::Result<(ProgressHandle, JoinHandle<ProgressState>)> {
    let (tx, rx) = channel::bounded(CHANNEL_CAPACITY);
    let join = thread::Builder::new()
        .name("csa-progress".to_string())
        .spawn(move || report_loop(&rx))?;
    Ok((ProgressHandle { tx }, join))
}

fn report_loop(rx: &Receiver<ProgressEvent>) -> ProgressState {
    let mut state = ProgressState::default();
    let stderr = io::stderr();
    for event in rx {
        state.apply(&event);
        let mut out = stderr.lock();
        let _ = write!(out, "\r\x1b[2K{}", state.render());
        let _ = out.flush();
    }
    let _ = writeln!(stderr.lock());
    state
}
