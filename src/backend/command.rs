//! Deadline-bounded execution of external CLI tools.
//!
//! The child is polled until it exits or the deadline passes; on timeout it is
//! killed and reaped so a hung vendor tool never leaks past its probe. Output
//! pipes are drained on helper threads to keep a chatty child from blocking on
//! a full pipe.

#![allow(missing_docs)]

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::backend::{BackendError, BackendResult};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs one binary with a per-call deadline.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    binary: PathBuf,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run and require exit status 0; stderr is classified on failure.
    pub fn run_checked(&self, args: &[&str]) -> BackendResult<String> {
        self.run_checked_until(args, Instant::now() + self.timeout)
    }

    /// [`Self::run_checked`] bounded by the earlier of the runner's own timeout
    /// and `deadline`.
    pub fn run_checked_until(&self, args: &[&str], deadline: Instant) -> BackendResult<String> {
        let output = self.run_until(args, deadline)?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(classify_failure(
                &format!("{} {}", self.binary.display(), args.join(" ")),
                &output,
            ))
        }
    }

    /// Run to completion or deadline, returning whatever the child printed.
    pub fn run(&self, args: &[&str]) -> BackendResult<CommandOutput> {
        self.run_until(args, Instant::now() + self.timeout)
    }

    /// Run until the child exits, the runner's timeout elapses or `deadline`
    /// passes, whichever comes first. The child is killed and reaped on expiry.
    pub fn run_until(&self, args: &[&str], deadline: Instant) -> BackendResult<CommandOutput> {
        let started = Instant::now();
        let deadline = deadline.min(started + self.timeout);
        let expired = || {
            BackendError::Timeout(format!(
                "{} {} exceeded {:.1}s",
                self.binary.display(),
                args.join(" "),
                deadline.saturating_duration_since(started).as_secs_f64()
            ))
        };
        if started >= deadline {
            return Err(expired());
        }

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BackendError::Transport(format!("failed to spawn {}: {e}", self.binary.display()))
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let exit_code = wait_with_deadline(&mut child, deadline).map_err(|e| match e {
            WaitError::Timeout => expired(),
            WaitError::Io(e) => BackendError::Transport(format!(
                "waiting on {} failed: {e}",
                self.binary.display()
            )),
        })?;

        Ok(CommandOutput {
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
            exit_code,
        })
    }
}

enum WaitError {
    Timeout,
    Io(std::io::Error),
}

fn wait_with_deadline(child: &mut Child, deadline: Instant) -> Result<Option<i32>, WaitError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status.code()),
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(WaitError::Timeout);
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                let _ = child.kill();
                return Err(WaitError::Io(e));
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Map a failed command to a backend error class by inspecting stderr.
#[must_use]
pub fn classify_failure(command: &str, output: &CommandOutput) -> BackendError {
    let stderr = output.stderr.trim();
    let lower = stderr.to_ascii_lowercase();
    let message = format!(
        "{command} failed (exit {}): {}",
        output.exit_code.unwrap_or(-1),
        first_line(stderr)
    );

    if lower.contains("has not been used")
        || lower.contains("is disabled")
        || lower.contains("service_disabled")
        || lower.contains("api not enabled")
    {
        BackendError::ApiDisabled(message)
    } else if lower.contains("permission_denied")
        || lower.contains("permission denied")
        || lower.contains("does not have")
        || lower.contains("403")
    {
        BackendError::AccessDenied(message)
    } else {
        BackendError::Transport(message)
    }
}

fn first_line(text: &str) -> &str {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stderr: &str, exit_code: i32) -> CommandOutput {
        CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: Some(exit_code),
        }
    }

    #[test]
    fn disabled_api_is_classified() {
        let err = classify_failure(
            "gcloud filestore instances list",
            &output(
                "ERROR: Cloud Filestore API has not been used in project 123 before or it is disabled.",
                1,
            ),
        );
        assert!(matches!(err, BackendError::ApiDisabled(_)));
    }

    #[test]
    fn permission_denied_is_classified() {
        let err = classify_failure(
            "gcloud compute disks list",
            &output("ERROR: (gcloud) PERMISSION_DENIED: caller lacks compute.disks.list", 1),
        );
        assert!(matches!(err, BackendError::AccessDenied(_)));
    }

    #[test]
    fn other_failures_are_transport() {
        let err = classify_failure("gsutil du", &output("connection reset by peer\nretrying", 2));
        match err {
            BackendError::Transport(msg) => {
                assert!(msg.contains("exit 2"));
                assert!(msg.contains("connection reset by peer"));
                assert!(!msg.contains("retrying"));
            }
            other => panic!("unexpected class: {other}"),
        }
    }

    #[test]
    fn missing_binary_is_transport() {
        let runner = CommandRunner::new("/nonexistent/csa-test-binary", Duration::from_secs(1));
        let err = runner.run(&["--version"]).unwrap_err();
        assert!(matches!(err, BackendError::Transport(_)));
    }

    #[cfg(unix)]
    #[test]
    fn captures_stdout_of_successful_command() {
        let runner = CommandRunner::new("sh", Duration::from_secs(5));
        let out = runner.run_checked(&["-c", "echo 12345"]).unwrap();
        assert_eq!(out.trim(), "12345");
    }

    #[cfg(unix)]
    #[test]
    fn hung_command_is_killed_at_deadline() {
        let runner = CommandRunner::new("sh", Duration::from_millis(200));
        let start = Instant::now();
        let err = runner.run(&["-c", "sleep 5"]).unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn caller_deadline_cuts_a_longer_runner_timeout() {
        let runner = CommandRunner::new("sh", Duration::from_secs(30));
        let start = Instant::now();
        let err = runner
            .run_until(&["-c", "sleep 5"], start + Duration::from_millis(150))
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn expired_deadline_never_spawns() {
        let runner = CommandRunner::new("/nonexistent/csa-test-binary", Duration::from_secs(1));
        let err = runner
            .run_checked_until(&["--version"], Instant::now())
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
    }
}
