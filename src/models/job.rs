//! Outcome of one worker run.

use std::{process::ExitStatus, time::Duration};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failure,
}

/// Why a worker run was classified as a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobErrorKind {
    /// The worker did not exit before the deadline and was killed.
    Timeout,
    /// The worker exited with a non-zero status or was terminated by a signal.
    WorkerError,
}

/// The classified result of running the worker against one artifact.
///
/// `stderr` is kept for server-side diagnostics and must never be copied into
/// a client response.
#[derive(Clone, Debug)]
pub struct JobResult {
    pub outcome: JobOutcome,
    pub raw_output: String,
    pub error_kind: Option<JobErrorKind>,
    pub stderr: String,
    pub exit_status: Option<ExitStatus>,
    pub elapsed: Duration,
}

impl JobResult {
    pub fn success(stdout: &str, stderr: String, status: ExitStatus, elapsed: Duration) -> Self {
        Self {
            outcome: JobOutcome::Success,
            raw_output: stdout.trim_end().to_string(),
            error_kind: None,
            stderr,
            exit_status: Some(status),
            elapsed,
        }
    }

    pub fn failed(
        kind: JobErrorKind,
        stdout: String,
        stderr: String,
        status: Option<ExitStatus>,
        elapsed: Duration,
    ) -> Self {
        Self {
            outcome: JobOutcome::Failure,
            raw_output: stdout,
            error_kind: Some(kind),
            stderr,
            exit_status: status,
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == JobOutcome::Success
    }
}
