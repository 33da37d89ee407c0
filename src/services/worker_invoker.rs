//! WorkerInvoker: runs the external image-analysis process for one artifact.
//!
//! The worker is any executable that takes the artifact path as its last
//! positional argument, prints its result on stdout and signals success with
//! exit code 0. The invoker bounds each run with a wall-clock timeout measured
//! from spawn and always reaps the child: on normal exit, on timeout (kill +
//! wait), and when the calling future is dropped (`kill_on_drop`).
//!
//! On unix the worker leads its own process group. Whatever it leaves behind
//! is killed with the group once the child exits or the deadline passes, so
//! a stray background process can neither hold stdout open nor outlive the
//! run.

use crate::models::job::{JobErrorKind, JobResult};
use std::{
    io,
    path::Path,
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::Semaphore,
    task::JoinHandle,
    time::timeout_at,
};
use tracing::{debug, warn};

/// Default per-run deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(120_000);

/// The worker process could not be started at all.
#[derive(Debug, Error)]
#[error("failed to spawn worker `{program}`: {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: io::Error,
}

#[derive(Clone, Debug)]
pub struct WorkerInvoker {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    permits: Option<Arc<Semaphore>>,
}

impl WorkerInvoker {
    /// `args` are passed before the artifact path on every run.
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            permits: None,
        }
    }

    /// Admit at most `limit` concurrent runs; further callers wait for a slot.
    ///
    /// The timeout starts only once a run is admitted and spawned.
    pub fn with_max_concurrent(mut self, limit: usize) -> Self {
        self.permits = Some(Arc::new(Semaphore::new(limit.max(1))));
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the worker against `artifact_path` and classify the outcome.
    ///
    /// Only a failure to spawn is returned as `Err`; timeouts and non-zero
    /// exits are reported through the `JobResult`.
    pub async fn run(&self, artifact_path: &Path) -> Result<JobResult, SpawnError> {
        let _permit = match &self.permits {
            Some(permits) => permits.acquire().await.ok(),
            None => None,
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(artifact_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let started = Instant::now();
        let deadline = tokio::time::Instant::from_std(started + self.timeout);
        let mut child = command.spawn().map_err(|source| SpawnError {
            program: self.program.clone(),
            source,
        })?;
        debug!(pid = ?child.id(), path = %artifact_path.display(), "worker spawned");
        let mut group = ProcessGroup::new(child.id());

        let stdout = PipeReader::spawn(child.stdout.take());
        let stderr = PipeReader::spawn(child.stderr.take());

        match timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => {
                // Leftover background processes would keep the pipes open.
                group.kill();
                let stdout = stdout.collect(deadline).await;
                let stderr = stderr.collect(deadline).await.unwrap_or_default();
                let elapsed = started.elapsed();
                let Some(stdout) = stdout else {
                    warn!(?status, ?elapsed, "worker stdout still open at deadline");
                    return Ok(JobResult::failed(
                        JobErrorKind::WorkerError,
                        String::new(),
                        stderr,
                        Some(status),
                        elapsed,
                    ));
                };
                if status.success() {
                    debug!(?elapsed, "worker finished");
                    Ok(JobResult::success(&stdout, stderr, status, elapsed))
                } else {
                    debug!(?status, ?elapsed, stderr = %stderr.trim_end(), "worker failed");
                    Ok(JobResult::failed(
                        JobErrorKind::WorkerError,
                        stdout,
                        stderr,
                        Some(status),
                        elapsed,
                    ))
                }
            }
            Ok(Err(err)) => {
                warn!("waiting on worker failed: {}", err);
                group.kill();
                if let Err(err) = child.kill().await {
                    warn!("failed to kill worker: {}", err);
                }
                Ok(JobResult::failed(
                    JobErrorKind::WorkerError,
                    String::new(),
                    err.to_string(),
                    None,
                    started.elapsed(),
                ))
            }
            Err(_) => {
                group.kill();
                // kill() also waits, so the child is reaped before we return.
                if let Err(err) = child.kill().await {
                    warn!("failed to kill timed out worker: {}", err);
                }
                let elapsed = started.elapsed();
                debug!(?elapsed, timeout = ?self.timeout, "worker timed out");
                Ok(JobResult::failed(
                    JobErrorKind::Timeout,
                    String::new(),
                    String::new(),
                    None,
                    elapsed,
                ))
            }
        }
    }
}

/// SIGKILLs the worker's process group, at most once. Dropping an armed
/// guard kills the group too, which covers a request dropped mid-run.
struct ProcessGroup(Option<u32>);

impl ProcessGroup {
    fn new(leader: Option<u32>) -> Self {
        Self(leader)
    }

    #[cfg(unix)]
    fn kill(&mut self) {
        let Some(pgid) = self.0.take() else {
            return;
        };
        let Ok(pgid) = libc::pid_t::try_from(pgid) else {
            return;
        };
        // SAFETY: killpg only sends a signal; no memory is shared with libc.
        if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
            let err = io::Error::last_os_error();
            // ESRCH: every member has already exited.
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!(pgid, "failed to kill worker process group: {}", err);
            }
        }
    }

    #[cfg(not(unix))]
    fn kill(&mut self) {
        self.0 = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Drains one child pipe on its own task so a full pipe buffer can never
/// stall the child. The task is aborted if the reader is dropped unread.
struct PipeReader(Option<JoinHandle<String>>);

impl PipeReader {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self(pipe.map(|pipe| tokio::spawn(read_lossy(pipe))))
    }

    /// Wait for the pipe to close, giving up at `deadline`.
    ///
    /// `None` means the pipe was still open at the deadline, so the text
    /// would be incomplete.
    async fn collect(mut self, deadline: tokio::time::Instant) -> Option<String> {
        let Some(handle) = self.0.as_mut() else {
            return Some(String::new());
        };
        match timeout_at(deadline, handle).await {
            Ok(Ok(text)) => Some(text),
            Ok(Err(err)) => {
                warn!("worker pipe reader failed: {}", err);
                Some(String::new())
            }
            Err(_) => None,
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

async fn read_lossy<R: AsyncRead + Unpin>(mut pipe: R) -> String {
    let mut buf = Vec::new();
    if let Err(err) = pipe.read_to_end(&mut buf).await {
        debug!("error reading worker pipe: {}", err);
    }
    String::from_utf8_lossy(&buf).into_owned()
}
