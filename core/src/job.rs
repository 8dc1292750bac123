//! A single supervised job, from spawn to reap
//!
//! A [`Job`] owns one child process. Starting it binds the child to the
//! job's cgroup, wires stdout and stderr into the shared output journal,
//! and launches a monitor task that waits for the reap. The monitor
//! classifies the outcome, derives the exit code, tears the cgroup down,
//! and fires the termination latch that wakes every blocked reader and
//! `stop()` waiter.
//!
//! Status moves `Unknown` → `Running` → exactly one of `Exited`, `Failed`,
//! `Stopped`, and never changes again. Job records outlive their process
//! so status and stream requests stay serviceable after termination.

use crate::cgroup::JobCgroup;
use crate::output::{OutputLog, OutputStream};
use crate::process::{self, ChildProcess};
use crate::{CoreError, Result};
use schema::{JobSpec, JobStatus};
use std::os::fd::AsFd;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Mutable job state guarded by the job's mutex
#[derive(Debug)]
struct JobState {
    status: JobStatus,
    exit_code: i32,
    /// Error from the reap itself (not a non-zero exit)
    reap_error: Option<String>,
    /// Error from cgroup teardown; observable but does not alter status
    cleanup_error: Option<String>,
}

/// One supervised child process and its lifecycle state
pub struct Job {
    id: String,
    spec: JobSpec,
    output: Arc<OutputLog>,
    state: Mutex<JobState>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    cgroup: Arc<dyn JobCgroup>,
}

impl Job {
    /// Create a job record. The process is not spawned until [`start`].
    ///
    /// [`start`]: Job::start
    pub fn new(id: impl Into<String>, spec: JobSpec, cgroup: Arc<dyn JobCgroup>) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let output = Arc::new(OutputLog::new(done_rx.clone()));

        Self {
            id: id.into(),
            spec,
            output,
            state: Mutex::new(JobState {
                status: JobStatus::Unknown,
                exit_code: 0,
                reap_error: None,
                cleanup_error: None,
            }),
            cancel_tx,
            cancel_rx,
            done_tx,
            done_rx,
            cgroup,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spawn the child inside the job's cgroup and launch the monitor
    /// task. On failure the job stays `Unknown` and the error propagates.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let handle = self.cgroup.open_handle()?;
        let mut child = process::spawn(&self.spec.command, &self.spec.args, handle.as_fd())?;
        drop(handle);

        let stdout = child.take_stdout();
        let stderr = child.take_stderr();

        {
            let mut state = self.state.lock().await;
            state.status = JobStatus::Running;
        }
        info!(job = %self.id, pid = child.pid(), command = %self.spec.command, "job started");

        let out_pump = stdout.map(|r| spawn_pump(r, Arc::clone(&self.output)));
        let err_pump = stderr.map(|r| spawn_pump(r, Arc::clone(&self.output)));

        tokio::spawn(async move {
            self.monitor(child, out_pump, err_pump).await;
        });

        Ok(())
    }

    /// Wait for the reap, classify the outcome, tear down the cgroup, and
    /// fire the termination latch.
    async fn monitor(
        self: Arc<Self>,
        mut child: ChildProcess,
        out_pump: Option<JoinHandle<()>>,
        err_pump: Option<JoinHandle<()>>,
    ) {
        let mut cancel_rx = self.cancel_rx.clone();

        let first = tokio::select! {
            reaped = child.wait() => Some(reaped),
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => None,
        };
        let reaped = match first {
            Some(reaped) => reaped,
            None => {
                debug!(job = %self.id, "stop requested, killing process group");
                if let Err(e) = process::signal_kill_group(&child) {
                    warn!(job = %self.id, "kill failed: {}", e);
                }
                child.wait().await
            }
        };

        // The pumps finish once every pipe writer is gone; only then is
        // the journal complete.
        if let Some(pump) = out_pump {
            let _ = pump.await;
        }
        if let Some(pump) = err_pump {
            let _ = pump.await;
        }

        let cancelled = *self.cancel_rx.borrow();
        let mut state = self.state.lock().await;

        let (status, exit_code, reap_error) = derive_outcome(&reaped, cancelled);
        state.status = status;
        state.exit_code = exit_code;
        state.reap_error = reap_error;
        info!(job = %self.id, status = %state.status, code = state.exit_code, "job finished");

        if let Err(e) = self.cgroup.delete().await {
            warn!(job = %self.id, "cgroup cleanup failed: {}", e);
            state.cleanup_error = Some(e.to_string());
        }

        // Wake every blocked reader and stop() waiter.
        let _ = self.done_tx.send(true);
    }

    /// Request termination and wait until the process has been reaped.
    ///
    /// Deliberately not cancellable: abandoning a half-dead job would leak
    /// its cgroup.
    pub async fn stop(&self) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.status != JobStatus::Running {
                return Err(CoreError::Precondition(format!(
                    "job {} not running",
                    self.id
                )));
            }
        }

        debug!(job = %self.id, "stop requested");
        let _ = self.cancel_tx.send(true);

        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|fired| *fired).await;
        Ok(())
    }

    /// Wait for the job to reach a terminal state.
    pub async fn wait(&self) {
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|fired| *fired).await;
    }

    /// Snapshot of (status, exit code, joined reap and cleanup error).
    pub async fn status_snapshot(&self) -> (JobStatus, i32, Option<String>) {
        let state = self.state.lock().await;
        let error = match (&state.reap_error, &state.cleanup_error) {
            (None, None) => None,
            (Some(reap), None) => Some(reap.clone()),
            (None, Some(cleanup)) => Some(cleanup.clone()),
            (Some(reap), Some(cleanup)) => Some(format!("{reap}; {cleanup}")),
        };
        (state.status, state.exit_code, error)
    }

    /// A reader over the job's combined output from its first byte.
    ///
    /// While the job runs this is a live subscription that follows new
    /// output; once terminal it is a snapshot of the complete journal.
    /// Either way the byte sequence is identical.
    pub async fn stream(&self) -> OutputStream {
        let state = self.state.lock().await;
        if state.status.is_terminal() {
            OutputStream::snapshot(self.output.snapshot())
        } else {
            OutputStream::Live(Arc::clone(&self.output).register_reader())
        }
    }
}

fn spawn_pump<R>(mut reader: R, log: Arc<OutputLog>) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => log.append(&buf[..n]),
                Err(e) => {
                    warn!("output pump ended: {}", e);
                    break;
                }
            }
        }
    })
}

/// Derive the terminal status, exit code, and reap error from the reap
/// outcome.
///
/// A stop request that raced a natural exit still classifies as `Stopped`:
/// the cancellation latch is authoritative.
fn derive_outcome(
    reaped: &std::io::Result<ExitStatus>,
    cancelled: bool,
) -> (JobStatus, i32, Option<String>) {
    match reaped {
        Ok(exit) => {
            let status = if cancelled {
                JobStatus::Stopped
            } else if exit.success() {
                JobStatus::Exited
            } else {
                JobStatus::Failed
            };
            (status, exit_code_from_status(*exit), None)
        }
        Err(e) => {
            let status = if cancelled {
                JobStatus::Stopped
            } else {
                JobStatus::Failed
            };
            (status, -1, Some(format!("wait for child: {e}")))
        }
    }
}

/// 0 on clean exit, the reported code on a coded exit, -1 when the
/// process was terminated by a signal.
fn exit_code_from_status(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
