//! Unix process spawning with spawn-time cgroup binding
//!
//! This module spawns job processes with two properties established in the
//! child before `exec`:
//!
//! - the child calls `setsid()` and becomes the leader of a fresh process
//!   group, so a single `killpg` reaches the whole tree it spawns;
//! - the child writes itself into the job's cgroup through the directory
//!   handle opened by the parent, so not one instruction of the target
//!   program runs outside its resource limits.
//!
//! Only async-signal-safe libc calls are made between `fork` and `exec`.

// Allow unsafe code for this module since the pre-exec hook requires raw libc calls
#![allow(unsafe_code)]

use crate::{CoreError, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, error};

/// A child process bound to a job cgroup, in its own process group
#[derive(Debug)]
pub struct ChildProcess {
    /// The process ID of the spawned process
    pid: Pid,
    /// The underlying Child handle for waiting and I/O capture
    child: Child,
}

impl ChildProcess {
    /// Get the process ID
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Wait for the process to exit and return its exit status (async).
    ///
    /// Errors are the raw reap failure; the caller records them.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    /// Take the stdout handle for async reading, if available
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the stderr handle for async reading, if available
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }
}

/// Spawn a command with piped stdout/stderr, in its own process group,
/// inside the cgroup identified by `cgroup_fd`.
///
/// ## Safety
///
/// The `pre_exec` hook runs in the forked child before `exec()` and is
/// restricted to async-signal-safe libc calls: `setsid`, `openat`,
/// `write`, `close`. The cgroup handle stays open in the parent until the
/// spawn has returned, so the raw descriptor moved into the hook is valid
/// in the child's inherited descriptor table.
pub fn spawn(command: &str, args: &[String], cgroup_fd: BorrowedFd<'_>) -> Result<ChildProcess> {
    debug!("spawning process: {} {:?}", command, args);

    let mut cmd = Command::new(command);
    cmd.args(args);
    // Pipe stdout/stderr so the job can capture output asynchronously
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let raw_cgroup_fd = cgroup_fd.as_raw_fd();

    #[deny(unsafe_op_in_unsafe_fn)]
    unsafe {
        cmd.pre_exec(move || {
            // Create a new session and process group
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }

            // Writing "0" to cgroup.procs moves the calling process into
            // the cgroup.
            let procs = libc::openat(
                raw_cgroup_fd,
                c"cgroup.procs".as_ptr(),
                libc::O_WRONLY | libc::O_CLOEXEC,
            );
            if procs < 0 {
                return Err(std::io::Error::last_os_error());
            }

            let buf: &[u8] = b"0\n";
            let written = libc::write(procs, buf.as_ptr().cast(), buf.len());
            libc::close(procs);
            if written != buf.len() as isize {
                return Err(std::io::Error::last_os_error());
            }

            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| {
        error!("failed to spawn process '{}': {}", command, e);
        CoreError::Environment(format!("spawn '{}': {}", command, e))
    })?;

    let raw_pid = child
        .id()
        .ok_or_else(|| CoreError::Internal("spawned child did not have a PID".to_string()))?;
    let pid = Pid::from_raw(raw_pid as i32);
    debug!("spawned process {} in its own group and cgroup", pid);

    Ok(ChildProcess { pid, child })
}

/// Send SIGKILL to the child's process group.
///
/// `ESRCH` and `EPERM` are treated as success: the group has already
/// exited (or been reparented away), which is the outcome we wanted.
pub fn signal_kill_group(child: &ChildProcess) -> Result<()> {
    debug!("sending SIGKILL to process group {}", child.pid);

    match killpg(child.pid, Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) | Err(nix::errno::Errno::EPERM) => {
            debug!("process group {} already gone", child.pid);
            Ok(())
        }
        Err(e) => Err(CoreError::Internal(format!(
            "kill process group {}: {}",
            child.pid, e
        ))),
    }
}
