//! Job specification and status types for the lpaas supervisor
//!
//! ## Job lifecycle
//!
//! Jobs progress through the following states:
//! - `Unknown`: the job object exists but the process has not been spawned
//! - `Running`: the process was spawned and has not been reaped
//! - `Stopped`: the process was reaped after an explicit stop request
//! - `Exited`: the process was reaped with exit code 0
//! - `Failed`: the process was reaped with a non-zero exit code
//!
//! The three terminal states are final: once a job leaves `Running` its
//! status never changes again.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Specification for a job submitted to the supervisor
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    /// Command to execute (must be in PATH or an absolute path)
    pub command: String,

    /// Command-line arguments
    #[serde(default)]
    pub args: Vec<String>,
}

impl JobSpec {
    /// Build a spec from a command and its arguments.
    pub fn new<C, I, A>(command: C, args: I) -> Self
    where
        C: Into<String>,
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Current state of a supervised job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    /// The job exists but its process has not been spawned
    Unknown,
    /// The process is running and has not been reaped
    Running,
    /// The process was reaped after an explicit stop request
    Stopped,
    /// The process exited on its own with code 0
    Exited,
    /// The process exited on its own with a non-zero code
    Failed,
}

impl JobStatus {
    /// Check if the job's process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, JobStatus::Running)
    }

    /// Check if the job has reached a final state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Stopped | JobStatus::Exited | JobStatus::Failed
        )
    }

    /// The status phrase reported to clients
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Unknown => "Unknown",
            JobStatus::Running => "Running",
            JobStatus::Stopped => "Stopped",
            JobStatus::Exited => "Exited",
            JobStatus::Failed => "Failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a job's state as reported to clients
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Current job status
    pub status: JobStatus,

    /// Exit code, present only once the status is terminal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Reap and cleanup error text, if either occurred
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_phrases() {
        assert_eq!(JobStatus::Unknown.to_string(), "Unknown");
        assert_eq!(JobStatus::Running.to_string(), "Running");
        assert_eq!(JobStatus::Stopped.to_string(), "Stopped");
        assert_eq!(JobStatus::Exited.to_string(), "Exited");
        assert_eq!(JobStatus::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_terminality() {
        assert!(!JobStatus::Unknown.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
        assert!(JobStatus::Exited.is_terminal());
        assert!(JobStatus::Failed.is_terminal());

        assert!(JobStatus::Running.is_running());
        assert!(!JobStatus::Exited.is_running());
    }

    #[test]
    fn test_job_spec_new() {
        let spec = JobSpec::new("echo", ["hello", "world"]);
        assert_eq!(spec.command, "echo");
        assert_eq!(spec.args, vec!["hello", "world"]);

        let bare = JobSpec::new("true", Vec::<String>::new());
        assert!(bare.args.is_empty());
    }
}
