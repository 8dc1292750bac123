//! Core functionality for the lpaas job supervisor
//!
//! This crate launches arbitrary Linux commands under cgroup v2 resource
//! limits, tracks their lifecycle, and delivers their combined stdout and
//! stderr to any number of concurrent subscribers, live or after the
//! process has exited, from the first byte emitted.
//!
//! # Modules
//!
//! - **cgroup**: per-job cgroup v2 subtrees, fixed limits, atomic group
//!   kill and teardown
//! - **process**: spawning under a cgroup handle, process-group signaling
//! - **output**: append-only output journal with multi-reader fan-out
//! - **job**: the per-job state machine and its monitor task
//! - **manager**: per-owner registries exposing start/stop/status/stream
//!
//! The transport in front of this library supplies a verified owner
//! identity and routes each request to that owner's [`JobManager`].

pub mod cgroup;
pub mod error;
pub mod job;
pub mod manager;
pub mod output;
#[cfg(unix)]
pub mod process;


// Re-export schema types for convenience
pub use schema::{JobSpec, JobStatus, StatusReport};

pub use cgroup::{CgroupV2, JobCgroup};
pub use error::{CoreError, Result};
pub use job::Job;
pub use manager::{JobManager, ManagerSet};
pub use output::{OutputLog, OutputReader, OutputStream};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| crate::CoreError::Internal(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
