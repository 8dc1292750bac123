//! Job registry and the supervision entry points
//!
//! A [`JobManager`] is the registry for one authenticated owner: it mints
//! job identifiers, builds each job's cgroup, and mediates
//! start/stop/status/stream by identifier. Job records stay registered
//! after termination so status and stream requests keep working.
//!
//! [`ManagerSet`] maps owners to their managers. A manager only ever
//! contains jobs its owner started, which is the entire authorization
//! model: naming another owner's job yields `NotFound`.

use crate::cgroup::{self, CgroupV2, JobCgroup};
use crate::job::Job;
use crate::output::OutputStream;
use crate::{CoreError, Result};
use schema::{JobSpec, StatusReport};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};
use uuid::Uuid;

/// Mint a globally unique job identifier.
fn new_job_id() -> String {
    format!("job-{}", Uuid::new_v4())
}

/// Registry of jobs for a single owner. Safe for concurrent use.
pub struct JobManager {
    jobs: Mutex<HashMap<String, Arc<Job>>>,
    cgroup_root: PathBuf,
}

impl JobManager {
    /// Create a manager rooted at the default cgroup mount, initializing
    /// the process-wide hierarchy on first use.
    pub fn new() -> Result<Self> {
        Self::with_cgroup_root(cgroup::CGROUP_ROOT)
    }

    /// Create a manager with an explicit cgroup root.
    pub fn with_cgroup_root(cgroup_root: impl Into<PathBuf>) -> Result<Self> {
        let cgroup_root = cgroup_root.into();
        cgroup::ensure_hierarchy(&cgroup_root)?;

        Ok(Self {
            jobs: Mutex::new(HashMap::new()),
            cgroup_root,
        })
    }

    /// Launch a command under resource limits and return its identifier.
    ///
    /// Returns as soon as the process is spawned; it does not wait for
    /// the job to finish.
    pub async fn start_job(&self, spec: JobSpec) -> Result<String> {
        if spec.command.is_empty() {
            return Err(CoreError::Precondition(
                "command must not be empty".to_string(),
            ));
        }

        let id = new_job_id();

        let cg = Arc::new(CgroupV2::new(&id, &self.cgroup_root)?);
        let command = spec.command.clone();
        let cgroup: Arc<dyn JobCgroup> = Arc::clone(&cg) as Arc<dyn JobCgroup>;
        let job = Arc::new(Job::new(&id, spec, cgroup));

        if let Err(e) = launch(&cg, &job).await {
            // A failed start must not leave its cgroup behind.
            if let Err(cleanup) = cg.delete().await {
                warn!(job = %id, "cleanup after failed start: {}", cleanup);
            }
            return Err(e);
        }

        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), job);
        info!(job = %id, %command, "job registered");

        Ok(id)
    }

    /// Stop a job and wait until its process has been reaped.
    pub async fn stop_job(&self, id: &str) -> Result<()> {
        let job = self.lookup(id)?;
        job.stop().await
    }

    /// Report a job's status, exit code (terminal states only), and any
    /// reap or cleanup error.
    pub async fn status(&self, id: &str) -> Result<StatusReport> {
        let job = self.lookup(id)?;
        let (status, exit_code, error) = job.status_snapshot().await;

        Ok(StatusReport {
            status,
            exit_code: status.is_terminal().then_some(exit_code),
            error,
        })
    }

    /// Stream a job's combined output from its first byte.
    pub async fn stream_job(&self, id: &str) -> Result<OutputStream> {
        let job = self.lookup(id)?;
        Ok(job.stream().await)
    }

    /// Whether a job with this identifier exists in the registry.
    pub fn job_exists(&self, id: &str) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    fn lookup(&self, id: &str) -> Result<Arc<Job>> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }
}

async fn launch(cg: &CgroupV2, job: &Arc<Job>) -> Result<()> {
    cg.apply_limits()?;
    Arc::clone(job).start().await
}

/// Owner → manager map. Each owner gets an isolated registry, created
/// lazily on first use.
pub struct ManagerSet {
    managers: Mutex<HashMap<String, Arc<JobManager>>>,
    cgroup_root: PathBuf,
}

impl ManagerSet {
    pub fn new() -> Self {
        Self::with_cgroup_root(cgroup::CGROUP_ROOT)
    }

    pub fn with_cgroup_root(cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            managers: Mutex::new(HashMap::new()),
            cgroup_root: cgroup_root.into(),
        }
    }

    /// The manager for `owner`, creating it if this is the owner's first
    /// request.
    pub fn get_or_create(&self, owner: &str) -> Result<Arc<JobManager>> {
        let mut managers = self
            .managers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(manager) = managers.get(owner) {
            return Ok(Arc::clone(manager));
        }

        let manager = Arc::new(JobManager::with_cgroup_root(&self.cgroup_root)?);
        managers.insert(owner.to_string(), Arc::clone(&manager));
        info!(%owner, "created job manager");

        Ok(manager)
    }

    /// The manager for `owner`, if one exists.
    pub fn get(&self, owner: &str) -> Option<Arc<JobManager>> {
        self.managers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(owner)
            .cloned()
    }

    pub fn cgroup_root(&self) -> &Path {
        &self.cgroup_root
    }
}

impl Default for ManagerSet {
    fn default() -> Self {
        Self::new()
    }
}
