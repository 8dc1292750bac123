//! Test utilities for integration tests in the core crate.

use lpaas_core::{JobManager, JobStatus, StatusReport};
use std::time::Duration;

/// Run the given future with a timeout, failing the test if it elapses.
pub async fn run_with_timeout<F, T>(duration: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(duration, fut)
        .await
        .expect("test timed out")
}

/// A job manager rooted in a fresh temporary directory, so the tests need
/// no real cgroup mount or privileges.
pub fn manager_with_temp_root() -> (tempfile::TempDir, JobManager) {
    let root = tempfile::tempdir().expect("create temp cgroup root");
    let manager = JobManager::with_cgroup_root(root.path()).expect("create job manager");
    (root, manager)
}

/// Poll status until the job reaches `want`, failing after `within`.
pub async fn poll_status_until(
    manager: &JobManager,
    id: &str,
    want: JobStatus,
    within: Duration,
) -> StatusReport {
    run_with_timeout(within, async {
        loop {
            let report = manager.status(id).await.expect("status should succeed");
            if report.status == want {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
}
