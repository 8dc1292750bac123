//! Simple demonstration of the job supervision library
//!
//! Starts a short shell pipeline under cgroup limits, follows its output
//! live, stops a second long-running job, and shows post-mortem streaming.
//!
//! Needs a host with cgroup v2 and enough privilege to create cgroups;
//! set `LPAAS_DEMO_CGROUP_ROOT` to point somewhere writable to try the
//! plumbing without real limits.

#![allow(unused_crate_dependencies)]

use lpaas_core::{JobSpec, JobStatus, ManagerSet, Result};
use tokio::time::{sleep, Duration};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    lpaas_core::utils::init_tracing("info")?;

    let set = match std::env::var("LPAAS_DEMO_CGROUP_ROOT") {
        Ok(root) => ManagerSet::with_cgroup_root(root),
        Err(_) => ManagerSet::new(),
    };

    let manager = match set.get_or_create("demo-user") {
        Ok(manager) => manager,
        Err(e) => {
            error!("cgroup hierarchy unavailable: {e}");
            error!("run on a cgroup v2 host with privileges, or set LPAAS_DEMO_CGROUP_ROOT");
            return Ok(());
        }
    };

    info!("starting a short job and streaming it live");
    let id = manager
        .start_job(JobSpec::new(
            "bash",
            ["-c", "for i in 1 2 3; do echo tick $i; sleep 0.2; done"],
        ))
        .await?;
    info!("started {id}");

    let mut stream = manager.stream_job(&id).await?;
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await;
        if n == 0 {
            break;
        }
        info!("output: {}", String::from_utf8_lossy(&buf[..n]).trim_end());
    }

    let report = manager.status(&id).await?;
    info!(
        "job finished: status={} exit_code={:?}",
        report.status, report.exit_code
    );

    info!("starting a long job and stopping it");
    let id = manager.start_job(JobSpec::new("sleep", ["30"])).await?;
    sleep(Duration::from_millis(200)).await;
    manager.stop_job(&id).await?;

    let report = manager.status(&id).await?;
    assert_eq!(report.status, JobStatus::Stopped);
    info!(
        "stopped: status={} exit_code={:?}",
        report.status, report.exit_code
    );

    info!("replaying the stopped job's output post mortem");
    let mut replay = manager.stream_job(&id).await?;
    let bytes = replay.read_to_end().await;
    info!("replayed {} bytes", bytes.len());

    Ok(())
}
