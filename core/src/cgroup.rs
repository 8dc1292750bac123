//! Cgroup v2 management for job resource limits
//!
//! Every job runs inside its own cgroup v2 subtree at
//! `<cgroup-root>/lpaas/<job-id>`, created before the process is spawned
//! and removed after it is reaped. The limits are fixed:
//!
//! - `cpu.max`: 50% of one CPU over a 100 ms window
//! - `memory.max`: 1 GiB
//! - `io.max`: 10 MiB/s read and write on the device backing `/`
//!
//! The hierarchy (the `lpaas` directory plus the cpu/memory/io controllers
//! enabled on it and on the cgroup root) is initialized at most once per
//! process; the recorded outcome is replayed to later callers.

use crate::{CoreError, Result};
use async_trait::async_trait;
use nix::sys::stat::{major, minor};
use std::fs;
use std::io::ErrorKind;
use std::os::fd::OwnedFd;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

/// Default cgroup v2 mount point
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
/// Directory under the cgroup root that holds all job cgroups
pub const JOBS_SUBTREE: &str = "lpaas";

// Fixed per-job limits
const CPU_QUOTA_USEC: u64 = 50_000;
const CPU_PERIOD_USEC: u64 = 100_000;
const MEMORY_MAX_BYTES: u64 = 1024 * 1024 * 1024;
const IO_BYTES_PER_SEC: u64 = 10 * 1024 * 1024;

const CPU_MAX_FILE: &str = "cpu.max";
const MEMORY_MAX_FILE: &str = "memory.max";
const IO_MAX_FILE: &str = "io.max";
const KILL_FILE: &str = "cgroup.kill";
const SUBTREE_CONTROL_FILE: &str = "cgroup.subtree_control";

const DELETE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DELETE_TIMEOUT: Duration = Duration::from_secs(1);

static HIERARCHY_INIT: OnceLock<Result<()>> = OnceLock::new();

/// Ensure `<cgroup-root>/lpaas` exists with the cpu, memory, and io
/// controllers enabled on it and on the cgroup root.
///
/// Runs at most once per process; later callers observe the recorded
/// outcome without touching the filesystem again.
pub fn ensure_hierarchy(cgroup_root: &Path) -> Result<()> {
    HIERARCHY_INIT
        .get_or_init(|| init_hierarchy(cgroup_root))
        .clone()
}

fn init_hierarchy(cgroup_root: &Path) -> Result<()> {
    let jobs_root = cgroup_root.join(JOBS_SUBTREE);

    fs::create_dir_all(&jobs_root).map_err(|e| {
        CoreError::Environment(format!(
            "create cgroup root {}: {}",
            jobs_root.display(),
            e
        ))
    })?;
    enable_controllers(cgroup_root)?;
    enable_controllers(&jobs_root)?;

    debug!("cgroup hierarchy ready at {}", jobs_root.display());
    Ok(())
}

/// Enable the cpu, memory, and io controllers for children of `dir`.
fn enable_controllers(dir: &Path) -> Result<()> {
    let subtree = dir.join(SUBTREE_CONTROL_FILE);

    for ctrl in ["cpu", "memory", "io"] {
        fs::write(&subtree, format!("+{ctrl}\n")).map_err(|e| {
            CoreError::Environment(format!(
                "enable controller {ctrl} at {}: {}",
                subtree.display(),
                e
            ))
        })?;
    }

    Ok(())
}

/// The cgroup operations a job performs after construction, split out so
/// job tests can substitute a mock.
#[async_trait]
pub trait JobCgroup: Send + Sync {
    /// Open the cgroup directory and return a handle for spawn-time
    /// binding. The caller closes the handle once the spawn has returned.
    fn open_handle(&self) -> Result<OwnedFd>;

    /// Kill every process remaining in the group and remove the directory.
    async fn delete(&self) -> Result<()>;
}

/// A single job's cgroup directory under `<cgroup-root>/lpaas/<job-id>`
#[derive(Debug)]
pub struct CgroupV2 {
    path: PathBuf,
}

impl CgroupV2 {
    /// Create the directory for a job's cgroup.
    pub fn new(job_id: &str, cgroup_root: &Path) -> Result<Self> {
        let path = cgroup_root.join(JOBS_SUBTREE).join(job_id);

        fs::create_dir_all(&path).map_err(|e| {
            CoreError::Environment(format!("create job cgroup {}: {}", path.display(), e))
        })?;
        ensure_interface_files(&path)?;

        Ok(Self { path })
    }

    /// The cgroup directory on the filesystem
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the fixed CPU, memory, and I/O limits into this cgroup.
    pub fn apply_limits(&self) -> Result<()> {
        self.write_control(CPU_MAX_FILE, &format!("{CPU_QUOTA_USEC} {CPU_PERIOD_USEC}"))?;
        self.write_control(MEMORY_MAX_FILE, &MEMORY_MAX_BYTES.to_string())?;

        let device = root_block_device()?;
        self.write_control(
            IO_MAX_FILE,
            &format!("{device} rbps={IO_BYTES_PER_SEC} wbps={IO_BYTES_PER_SEC}\n"),
        )?;

        trace!("limits applied to {}", self.path.display());
        Ok(())
    }

    fn write_control(&self, name: &str, content: &str) -> Result<()> {
        let file = self.path.join(name);
        fs::write(&file, content)
            .map_err(|e| CoreError::Environment(format!("write {}: {}", file.display(), e)))
    }
}

#[async_trait]
impl JobCgroup for CgroupV2 {
    fn open_handle(&self) -> Result<OwnedFd> {
        let dir = fs::File::open(&self.path).map_err(|e| {
            CoreError::Environment(format!("open cgroup {}: {}", self.path.display(), e))
        })?;
        Ok(OwnedFd::from(dir))
    }

    /// Write `1` into `cgroup.kill` (a missing file means the kernel has
    /// already collected an empty group), then poll every 50 ms for up to
    /// 1 s until the directory is gone.
    async fn delete(&self) -> Result<()> {
        use std::io::Write;

        let kill = self.path.join(KILL_FILE);
        match fs::OpenOptions::new().write(true).open(&kill) {
            Ok(mut file) => {
                file.write_all(b"1\n").map_err(|e| {
                    CoreError::Environment(format!("write {}: {}", kill.display(), e))
                })?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CoreError::Environment(format!(
                    "open {}: {}",
                    kill.display(),
                    e
                )));
            }
        }

        let deadline = Instant::now() + DELETE_TIMEOUT;
        loop {
            sleep(DELETE_POLL_INTERVAL).await;

            match remove_cgroup_dir(&self.path) {
                Ok(()) => {
                    debug!("removed cgroup {}", self.path.display());
                    return Ok(());
                }
                Err(_) if Instant::now() < deadline => continue,
                Err(e) => {
                    return Err(CoreError::Environment(format!(
                        "delete cgroup {}: {}",
                        self.path.display(),
                        e
                    )));
                }
            }
        }
    }
}

/// Interface files appear automatically on a real cgroup mount; under a
/// plain directory root they must exist before a job can attach or be
/// limited.
fn ensure_interface_files(path: &Path) -> Result<()> {
    const FILES: [(&str, &str); 5] = [
        ("cgroup.procs", ""),
        ("cgroup.kill", ""),
        ("cpu.max", "max 100000"),
        ("memory.max", "max"),
        ("io.max", ""),
    ];

    for (name, default_content) in FILES {
        let file = path.join(name);
        if !file.exists() {
            fs::write(&file, default_content).map_err(|e| {
                CoreError::Environment(format!("create {}: {}", file.display(), e))
            })?;
        }
    }

    Ok(())
}

/// An empty live cgroup can only be `rmdir`ed; under a plain directory
/// root the interface files count as children and have to go first.
fn remove_cgroup_dir(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(_) => {
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    let _ = fs::remove_file(entry.path());
                }
            }
            fs::remove_dir(path)
        }
    }
}

/// Discover `major:minor` of the block device backing `/`.
///
/// cgroup v2 I/O throttling rejects partitions, so a `/dev/...` partition
/// path is reduced to its whole-disk parent by trimming trailing digits.
/// When the reported source is not a stat-able device node (virtual
/// filesystems such as overlay), the device id of the root mount itself
/// is used.
fn root_block_device() -> Result<String> {
    let dev = match root_source_node().and_then(|node| fs::metadata(node).ok()) {
        Some(meta) if meta.file_type().is_block_device() => meta.rdev(),
        Some(meta) => meta.dev(),
        None => fs::metadata("/")
            .map_err(|e| CoreError::Environment(format!("stat /: {}", e)))?
            .dev(),
    };

    Ok(format!("{}:{}", major(dev), minor(dev)))
}

/// Source of the root mount as reported by findmnt, reduced to the
/// whole-disk node.
fn root_source_node() -> Option<String> {
    let out = Command::new("findmnt")
        .args(["-no", "SOURCE", "/"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }

    let source = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if source.is_empty() {
        return None;
    }

    if source.starts_with("/dev/") {
        Some(source.trim_end_matches(|c: char| c.is_ascii_digit()).to_string())
    } else {
        Some(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_new_creates_directory_and_interface_files() {
        let root = tempdir().unwrap();
        let cg = CgroupV2::new("job-1", root.path()).unwrap();

        assert!(cg.path().is_dir());
        assert!(cg.path().ends_with("lpaas/job-1"));
        for name in ["cgroup.procs", "cgroup.kill", "cpu.max", "memory.max", "io.max"] {
            assert!(cg.path().join(name).is_file(), "missing {name}");
        }
    }

    #[test]
    fn test_enable_controllers_write_sequence() {
        let root = tempdir().unwrap();
        enable_controllers(root.path()).unwrap();

        // Each controller is written in turn; the last write wins on a
        // plain file.
        let content = fs::read_to_string(root.path().join(SUBTREE_CONTROL_FILE)).unwrap();
        assert_eq!(content, "+io\n");
    }

    #[test]
    fn test_apply_limits_writes_fixed_values() {
        let root = tempdir().unwrap();
        let cg = CgroupV2::new("job-1", root.path()).unwrap();

        cg.apply_limits().unwrap();

        let io = fs::read_to_string(cg.path().join("io.max")).unwrap();
        assert!(io.contains("rbps=10485760 wbps=10485760"), "io.max: {io}");
        assert_eq!(
            fs::read_to_string(cg.path().join("cpu.max")).unwrap(),
            "50000 100000"
        );
        assert_eq!(
            fs::read_to_string(cg.path().join("memory.max")).unwrap(),
            "1073741824"
        );
    }

    #[test]
    fn test_open_handle() {
        let root = tempdir().unwrap();
        let cg = CgroupV2::new("job-1", root.path()).unwrap();

        let fd = cg.open_handle().unwrap();
        drop(fd);

        let missing = CgroupV2 {
            path: root.path().join("lpaas/no-such-job"),
        };
        assert!(matches!(
            missing.open_handle(),
            Err(CoreError::Environment(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_removes_directory() {
        let root = tempdir().unwrap();
        let cg = CgroupV2::new("job-1", root.path()).unwrap();
        assert!(cg.path().exists());

        cg.delete().await.unwrap();
        assert!(!cg.path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_tolerates_missing_kill_file() {
        let root = tempdir().unwrap();
        let path = root.path().join(JOBS_SUBTREE).join("job-1");
        fs::create_dir_all(&path).unwrap();
        let cg = CgroupV2 { path };

        // No cgroup.kill in the directory: the kernel may have already
        // collected the group.
        cg.delete().await.unwrap();
        assert!(!cg.path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_times_out_when_directory_sticks() {
        let root = tempdir().unwrap();
        let path = root.path().join(JOBS_SUBTREE).join("job-1");
        // A nested directory survives the file sweep, so removal can never
        // succeed.
        fs::create_dir_all(path.join("child")).unwrap();
        let cg = CgroupV2 { path };

        let err = cg.delete().await.unwrap_err();
        assert!(matches!(err, CoreError::Environment(_)));
        assert!(cg.path().exists());
    }

    #[test]
    fn test_root_block_device_shape() {
        let device = root_block_device().unwrap();
        let (major, minor) = device.split_once(':').expect("major:minor");
        major.parse::<u64>().unwrap();
        minor.parse::<u64>().unwrap();
    }
}
