//! Process management
//!
//! Children are spawned into their own process group and moved into their
//! job's cgroup between `fork` and `exec`, before any instruction of the
//! target program runs. Unix only.

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::{signal_kill_group, spawn, ChildProcess};
