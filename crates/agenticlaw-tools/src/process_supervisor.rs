//! Process supervisor (C7) — tracks every child process spawned by a tool so
//! shutdown can reap them deterministically instead of leaking orphans.
//!
//! Every `bash`/`terminal-execute` invocation registers its child here at
//! spawn and deregisters at reap. On shutdown the whole set is signalled:
//! SIGTERM first, SIGKILL after a short grace period if still alive. A
//! process moved to the "background" set survives the end of its own tool
//! call but is still killed on program shutdown.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL during shutdown.
pub const KILL_GRACE: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

/// A tracked child process. Holds the OS pid for signalling; the tokio
/// `Child` handle itself stays owned by the tool that spawned it.
struct Tracked {
    pid: u32,
    description: String,
}

/// Process-wide registry of spawned children. Shared via `Arc` across every
/// shell tool instance and the shutdown path.
#[derive(Default)]
pub struct ProcessSupervisor {
    next_id: AtomicU64,
    running: DashMap<ProcessId, Tracked>,
    background: DashMap<ProcessId, Tracked>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly spawned child. Call immediately after `spawn()`.
    pub fn register(&self, pid: u32, description: impl Into<String>) -> ProcessId {
        let id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.running.insert(
            id,
            Tracked {
                pid,
                description: description.into(),
            },
        );
        id
    }

    /// Deregister on reap (normal exit, kill, or timeout).
    pub fn reap(&self, id: ProcessId) {
        self.running.remove(&id);
        self.background.remove(&id);
    }

    /// Move a process to the background set: it survives the end of the
    /// tool call that spawned it but is still killed on shutdown.
    pub fn move_to_background(&self, id: ProcessId) {
        if let Some((_, tracked)) = self.running.remove(&id) {
            self.background.insert(id, tracked);
        }
    }

    pub fn is_background(&self, id: ProcessId) -> bool {
        self.background.contains_key(&id)
    }

    pub fn running_count(&self) -> usize {
        self.running.len() + self.background.len()
    }

    /// Signal every tracked process (running + background): SIGTERM, then
    /// SIGKILL after `KILL_GRACE` for anything still alive. Takes a snapshot
    /// first so newly-reaped entries during the grace period don't panic.
    pub async fn shutdown_all(&self) {
        let snapshot: Vec<(ProcessId, u32, String)> = self
            .running
            .iter()
            .chain(self.background.iter())
            .map(|e| (*e.key(), e.value().pid, e.value().description.clone()))
            .collect();

        if snapshot.is_empty() {
            return;
        }

        debug!("process supervisor: signalling {} children", snapshot.len());
        for (_, pid, desc) in &snapshot {
            signal_terminate(*pid, desc);
        }

        tokio::time::sleep(KILL_GRACE).await;

        for (_, pid, desc) in &snapshot {
            if still_alive(*pid) {
                warn!("process {} ({}) survived SIGTERM, sending SIGKILL", pid, desc);
                signal_kill(*pid);
            }
        }

        self.running.clear();
        self.background.clear();
    }
}

#[cfg(unix)]
fn signal_terminate(pid: u32, description: &str) {
    debug!("SIGTERM -> pid {} ({})", pid, description);
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(unix)]
fn signal_kill(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(unix)]
fn still_alive(pid: u32) -> bool {
    // kill(pid, 0) checks existence/permission without sending a signal.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(windows)]
fn signal_terminate(pid: u32, description: &str) {
    // Windows has no SIGTERM equivalent cheap to send without a handle;
    // go straight to the tree-kill-equivalent taskkill.
    debug!("taskkill /T -> pid {} ({})", pid, description);
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output();
}

#[cfg(windows)]
fn signal_kill(_pid: u32) {}

#[cfg(windows)]
fn still_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_reap_roundtrip() {
        let sup = ProcessSupervisor::new();
        let id = sup.register(999_999, "test");
        assert_eq!(sup.running_count(), 1);
        sup.reap(id);
        assert_eq!(sup.running_count(), 0);
    }

    #[test]
    fn move_to_background_survives_until_shutdown() {
        let sup = ProcessSupervisor::new();
        let id = sup.register(999_998, "bg job");
        sup.move_to_background(id);
        assert!(sup.is_background(id));
        assert_eq!(sup.running_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_clears_tracked_sets() {
        let sup = ProcessSupervisor::new();
        // A pid far outside any real process table; kill()/still_alive() on
        // it are harmless ESRCH no-ops, which is exactly what we want here.
        sup.register(i32::MAX as u32 - 1, "nonexistent");
        sup.shutdown_all().await;
        assert_eq!(sup.running_count(), 0);
    }
}
