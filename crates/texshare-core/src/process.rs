//! Client process identity and liveness probing.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::error::{DomainError, DomainResult};

/// OS process identifier of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ProcessId(u32);

impl ProcessId {
    /// Creates a process id, rejecting 0.
    pub fn new(pid: u32) -> DomainResult<Self> {
        if pid == 0 {
            Err(DomainError::InvalidProcessId(pid))
        } else {
            Ok(Self(pid))
        }
    }

    /// The id of the calling process.
    pub fn current() -> Self {
        Self(std::process::id())
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for ProcessId {
    type Error = DomainError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProcessId> for u32 {
    fn from(pid: ProcessId) -> Self {
        pid.0
    }
}

// ============================================================================
// Liveness Probe
// ============================================================================

/// Capability to ask the OS whether a process currently exists.
///
/// Returns the process start time (in clock ticks since boot) when the
/// process is running, `None` otherwise. Comparing start times lets callers
/// tell a live process apart from an unrelated one that reused its pid.
pub trait ProcessProbe: Send + Sync {
    fn start_time(&self, pid: ProcessId) -> Option<u64>;
}

/// Probe backed by `/proc/{pid}/stat`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcfsProbe;

impl ProcessProbe for ProcfsProbe {
    fn start_time(&self, pid: ProcessId) -> Option<u64> {
        let pid = i32::try_from(pid.get()).ok()?;
        let process = procfs::process::Process::new(pid).ok()?;
        let stat = process.stat().ok()?;
        // Zombies have exited; only the parent's wait() keeps them listed.
        if stat.state == 'Z' {
            debug!(pid, "process is a zombie, treating as dead");
            return None;
        }
        Some(stat.starttime)
    }
}

/// A process id pinned to the process instance observed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: ProcessId,
    /// Start time seen at registration; `None` if it could not be read.
    pub start_time: Option<u64>,
}

impl ProcessIdentity {
    /// Captures the identity of `pid` as it exists right now.
    pub fn observe(pid: ProcessId, probe: &dyn ProcessProbe) -> Self {
        let start_time = probe.start_time(pid);
        if start_time.is_none() {
            debug!(pid = %pid, "process start time unavailable at registration");
        }
        Self { pid, start_time }
    }

    /// Checks whether the same process instance is still running.
    ///
    /// Returns `false` if:
    /// - The process no longer exists
    /// - The pid has been reused by a different process (start time mismatch)
    pub fn is_alive(&self, probe: &dyn ProcessProbe) -> bool {
        match (self.start_time, probe.start_time(self.pid)) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(expected), Some(current)) => {
                if expected != current {
                    debug!(
                        pid = %self.pid,
                        expected,
                        current,
                        "start time mismatch, pid was reused"
                    );
                }
                expected == current
            }
        }
    }
}
