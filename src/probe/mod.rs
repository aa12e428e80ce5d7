//! Probe traits: the seam between detectors and the operating system
//!
//! `SystemProbe` answers narrow questions about the host (memory, CPU,
//! disks, interfaces, privileges). `ProcessInspector` enumerates and
//! terminates processes. Detectors and cleanup only ever talk to these
//! traits, so tests can swap in the fakes from [`fake`].

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub mod fake;
pub mod fs;
pub mod system;

/// A running process as seen by a `ProcessInspector`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    /// Time since the process started
    pub age: Duration,
    /// Resident working set in bytes
    pub memory_bytes: u64,
}

impl ProcessInfo {
    pub fn new(pid: u32, name: impl Into<String>, age: Duration, memory_bytes: u64) -> Self {
        Self {
            pid,
            name: name.into(),
            age,
            memory_bytes,
        }
    }

    /// Case-insensitive match against a list of process base names
    ///
    /// Ignores a trailing `.exe` so the same list works on every platform.
    pub fn matches_any(&self, names: &[String]) -> bool {
        let own = normalize_process_name(&self.name);
        names.iter().any(|n| normalize_process_name(n) == own)
    }
}

fn normalize_process_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    lower
        .strip_suffix(".exe")
        .map(str::to_string)
        .unwrap_or(lower)
}

/// A network interface and its link state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub up: bool,
    pub loopback: bool,
    /// Negotiated link speed, when the platform reports one
    pub speed_mbps: Option<u64>,
}

/// Result of asking a `ProcessInspector` to terminate a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Killed,
    /// The process exited between enumeration and termination
    AlreadyGone,
}

/// Read-only host inspection used by the threat detectors
///
/// Every method is short. Only `cpu_usage_percent` blocks, for one fixed
/// sampling window.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    /// Available physical memory in megabytes
    async fn available_memory_mb(&self) -> Result<u64>;

    /// System-wide CPU utilization over one sampling window (0.0..=100.0)
    async fn cpu_usage_percent(&self) -> Result<f32>;

    /// Free space on the volume holding the operating system, in megabytes
    async fn system_free_space_mb(&self) -> Result<u64>;

    /// Free space on the volume holding the temp root, in megabytes
    async fn temp_free_space_mb(&self) -> Result<u64>;

    async fn network_interfaces(&self) -> Result<Vec<NetworkInterface>>;

    /// Whether this process runs with administrative privileges
    async fn is_elevated(&self) -> Result<bool>;

    /// Whether an OS real-time malware protection engine is active
    async fn realtime_protection_enabled(&self) -> Result<bool>;

    async fn uptime(&self) -> Result<Duration>;

    /// Number of error-level OS log entries in the last hour
    async fn recent_error_log_entries(&self) -> Result<usize>;

    /// Open handle / file-descriptor count of this process
    async fn handle_count(&self) -> Result<u64>;

    /// Files under `roots` that are held open exclusively by another process
    async fn locked_files(&self, roots: &[PathBuf]) -> Result<Vec<PathBuf>>;

    /// Paths under `roots` longer than `limit` characters
    async fn long_paths(&self, roots: &[PathBuf], limit: usize) -> Result<Vec<PathBuf>>;

    /// Number of installed toolchain versions found in `dirs`
    async fn toolchain_versions(&self, dirs: &[PathBuf]) -> Result<usize>;
}

/// Process enumeration and termination
#[async_trait]
pub trait ProcessInspector: Send + Sync {
    async fn processes(&self) -> Result<Vec<ProcessInfo>>;

    /// Terminate `pid`. A process that is already gone is not an error.
    async fn kill(&self, pid: u32) -> Result<KillOutcome>;

    /// Processes whose name matches one of `names`
    async fn find(&self, names: &[String]) -> Result<Vec<ProcessInfo>> {
        Ok(self
            .processes()
            .await?
            .into_iter()
            .filter(|p| p.matches_any(names))
            .collect())
    }
}
