//! Scriptable in-memory probes for testing
//!
//! `FakeProbe` returns whatever readings it was given and can be told to
//! fail individual probes. `FakeProcessInspector` holds a process table and
//! records every kill.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{KillOutcome, NetworkInterface, ProcessInfo, ProcessInspector, SystemProbe};
use crate::error::{Result, WardenError};

/// Readings served by `FakeProbe`
#[derive(Debug, Clone)]
pub struct ProbeReadings {
    pub available_memory_mb: u64,
    pub cpu_percent: f32,
    pub system_free_mb: u64,
    pub temp_free_mb: u64,
    pub interfaces: Vec<NetworkInterface>,
    pub elevated: bool,
    pub realtime_protection: bool,
    pub uptime: Duration,
    pub error_log_entries: usize,
    pub handle_count: u64,
    pub locked_files: Vec<PathBuf>,
    pub long_paths: Vec<PathBuf>,
    pub toolchain_versions: usize,
}

impl ProbeReadings {
    /// A host with nothing wrong with it
    pub fn healthy() -> Self {
        Self {
            available_memory_mb: 16 * 1024,
            cpu_percent: 10.0,
            system_free_mb: 200 * 1024,
            temp_free_mb: 200 * 1024,
            interfaces: vec![NetworkInterface {
                name: "eth0".into(),
                up: true,
                loopback: false,
                speed_mbps: Some(1000),
            }],
            elevated: true,
            realtime_protection: false,
            uptime: Duration::from_secs(3600),
            error_log_entries: 0,
            handle_count: 64,
            locked_files: Vec::new(),
            long_paths: Vec::new(),
            toolchain_versions: 1,
        }
    }
}

impl Default for ProbeReadings {
    fn default() -> Self {
        Self::healthy()
    }
}

/// `SystemProbe` serving fixed readings
pub struct FakeProbe {
    readings: Mutex<ProbeReadings>,
    failing: Mutex<HashSet<&'static str>>,
    cpu_samples: AtomicUsize,
}

impl FakeProbe {
    pub fn new(readings: ProbeReadings) -> Self {
        Self {
            readings: Mutex::new(readings),
            failing: Mutex::new(HashSet::new()),
            cpu_samples: AtomicUsize::new(0),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ProbeReadings::healthy())
    }

    /// Change readings in place
    pub fn update(&self, f: impl FnOnce(&mut ProbeReadings)) {
        let mut readings = self.readings.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut readings);
    }

    /// Make the named probe return a detection error
    ///
    /// Names match the trait methods: "memory", "cpu", "storage",
    /// "temp-storage", "network", "privileges", "realtime-protection",
    /// "uptime", "error-log", "handles", "locked-files", "long-paths",
    /// "toolchains".
    pub fn fail(&self, probe: &'static str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(probe);
    }

    /// How many CPU samples have been taken
    pub fn cpu_samples(&self) -> usize {
        self.cpu_samples.load(Ordering::SeqCst)
    }

    fn read<T>(&self, probe: &'static str, f: impl FnOnce(&ProbeReadings) -> T) -> Result<T> {
        if self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(probe)
        {
            return Err(WardenError::detection(probe, "simulated probe failure"));
        }
        let readings = self.readings.lock().unwrap_or_else(|e| e.into_inner());
        Ok(f(&readings))
    }
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self::healthy()
    }
}

#[async_trait]
impl SystemProbe for FakeProbe {
    async fn available_memory_mb(&self) -> Result<u64> {
        self.read("memory", |r| r.available_memory_mb)
    }

    async fn cpu_usage_percent(&self) -> Result<f32> {
        self.cpu_samples.fetch_add(1, Ordering::SeqCst);
        self.read("cpu", |r| r.cpu_percent)
    }

    async fn system_free_space_mb(&self) -> Result<u64> {
        self.read("storage", |r| r.system_free_mb)
    }

    async fn temp_free_space_mb(&self) -> Result<u64> {
        self.read("temp-storage", |r| r.temp_free_mb)
    }

    async fn network_interfaces(&self) -> Result<Vec<NetworkInterface>> {
        self.read("network", |r| r.interfaces.clone())
    }

    async fn is_elevated(&self) -> Result<bool> {
        self.read("privileges", |r| r.elevated)
    }

    async fn realtime_protection_enabled(&self) -> Result<bool> {
        self.read("realtime-protection", |r| r.realtime_protection)
    }

    async fn uptime(&self) -> Result<Duration> {
        self.read("uptime", |r| r.uptime)
    }

    async fn recent_error_log_entries(&self) -> Result<usize> {
        self.read("error-log", |r| r.error_log_entries)
    }

    async fn handle_count(&self) -> Result<u64> {
        self.read("handles", |r| r.handle_count)
    }

    async fn locked_files(&self, _roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
        self.read("locked-files", |r| r.locked_files.clone())
    }

    async fn long_paths(&self, _roots: &[PathBuf], _limit: usize) -> Result<Vec<PathBuf>> {
        self.read("long-paths", |r| r.long_paths.clone())
    }

    async fn toolchain_versions(&self, _dirs: &[PathBuf]) -> Result<usize> {
        self.read("toolchains", |r| r.toolchain_versions)
    }
}

/// `ProcessInspector` over a fixed process table
#[derive(Default)]
pub struct FakeProcessInspector {
    table: Mutex<Vec<ProcessInfo>>,
    /// Listed, but exit before they can be killed
    vanishing: Mutex<HashSet<u32>>,
    killed: Mutex<Vec<u32>>,
}

impl FakeProcessInspector {
    pub fn new(processes: Vec<ProcessInfo>) -> Self {
        Self {
            table: Mutex::new(processes),
            ..Default::default()
        }
    }

    pub fn add(&self, process: ProcessInfo) {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(process);
    }

    /// Keep `pid` listed but have it exit just before termination
    pub fn vanish_on_kill(&self, pid: u32) {
        self.vanishing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid);
    }

    /// Pids terminated so far, in kill order
    pub fn killed(&self) -> Vec<u32> {
        self.killed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn remaining(&self) -> Vec<ProcessInfo> {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ProcessInspector for FakeProcessInspector {
    async fn processes(&self) -> Result<Vec<ProcessInfo>> {
        Ok(self.remaining())
    }

    async fn kill(&self, pid: u32) -> Result<KillOutcome> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let Some(pos) = table.iter().position(|p| p.pid == pid) else {
            return Ok(KillOutcome::AlreadyGone);
        };
        table.remove(pos);
        if self
            .vanishing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&pid)
        {
            return Ok(KillOutcome::AlreadyGone);
        }
        self.killed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(pid);
        Ok(KillOutcome::Killed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_probe_failure_injection() {
        let probe = FakeProbe::healthy();
        assert!(probe.available_memory_mb().await.is_ok());
        probe.fail("memory");
        assert!(matches!(
            probe.available_memory_mb().await,
            Err(WardenError::Detection { .. })
        ));
        // other probes unaffected
        assert!(probe.uptime().await.is_ok());
    }

    #[tokio::test]
    async fn test_fake_inspector_kill_records_and_removes() {
        let inspector = FakeProcessInspector::new(vec![
            ProcessInfo::new(10, "cargo", Duration::from_secs(600), 0),
            ProcessInfo::new(11, "rustc", Duration::from_secs(600), 0),
        ]);
        assert_eq!(inspector.kill(10).await.unwrap(), KillOutcome::Killed);
        assert_eq!(inspector.kill(10).await.unwrap(), KillOutcome::AlreadyGone);
        assert_eq!(inspector.killed(), vec![10]);
        assert_eq!(inspector.remaining().len(), 1);
    }

    #[tokio::test]
    async fn test_fake_inspector_vanishing_process() {
        let inspector =
            FakeProcessInspector::new(vec![ProcessInfo::new(7, "cargo", Duration::ZERO, 0)]);
        inspector.vanish_on_kill(7);
        assert_eq!(inspector.kill(7).await.unwrap(), KillOutcome::AlreadyGone);
        assert!(inspector.killed().is_empty());
    }
}
