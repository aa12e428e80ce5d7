//! Live host probes backed by `sysinfo`
//!
//! Linux-specific details (interface link state, descriptor counts, the
//! journal) are read from `/sys`, `/proc` and `journalctl`; other platforms
//! fall back to what `sysinfo` exposes.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::{Disks, System};

use super::{KillOutcome, NetworkInterface, ProcessInfo, ProcessInspector, SystemProbe};
use crate::error::{Result, WardenError};

/// Shortest CPU sampling window
const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(100);

/// Real-time protection engines whose presence means the flag is on
const REALTIME_ENGINES: &[&str] = &["MsMpEng", "wdavdaemon", "mdatp"];

const MB: u64 = 1024 * 1024;

/// `SystemProbe` reading the live host
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn with_system<T>(&self, probe: &str, f: impl FnOnce(&mut System) -> T) -> Result<T> {
        let mut sys = self
            .system
            .lock()
            .map_err(|e| WardenError::detection(probe, format!("probe lock poisoned: {e}")))?;
        Ok(f(&mut sys))
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Free space of the disk whose mount point is the longest prefix of `path`
fn free_space_for(path: &Path, probe: &str) -> Result<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space() / MB)
        .ok_or_else(|| {
            WardenError::detection(probe, format!("no disk found for {}", path.display()))
        })
}

fn system_root() -> PathBuf {
    if cfg!(windows) {
        let drive = std::env::var("SystemDrive").unwrap_or_else(|_| "C:".into());
        PathBuf::from(format!("{drive}\\"))
    } else {
        PathBuf::from("/")
    }
}

async fn blocking<T: Send + 'static>(
    probe: &'static str,
    f: impl FnOnce() -> std::io::Result<T> + Send + 'static,
) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WardenError::detection(probe, e))?
        .map_err(|e| WardenError::detection(probe, e))
}

#[async_trait]
impl SystemProbe for SysinfoProbe {
    async fn available_memory_mb(&self) -> Result<u64> {
        self.with_system("memory", |sys| {
            sys.refresh_memory();
            sys.available_memory() / MB
        })
    }

    async fn cpu_usage_percent(&self) -> Result<f32> {
        self.with_system("cpu", |sys| sys.refresh_cpu())?;
        tokio::time::sleep(CPU_SAMPLE_WINDOW.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL)).await;
        self.with_system("cpu", |sys| {
            sys.refresh_cpu();
            sys.global_cpu_info().cpu_usage()
        })
    }

    async fn system_free_space_mb(&self) -> Result<u64> {
        free_space_for(&system_root(), "storage")
    }

    async fn temp_free_space_mb(&self) -> Result<u64> {
        free_space_for(&std::env::temp_dir(), "temp-storage")
    }

    async fn network_interfaces(&self) -> Result<Vec<NetworkInterface>> {
        #[cfg(target_os = "linux")]
        {
            blocking("network", linux::network_interfaces).await
        }
        #[cfg(not(target_os = "linux"))]
        {
            let networks = sysinfo::Networks::new_with_refreshed_list();
            Ok((&networks)
                .into_iter()
                .map(|(name, _)| NetworkInterface {
                    name: name.clone(),
                    up: true,
                    loopback: name.to_ascii_lowercase().starts_with("lo"),
                    speed_mbps: None,
                })
                .collect())
        }
    }

    async fn is_elevated(&self) -> Result<bool> {
        #[cfg(unix)]
        {
            Ok(nix::unistd::Uid::effective().is_root())
        }
        #[cfg(not(unix))]
        {
            Err(WardenError::detection(
                "privileges",
                "elevation check unsupported on this platform",
            ))
        }
    }

    async fn realtime_protection_enabled(&self) -> Result<bool> {
        let engines: Vec<String> = REALTIME_ENGINES.iter().map(|s| s.to_string()).collect();
        let running = self.with_system("realtime-protection", |sys| {
            sys.refresh_processes();
            sys.processes().values().any(|p| {
                ProcessInfo::new(p.pid().as_u32(), p.name(), Duration::ZERO, 0)
                    .matches_any(&engines)
            })
        })?;
        Ok(running)
    }

    async fn uptime(&self) -> Result<Duration> {
        Ok(Duration::from_secs(System::uptime()))
    }

    async fn recent_error_log_entries(&self) -> Result<usize> {
        #[cfg(target_os = "linux")]
        {
            linux::journal_error_count().await
        }
        #[cfg(not(target_os = "linux"))]
        {
            Ok(0)
        }
    }

    async fn handle_count(&self) -> Result<u64> {
        #[cfg(target_os = "linux")]
        {
            blocking("handles", || {
                Ok(std::fs::read_dir("/proc/self/fd")?.count() as u64)
            })
            .await
        }
        #[cfg(not(target_os = "linux"))]
        {
            Ok(0)
        }
    }

    async fn locked_files(&self, roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let roots = roots.to_vec();
        blocking("locked-files", move || super::fs::locked_files(&roots)).await
    }

    async fn long_paths(&self, roots: &[PathBuf], limit: usize) -> Result<Vec<PathBuf>> {
        let roots = roots.to_vec();
        blocking("long-paths", move || super::fs::long_paths(&roots, limit)).await
    }

    async fn toolchain_versions(&self, dirs: &[PathBuf]) -> Result<usize> {
        let dirs = dirs.to_vec();
        blocking("toolchains", move || super::fs::count_subdirs(&dirs)).await
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::path::Path;
    use std::time::Duration;

    use super::NetworkInterface;
    use crate::error::{Result, WardenError};

    pub fn network_interfaces() -> std::io::Result<Vec<NetworkInterface>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir("/sys/class/net")? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let dir = entry.path();
            let operstate = read_trimmed(&dir.join("operstate")).unwrap_or_default();
            // negative or unreadable speed means the driver does not report one
            let speed_mbps = read_trimmed(&dir.join("speed"))
                .and_then(|s| s.parse::<i64>().ok())
                .filter(|s| *s > 0)
                .map(|s| s as u64);
            out.push(NetworkInterface {
                loopback: name == "lo",
                up: operstate == "up" || operstate == "unknown",
                speed_mbps,
                name,
            });
        }
        Ok(out)
    }

    fn read_trimmed(path: &Path) -> Option<String> {
        std::fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
    }

    pub async fn journal_error_count() -> Result<usize> {
        let output = tokio::time::timeout(
            Duration::from_secs(2),
            tokio::process::Command::new("journalctl")
                .args(["-p", "err", "-S", "-1h", "-q", "--no-pager", "-o", "cat"])
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| WardenError::detection("error-log", "journalctl timed out"))?;

        match output {
            Ok(out) if out.status.success() => Ok(String::from_utf8_lossy(&out.stdout)
                .lines()
                .filter(|l| !l.trim().is_empty())
                .count()),
            // no journal access for this user: nothing to report
            Ok(_) => Ok(0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(WardenError::detection("error-log", e)),
        }
    }
}

/// `ProcessInspector` over the live process table
pub struct SysinfoProcessInspector {
    system: Mutex<System>,
}

impl SysinfoProcessInspector {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProcessInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessInspector for SysinfoProcessInspector {
    async fn processes(&self) -> Result<Vec<ProcessInfo>> {
        let mut sys = self
            .system
            .lock()
            .map_err(|e| WardenError::detection("processes", format!("lock poisoned: {e}")))?;
        sys.refresh_processes();
        Ok(sys
            .processes()
            .values()
            .map(|p| {
                ProcessInfo::new(
                    p.pid().as_u32(),
                    p.name(),
                    Duration::from_secs(p.run_time()),
                    p.memory(),
                )
            })
            .collect())
    }

    async fn kill(&self, pid: u32) -> Result<KillOutcome> {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid as NixPid;

            match kill(NixPid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => Ok(KillOutcome::Killed),
                Err(Errno::ESRCH) => Ok(KillOutcome::AlreadyGone),
                Err(e) => Err(WardenError::mitigation(
                    "kill-process",
                    format!("pid {pid}: {e}"),
                )),
            }
        }
        #[cfg(not(unix))]
        {
            use sysinfo::Pid;

            let mut sys = self
                .system
                .lock()
                .map_err(|e| WardenError::mitigation("kill-process", format!("lock poisoned: {e}")))?;
            let sys_pid = Pid::from_u32(pid);
            if !sys.refresh_process(sys_pid) {
                return Ok(KillOutcome::AlreadyGone);
            }
            match sys.process(sys_pid) {
                None => Ok(KillOutcome::AlreadyGone),
                Some(p) if p.kill() => Ok(KillOutcome::Killed),
                Some(_) => {
                    if sys.refresh_process(sys_pid) {
                        Err(WardenError::mitigation(
                            "kill-process",
                            format!("pid {pid} refused termination"),
                        ))
                    } else {
                        Ok(KillOutcome::AlreadyGone)
                    }
                }
            }
        }
    }
}
