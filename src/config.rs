//! Warden configuration, loaded from `warden.hcl`
//!
//! Every block and field is optional; missing values fall back to the
//! defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, WardenError};
use crate::types::ProtectionLevel;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub warden: GlobalSettings,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub cleanup: CleanupSettings,
    #[serde(default)]
    pub mitigation: MitigationSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub protection_level: ProtectionLevel,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            protection_level: ProtectionLevel::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

/// Detector thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_memory_critical_mb")]
    pub memory_critical_mb: u64,
    #[serde(default = "default_memory_warning_mb")]
    pub memory_warning_mb: u64,
    #[serde(default = "default_cpu_high_percent")]
    pub cpu_high_percent: f32,
    #[serde(default = "default_cpu_warning_percent")]
    pub cpu_warning_percent: f32,
    /// Both consecutive samples above this count as thermal throttling
    #[serde(default = "default_cpu_sustained_percent")]
    pub cpu_sustained_percent: f32,
    #[serde(default = "default_disk_critical_mb")]
    pub disk_critical_mb: u64,
    #[serde(default = "default_link_speed_min_mbps")]
    pub link_speed_min_mbps: u64,
    #[serde(default = "default_antivirus_working_set_mb")]
    pub antivirus_working_set_mb: u64,
    #[serde(default = "default_uptime_warning_days")]
    pub uptime_warning_days: u64,
    #[serde(default = "default_uptime_critical_days")]
    pub uptime_critical_days: u64,
    #[serde(default = "default_error_log_min_entries")]
    pub error_log_min_entries: usize,
    #[serde(default = "default_max_path_len")]
    pub max_path_len: usize,
    #[serde(default = "default_handle_count_warning")]
    pub handle_count_warning: u64,
    #[serde(default = "default_build_process_warning")]
    pub build_process_warning: usize,
    #[serde(default = "default_build_process_critical")]
    pub build_process_critical: usize,
    #[serde(default = "default_toolchain_versions_warning")]
    pub toolchain_versions_warning: usize,
    #[serde(default = "default_temp_space_warning_mb")]
    pub temp_space_warning_mb: u64,
    #[serde(default = "default_cpu_penalty_percent")]
    pub cpu_penalty_percent: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            memory_critical_mb: default_memory_critical_mb(),
            memory_warning_mb: default_memory_warning_mb(),
            cpu_high_percent: default_cpu_high_percent(),
            cpu_warning_percent: default_cpu_warning_percent(),
            cpu_sustained_percent: default_cpu_sustained_percent(),
            disk_critical_mb: default_disk_critical_mb(),
            link_speed_min_mbps: default_link_speed_min_mbps(),
            antivirus_working_set_mb: default_antivirus_working_set_mb(),
            uptime_warning_days: default_uptime_warning_days(),
            uptime_critical_days: default_uptime_critical_days(),
            error_log_min_entries: default_error_log_min_entries(),
            max_path_len: default_max_path_len(),
            handle_count_warning: default_handle_count_warning(),
            build_process_warning: default_build_process_warning(),
            build_process_critical: default_build_process_critical(),
            toolchain_versions_warning: default_toolchain_versions_warning(),
            temp_space_warning_mb: default_temp_space_warning_mb(),
            cpu_penalty_percent: default_cpu_penalty_percent(),
        }
    }
}

const SECS_PER_DAY: u64 = 86_400;

impl Thresholds {
    /// Uptime above which a restart is recommended
    pub fn uptime_warning(&self) -> Duration {
        Duration::from_secs(self.uptime_warning_days.saturating_mul(SECS_PER_DAY))
    }

    /// Uptime above which runtime stability is critical
    pub fn uptime_critical(&self) -> Duration {
        Duration::from_secs(self.uptime_critical_days.saturating_mul(SECS_PER_DAY))
    }
}

fn default_memory_critical_mb() -> u64 {
    500
}
fn default_memory_warning_mb() -> u64 {
    1000
}
fn default_cpu_high_percent() -> f32 {
    95.0
}
fn default_cpu_warning_percent() -> f32 {
    70.0
}
fn default_cpu_sustained_percent() -> f32 {
    90.0
}
fn default_disk_critical_mb() -> u64 {
    1024
}
fn default_link_speed_min_mbps() -> u64 {
    1
}
fn default_antivirus_working_set_mb() -> u64 {
    200
}
fn default_uptime_warning_days() -> u64 {
    7
}
fn default_uptime_critical_days() -> u64 {
    30
}
fn default_error_log_min_entries() -> usize {
    1
}
fn default_max_path_len() -> usize {
    260
}
fn default_handle_count_warning() -> u64 {
    1000
}
fn default_build_process_warning() -> usize {
    3
}
fn default_build_process_critical() -> usize {
    6
}
fn default_toolchain_versions_warning() -> usize {
    5
}
fn default_temp_space_warning_mb() -> u64 {
    1024
}
fn default_cpu_penalty_percent() -> f32 {
    80.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_monitor_interval", with = "duration_serde")]
    pub interval: Duration,
    /// Cap on the interval multiplier applied after critical ticks
    #[serde(default = "default_max_backoff_factor")]
    pub max_backoff_factor: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: default_monitor_interval(),
            max_backoff_factor: default_max_backoff_factor(),
        }
    }
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(120)
}
fn default_max_backoff_factor() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildSettings {
    /// Build command; `{target}` is replaced with the build target path
    #[serde(default = "default_build_command")]
    pub command: String,
    #[serde(default = "default_build_timeout", with = "duration_serde")]
    pub timeout: Duration,
    #[serde(default = "default_retry_delay", with = "duration_serde")]
    pub retry_delay: Duration,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Build-output directories, relative to the target's directory
    #[serde(default = "default_output_dirs")]
    pub output_dirs: Vec<PathBuf>,
    /// Stderr fragments that identify a broken build-tool IPC channel
    #[serde(default = "default_pipe_break_markers")]
    pub pipe_break_markers: Vec<String>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            command: default_build_command(),
            timeout: default_build_timeout(),
            retry_delay: default_retry_delay(),
            max_attempts: default_max_attempts(),
            output_dirs: default_output_dirs(),
            pipe_break_markers: default_pipe_break_markers(),
        }
    }
}

fn default_build_command() -> String {
    "cargo build --manifest-path {target}".into()
}
fn default_build_timeout() -> Duration {
    Duration::from_secs(600)
}
fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}
fn default_max_attempts() -> u32 {
    3
}
fn default_output_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("target/debug/incremental"),
        PathBuf::from("target/release/incremental"),
        PathBuf::from("obj"),
    ]
}
fn default_pipe_break_markers() -> Vec<String> {
    [
        "broken pipe",
        "pipe is broken",
        "the pipe has been ended",
        "epipe",
        "msb4166",
        "child node exited prematurely",
        "failed to acquire jobserver token",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupSettings {
    /// Build-tool processes older than this are presumed orphaned
    #[serde(default = "default_orphan_age", with = "duration_serde")]
    pub orphan_age: Duration,
    #[serde(default = "default_stale_temp_age", with = "duration_serde")]
    pub stale_temp_age: Duration,
    #[serde(default = "default_temp_dirs")]
    pub temp_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub toolchain_temp_dirs: Vec<PathBuf>,
    /// Directories whose entries are installed toolchain versions
    #[serde(default = "default_toolchain_dirs")]
    pub toolchain_dirs: Vec<PathBuf>,
    #[serde(default = "default_build_tool_processes")]
    pub build_tool_processes: Vec<String>,
    #[serde(default = "default_antivirus_processes")]
    pub antivirus_processes: Vec<String>,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            orphan_age: default_orphan_age(),
            stale_temp_age: default_stale_temp_age(),
            temp_dirs: default_temp_dirs(),
            toolchain_temp_dirs: Vec::new(),
            toolchain_dirs: default_toolchain_dirs(),
            build_tool_processes: default_build_tool_processes(),
            antivirus_processes: default_antivirus_processes(),
        }
    }
}

fn default_orphan_age() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_stale_temp_age() -> Duration {
    Duration::from_secs(60 * 60)
}
fn default_temp_dirs() -> Vec<PathBuf> {
    vec![std::env::temp_dir().join("a3s-warden")]
}
fn default_toolchain_dirs() -> Vec<PathBuf> {
    dirs_next::home_dir()
        .map(|home| vec![home.join(".rustup").join("toolchains")])
        .unwrap_or_default()
}
fn default_build_tool_processes() -> Vec<String> {
    [
        "cargo",
        "rustc",
        "sccache",
        "dotnet",
        "MSBuild",
        "VBCSCompiler",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_antivirus_processes() -> Vec<String> {
    [
        "MsMpEng",
        "NisSrv",
        "avp",
        "clamd",
        "freshclam",
        "savscand",
        "wdavdaemon",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MitigationSettings {
    #[serde(default = "default_cpu_backoff", with = "duration_serde")]
    pub cpu_backoff: Duration,
    /// Pause inserted between file operations while I/O throttling is active
    #[serde(default = "default_io_delay", with = "duration_serde")]
    pub io_delay: Duration,
    /// Wait after emergency protections before re-checking health
    #[serde(default = "default_settle_delay", with = "duration_serde")]
    pub settle_delay: Duration,
    #[serde(default = "default_cleanup_timeout", with = "duration_serde")]
    pub cleanup_timeout: Duration,
}

impl Default for MitigationSettings {
    fn default() -> Self {
        Self {
            cpu_backoff: default_cpu_backoff(),
            io_delay: default_io_delay(),
            settle_delay: default_settle_delay(),
            cleanup_timeout: default_cleanup_timeout(),
        }
    }
}

fn default_cpu_backoff() -> Duration {
    Duration::from_millis(500)
}
fn default_io_delay() -> Duration {
    Duration::from_millis(50)
}
fn default_settle_delay() -> Duration {
    Duration::from_secs(3)
}
fn default_cleanup_timeout() -> Duration {
    Duration::from_secs(30)
}

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (value, unit) = if let Some(v) = s.strip_suffix("ms") {
            (v, 1)
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1_000)
        } else if let Some(v) = s.strip_suffix('m') {
            (v, 60_000)
        } else if let Some(v) = s.strip_suffix('h') {
            (v, 3_600_000)
        } else {
            return Err(format!(
                "unknown duration format: '{s}' (use '500ms', '2s', '5m' or '1h')"
            ));
        };
        let value = value.trim().parse::<u64>().map_err(|e| e.to_string())?;
        value
            .checked_mul(unit)
            .map(Duration::from_millis)
            .ok_or_else(|| format!("duration out of range: '{s}'"))
    }
}

impl WardenConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)
            .map_err(|e| WardenError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_hcl(&src)
            .map_err(|e| WardenError::Config(format!("{} in {}", e, path.display())))
    }

    /// Load `path` if it exists, otherwise use defaults
    pub fn from_file_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn from_hcl(src: &str) -> Result<Self> {
        let cfg: WardenConfig =
            hcl::from_str(src).map_err(|e| WardenError::Config(format!("parse error: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.build.command.trim().is_empty() {
            return Err(WardenError::Config("build.command must not be empty".into()));
        }
        if let Err(e) = shell_words::split(&self.build.command) {
            return Err(WardenError::Config(format!("build.command: {e}")));
        }
        if self.build.max_attempts == 0 {
            return Err(WardenError::Config(
                "build.max_attempts must be at least 1".into(),
            ));
        }
        if self.build.timeout.is_zero() {
            return Err(WardenError::Config("build.timeout must be non-zero".into()));
        }
        if self.monitor.interval.is_zero() {
            return Err(WardenError::Config(
                "monitor.interval must be non-zero".into(),
            ));
        }
        if self.monitor.max_backoff_factor == 0 {
            return Err(WardenError::Config(
                "monitor.max_backoff_factor must be at least 1".into(),
            ));
        }
        let t = &self.thresholds;
        if t.memory_critical_mb > t.memory_warning_mb {
            return Err(WardenError::Config(format!(
                "thresholds.memory_critical_mb ({}) exceeds memory_warning_mb ({})",
                t.memory_critical_mb, t.memory_warning_mb
            )));
        }
        if t.cpu_warning_percent > t.cpu_high_percent {
            return Err(WardenError::Config(format!(
                "thresholds.cpu_warning_percent ({}) exceeds cpu_high_percent ({})",
                t.cpu_warning_percent, t.cpu_high_percent
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::duration_serde::parse_duration;
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = WardenConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.thresholds.memory_critical_mb, 500);
        assert_eq!(cfg.cleanup.orphan_age, Duration::from_secs(300));
        assert_eq!(cfg.warden.protection_level, ProtectionLevel::Standard);
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn test_parse_duration_overflow_is_error() {
        let err = parse_duration("18446744073709551615h").unwrap_err();
        assert!(err.contains("out of range"));
        assert!(parse_duration("18446744073709551615ms").is_ok());
        assert!(parse_duration("99999999999999999999s").is_err());
    }

    #[test]
    fn test_from_hcl_overrides() {
        let src = r#"
warden {
  log_level        = "debug"
  protection_level = "aggressive"
}

monitor {
  interval = "30s"
}

build {
  command      = "make -C {target}"
  max_attempts = 5
  timeout      = "2m"
}

cleanup {
  orphan_age           = "10m"
  build_tool_processes = ["make", "cc1"]
}
"#;
        let cfg = WardenConfig::from_hcl(src).unwrap();
        assert_eq!(cfg.warden.log_level, "debug");
        assert_eq!(cfg.warden.protection_level, ProtectionLevel::Aggressive);
        assert_eq!(cfg.monitor.interval, Duration::from_secs(30));
        assert_eq!(cfg.build.command, "make -C {target}");
        assert_eq!(cfg.build.max_attempts, 5);
        assert_eq!(cfg.build.timeout, Duration::from_secs(120));
        assert_eq!(cfg.cleanup.orphan_age, Duration::from_secs(600));
        assert_eq!(cfg.cleanup.build_tool_processes, vec!["make", "cc1"]);
        // untouched blocks keep defaults
        assert_eq!(cfg.thresholds.max_path_len, 260);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let src = "build {\n  max_attempts = 0\n}\n";
        assert!(matches!(
            WardenConfig::from_hcl(src),
            Err(WardenError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unbalanced_quotes() {
        let src = "build {\n  command = \"cargo build --manifest-path '{target}\"\n}\n";
        let err = WardenConfig::from_hcl(src).unwrap_err().to_string();
        assert!(err.contains("build.command"));
    }

    #[test]
    fn test_from_file_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = WardenConfig::from_file_or_default(&dir.path().join("warden.hcl")).unwrap();
        assert_eq!(cfg.build.max_attempts, 3);
    }

    #[test]
    fn test_from_file_reports_path_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.hcl");
        std::fs::write(&path, "monitor {\n  interval = \"soon\"\n}\n").unwrap();
        let err = WardenConfig::from_file(&path).unwrap_err().to_string();
        assert!(err.contains("warden.hcl"));
    }
}
