//! Mitigation engine: maps threats to corrective actions
//!
//! Threats are handled in descending severity order (stable for ties).
//! Each threat plans zero or more [`MitigationAction`]s based on its
//! category, its severity and the current [`ProtectionLevel`]; the planned
//! actions are deduplicated and executed once each. A failing action is
//! logged and skipped.

use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::cleanup::Janitor;
use crate::config::WardenConfig;
use crate::error::{Result, WardenError};
use crate::state::{EnvOverride, MitigationState};
use crate::types::{ProtectionLevel, Severity, Threat, ThreatCategory};

/// HTTP timeout applied when timeouts are extended
const EXTENDED_HTTP_TIMEOUT_SECS: u32 = 120;

/// A concrete, idempotent corrective action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MitigationAction {
    ReclaimMemory,
    LowMemoryMode,
    ReduceParallelism,
    CpuBackoff,
    PurgeStaleTemp,
    DisableCaching,
    OfflineMode,
    ExtendTimeouts,
    IoThrottle,
    KillOrphanedProcesses,
    ClearToolchainTemp,
    SingleNodeBuild,
    DisableTelemetry,
}

impl MitigationAction {
    /// Everything applied by the emergency protocol
    pub const EMERGENCY: [MitigationAction; 10] = [
        MitigationAction::ReclaimMemory,
        MitigationAction::LowMemoryMode,
        MitigationAction::KillOrphanedProcesses,
        MitigationAction::ClearToolchainTemp,
        MitigationAction::PurgeStaleTemp,
        MitigationAction::DisableCaching,
        MitigationAction::ReduceParallelism,
        MitigationAction::SingleNodeBuild,
        MitigationAction::DisableTelemetry,
        MitigationAction::ExtendTimeouts,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            MitigationAction::ReclaimMemory => "reclaim-memory",
            MitigationAction::LowMemoryMode => "low-memory-mode",
            MitigationAction::ReduceParallelism => "reduce-parallelism",
            MitigationAction::CpuBackoff => "cpu-backoff",
            MitigationAction::PurgeStaleTemp => "purge-stale-temp",
            MitigationAction::DisableCaching => "disable-caching",
            MitigationAction::OfflineMode => "offline-mode",
            MitigationAction::ExtendTimeouts => "extend-timeouts",
            MitigationAction::IoThrottle => "io-throttle",
            MitigationAction::KillOrphanedProcesses => "kill-orphaned-processes",
            MitigationAction::ClearToolchainTemp => "clear-toolchain-temp",
            MitigationAction::SingleNodeBuild => "single-node-build",
            MitigationAction::DisableTelemetry => "disable-telemetry",
        }
    }

    /// Actions for one threat at the given protection level
    pub fn plan(threat: &Threat, level: ProtectionLevel) -> Vec<MitigationAction> {
        use MitigationAction::*;
        use ThreatCategory as C;

        let severity = threat.severity();
        if threat.is_detection_error() || !level.acts_on(severity) {
            return Vec::new();
        }
        match threat.category() {
            C::Memory if severity >= Severity::High => vec![ReclaimMemory, LowMemoryMode],
            C::Memory if severity >= Severity::Medium => vec![LowMemoryMode],
            C::Cpu if severity >= Severity::High => vec![ReduceParallelism, CpuBackoff],
            C::Storage if severity >= Severity::High => vec![PurgeStaleTemp, DisableCaching],
            C::Network => vec![OfflineMode, ExtendTimeouts],
            C::Security => vec![IoThrottle],
            C::SystemStability | C::DevEnvironment if severity >= Severity::High => {
                vec![KillOrphanedProcesses, ClearToolchainTemp]
            }
            C::DevEnvironment if severity >= Severity::Medium => vec![SingleNodeBuild],
            _ => Vec::new(),
        }
    }
}

impl std::fmt::Display for MitigationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Releases memory held by the host process
///
/// Rust has no collector to force; the system reclaimer returns freed heap
/// pages to the OS, and hosts embedding caches can plug in their own.
pub trait MemoryReclaimer: Send + Sync {
    fn reclaim(&self) -> Result<()>;
}

/// Returns freed allocator memory to the OS where the allocator supports it
#[derive(Debug, Default)]
pub struct SystemReclaimer;

impl MemoryReclaimer for SystemReclaimer {
    fn reclaim(&self) -> Result<()> {
        #[cfg(all(target_os = "linux", target_env = "gnu"))]
        {
            // SAFETY: malloc_trim only walks allocator arenas; it takes no
            // pointers and is thread-safe in glibc.
            let released = unsafe { libc::malloc_trim(0) };
            tracing::debug!(released = released != 0, "malloc_trim complete");
        }
        Ok(())
    }
}

/// What one `apply` call did
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub applied: Vec<MitigationAction>,
    pub failed: Vec<(MitigationAction, String)>,
}

/// Applies mitigations for detected threats
pub struct MitigationEngine {
    janitor: Arc<Janitor>,
    state: Arc<MitigationState>,
    reclaimer: Arc<dyn MemoryReclaimer>,
    config: Arc<WardenConfig>,
    level: RwLock<ProtectionLevel>,
}

impl MitigationEngine {
    pub fn new(
        janitor: Arc<Janitor>,
        state: Arc<MitigationState>,
        reclaimer: Arc<dyn MemoryReclaimer>,
        config: Arc<WardenConfig>,
    ) -> Self {
        let level = config.warden.protection_level;
        Self {
            janitor,
            state,
            reclaimer,
            config,
            level: RwLock::new(level),
        }
    }

    pub fn level(&self) -> ProtectionLevel {
        *self.level.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_level(&self, level: ProtectionLevel) {
        *self.level.write().unwrap_or_else(|e| e.into_inner()) = level;
    }

    pub fn state(&self) -> &Arc<MitigationState> {
        &self.state
    }

    /// Plan and execute mitigations for `threats`, worst first
    pub async fn apply(&self, threats: &[Threat]) -> ApplyReport {
        let level = self.level();
        let mut ordered: Vec<&Threat> = threats.iter().collect();
        ordered.sort_by(|a, b| b.severity().cmp(&a.severity()));

        let mut actions: Vec<MitigationAction> = Vec::new();
        for threat in ordered {
            for action in MitigationAction::plan(threat, level) {
                if !actions.contains(&action) {
                    actions.push(action);
                }
            }
        }
        if !actions.is_empty() {
            tracing::info!(
                level = %level,
                threats = threats.len(),
                actions = actions.len(),
                "Applying mitigations"
            );
        }
        self.apply_actions(&actions).await
    }

    /// Apply the full emergency action set regardless of current threats
    pub async fn apply_emergency(&self) -> ApplyReport {
        tracing::warn!("Applying emergency protections");
        self.apply_actions(&MitigationAction::EMERGENCY).await
    }

    /// Execute `actions` in order; failures are recorded and skipped
    pub async fn apply_actions(&self, actions: &[MitigationAction]) -> ApplyReport {
        let mut report = ApplyReport::default();
        for &action in actions {
            match self.execute(action).await {
                Ok(()) => {
                    self.state.record_active(action.id());
                    report.applied.push(action);
                }
                Err(e) => {
                    tracing::warn!(action = %action, error = %e, "Mitigation failed, skipping");
                    report.failed.push((action, e.to_string()));
                }
            }
        }
        report
    }

    async fn execute(&self, action: MitigationAction) -> Result<()> {
        tracing::debug!(action = %action, "Executing mitigation");
        match action {
            MitigationAction::ReclaimMemory => self.reclaimer.reclaim()?,
            MitigationAction::LowMemoryMode => {
                self.state.update_flags(|f| f.low_memory = true);
                self.state.set_env(EnvOverride::WorkstationGc);
            }
            MitigationAction::ReduceParallelism => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(2);
                let jobs = (cpus / 2).max(1);
                self.cap_build_jobs(jobs);
            }
            MitigationAction::CpuBackoff => {
                tokio::time::sleep(self.config.mitigation.cpu_backoff).await;
            }
            MitigationAction::PurgeStaleTemp => {
                let report = self.janitor.purge_stale_temp().await;
                if report.failed > 0 {
                    return Err(WardenError::mitigation(
                        action.id(),
                        format!("{} temp entries could not be removed", report.failed),
                    ));
                }
            }
            MitigationAction::DisableCaching => {
                self.state.update_flags(|f| f.caching_disabled = true);
                self.state.set_env(EnvOverride::NoIncremental);
            }
            MitigationAction::OfflineMode => {
                self.state.update_flags(|f| f.offline = true);
                self.state.set_env(EnvOverride::Offline);
            }
            MitigationAction::ExtendTimeouts => {
                self.state.update_flags(|f| f.extended_timeouts = true);
                self.state
                    .set_env(EnvOverride::HttpTimeout(EXTENDED_HTTP_TIMEOUT_SECS));
            }
            MitigationAction::IoThrottle => {
                let delay = self.config.mitigation.io_delay;
                self.state.update_flags(|f| f.io_delay = Some(delay));
            }
            MitigationAction::KillOrphanedProcesses => {
                let report = self.janitor.kill_orphans().await?;
                if !report.failed.is_empty() {
                    return Err(WardenError::mitigation(
                        action.id(),
                        format!("could not kill pids {:?}", report.failed),
                    ));
                }
            }
            MitigationAction::ClearToolchainTemp => {
                let report = self.janitor.clear_toolchain_temp().await;
                if report.failed > 0 {
                    return Err(WardenError::mitigation(
                        action.id(),
                        format!("{} entries could not be removed", report.failed),
                    ));
                }
            }
            MitigationAction::SingleNodeBuild => {
                self.state.set_env(EnvOverride::NoNodeReuse);
                self.cap_build_jobs(1);
            }
            MitigationAction::DisableTelemetry => {
                self.state.set_env(EnvOverride::TelemetryOptOut);
            }
        }
        Ok(())
    }

    /// Lower the build-job cap; never raises an existing lower cap
    fn cap_build_jobs(&self, jobs: usize) {
        let mut effective = jobs;
        self.state.update_flags(|f| {
            effective = f.build_jobs.map_or(jobs, |current| current.min(jobs));
            f.build_jobs = Some(effective);
        });
        self.state.set_env(EnvOverride::BuildJobs(effective));
    }
}
