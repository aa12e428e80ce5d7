//! Protection coordinator
//!
//! The facade collaborators call. It owns one instance of every component,
//! guards the monitoring session with a lock so initialization and shutdown
//! happen at most once, and never lets an error escape: every entry point
//! logs and degrades to a boolean or a report.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::cleanup::{CleanupReport, Janitor, KillReport};
use crate::config::WardenConfig;
use crate::error::{Result, WardenError};
use crate::guard::{project_dir, BuildGuard, BuildReport, BuildRunner, CommandRunner};
use crate::health::HealthAggregator;
use crate::mitigation::{
    ApplyReport, MemoryReclaimer, MitigationAction, MitigationEngine, SystemReclaimer,
};
use crate::monitor::ContinuousMonitor;
use crate::probe::system::{SysinfoProbe, SysinfoProcessInspector};
use crate::probe::{ProcessInspector, SystemProbe};
use crate::scanner::ThreatScanner;
use crate::state::MitigationState;
use crate::types::{HealthLevel, HealthReport, ProtectionLevel};

/// Mitigations applied before a build on a degraded host
const DEGRADED_BUILD_ACTIONS: [MitigationAction; 3] = [
    MitigationAction::SingleNodeBuild,
    MitigationAction::ReduceParallelism,
    MitigationAction::DisableTelemetry,
];

const OPTIMAL_BUILD_ACTIONS: [MitigationAction; 1] = [MitigationAction::DisableTelemetry];

#[derive(Debug, Clone)]
struct MonitoringSession {
    level: ProtectionLevel,
    started_at: DateTime<Utc>,
    /// Initialization failed and the session runs with minimal protection
    fallback: bool,
}

/// Snapshot of the coordinator for callers and the CLI
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub initialized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<ProtectionLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub fallback: bool,
    pub monitoring: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health: Option<HealthLevel>,
    pub active_mitigations: Vec<String>,
    pub env_overrides: Vec<(String, String)>,
}

pub struct ProtectionCoordinator {
    config: Arc<WardenConfig>,
    state: Arc<MitigationState>,
    scanner: Arc<ThreatScanner>,
    aggregator: Arc<HealthAggregator>,
    engine: Arc<MitigationEngine>,
    janitor: Arc<Janitor>,
    guard: BuildGuard,
    monitor: ContinuousMonitor,
    session: Mutex<Option<MonitoringSession>>,
    last_report: RwLock<Option<HealthReport>>,
}

impl ProtectionCoordinator {
    pub fn new(
        probe: Arc<dyn SystemProbe>,
        inspector: Arc<dyn ProcessInspector>,
        reclaimer: Arc<dyn MemoryReclaimer>,
        runner: Arc<dyn BuildRunner>,
        config: WardenConfig,
    ) -> Self {
        let config = Arc::new(config);
        let state = Arc::new(MitigationState::new());
        let scanner = Arc::new(ThreatScanner::new(probe, inspector.clone(), config.clone()));
        let aggregator = Arc::new(HealthAggregator::new(scanner.clone(), config.clone()));
        let janitor = Arc::new(Janitor::new(inspector, state.clone(), config.clone()));
        let engine = Arc::new(MitigationEngine::new(
            janitor.clone(),
            state.clone(),
            reclaimer,
            config.clone(),
        ));
        let guard = BuildGuard::new(runner, janitor.clone(), state.clone(), config.clone());
        let monitor = ContinuousMonitor::new(aggregator.clone(), engine.clone(), config.clone());

        Self {
            config,
            state,
            scanner,
            aggregator,
            engine,
            janitor,
            guard,
            monitor,
            session: Mutex::new(None),
            last_report: RwLock::new(None),
        }
    }

    /// Coordinator over the live host and the configured build command
    pub fn with_system(config: WardenConfig) -> Self {
        let runner = Arc::new(CommandRunner::new(config.build.command.clone()));
        Self::new(
            Arc::new(SysinfoProbe::new()),
            Arc::new(SysinfoProcessInspector::new()),
            Arc::new(SystemReclaimer),
            runner,
            config,
        )
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn scanner(&self) -> &Arc<ThreatScanner> {
        &self.scanner
    }

    pub fn engine(&self) -> &Arc<MitigationEngine> {
        &self.engine
    }

    pub fn monitor(&self) -> &ContinuousMonitor {
        &self.monitor
    }

    /// Scan, mitigate and start monitoring at `level`.
    ///
    /// Returns `true` only for the call that performed initialization;
    /// concurrent and later calls return `false`. If initialization fails
    /// the session falls back to minimal protection without a monitor.
    pub async fn initialize(&self, level: ProtectionLevel) -> bool {
        let mut session = self.session.lock().await;
        if session.is_some() {
            tracing::debug!("Protection already initialized");
            return false;
        }

        let fallback = match self.try_initialize(level).await {
            Ok(()) => {
                tracing::info!(level = %level, "Protection initialized");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Initialization failed, falling back to minimal protection");
                self.monitor.stop().await;
                self.engine.set_level(ProtectionLevel::Minimal);
                true
            }
        };

        *session = Some(MonitoringSession {
            level: if fallback {
                ProtectionLevel::Minimal
            } else {
                level
            },
            started_at: Utc::now(),
            fallback,
        });
        true
    }

    async fn try_initialize(&self, level: ProtectionLevel) -> Result<()> {
        self.config.validate()?;
        self.engine.set_level(level);

        let initial = AssertUnwindSafe(async {
            let threats = self.scanner.scan().await;
            self.engine.apply(&threats).await
        })
        .catch_unwind()
        .await
        .map_err(|_| WardenError::Initialization("initial scan panicked".into()))?;
        tracing::info!(
            applied = initial.applied.len(),
            failed = initial.failed.len(),
            "Initial mitigations applied"
        );

        if !self.monitor.start(level) {
            return Err(WardenError::Initialization(
                "monitor already running".into(),
            ));
        }
        Ok(())
    }

    /// Fresh health assessment; also kept as the last known report
    pub async fn perform_health_check(&self) -> HealthReport {
        let report = self.aggregator.assess().await;
        *self.last_report.write().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        report
    }

    pub async fn apply_emergency_protections(&self) -> ApplyReport {
        self.engine.apply_emergency().await
    }

    /// Make the host ready to build `target`; `false` means do not build.
    pub async fn prepare_for_build(&self, target: &Path) -> bool {
        let mut report = self.perform_health_check().await;
        if report.is_critical() {
            tracing::warn!("Critical health before build, applying emergency protections");
            self.apply_emergency_protections().await;
            tokio::time::sleep(self.config.mitigation.settle_delay).await;
            report = self.perform_health_check().await;
            if report.is_critical() {
                tracing::error!(
                    threats = report.threats.len(),
                    "Health still critical after emergency protections; refusing to build"
                );
                return false;
            }
        }

        let dir = project_dir(target);
        self.scanner.watch_project(&dir);

        let actions: &[MitigationAction] = match report.overall {
            HealthLevel::Degraded | HealthLevel::Critical => &DEGRADED_BUILD_ACTIONS,
            HealthLevel::Optimal | HealthLevel::Unknown => &OPTIMAL_BUILD_ACTIONS,
        };
        self.engine.apply_actions(actions).await;

        let cleanup = async {
            let killed = self.janitor.kill_orphans().await;
            let purged = self.janitor.purge_stale_temp().await;
            (killed, purged)
        };
        match tokio::time::timeout(self.config.mitigation.cleanup_timeout, cleanup).await {
            Ok((Ok(killed), purged)) => tracing::debug!(
                killed = killed.killed.len(),
                removed = purged.removed,
                "Pre-build cleanup complete"
            ),
            Ok((Err(e), _)) => tracing::warn!(error = %e, "Pre-build orphan scan failed"),
            Err(_) => tracing::warn!("Pre-build cleanup timed out"),
        }

        tracing::info!(target = %target.display(), health = %report.overall, "Ready to build");
        true
    }

    /// Kill orphans, clear temp artifacts and drop build environment overrides
    pub async fn perform_post_build_cleanup(&self) -> CleanupReport {
        let processes = self.janitor.kill_orphans().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Post-build orphan scan failed");
            KillReport::default()
        });
        let files = self.janitor.clear_toolchain_temp().await;
        self.state.restore_env();
        tracing::info!(
            killed = processes.killed.len(),
            removed = files.removed,
            "Post-build cleanup complete"
        );
        CleanupReport { processes, files }
    }

    /// Prepare, build with retries, then clean up
    pub async fn run_protected_build(&self, target: &Path, max_attempts: u32) -> BuildReport {
        if !self.prepare_for_build(target).await {
            self.perform_post_build_cleanup().await;
            let mut report = BuildReport::new(target);
            report.refused = true;
            return report;
        }
        let report = self.guard.execute_with_report(target, max_attempts).await;
        self.perform_post_build_cleanup().await;
        report
    }

    pub async fn status(&self) -> SessionStatus {
        let session = self.session.lock().await.clone();
        let last_health = self
            .last_report
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|r| r.overall);
        SessionStatus {
            initialized: session.is_some(),
            level: session.as_ref().map(|s| s.level),
            started_at: session.as_ref().map(|s| s.started_at),
            fallback: session.as_ref().is_some_and(|s| s.fallback),
            monitoring: self.monitor.is_running(),
            last_health,
            active_mitigations: self.state.active(),
            env_overrides: self.state.env_overrides(),
        }
    }

    /// Stop monitoring and restore overrides; safe to call repeatedly
    pub async fn shutdown(&self) -> bool {
        let mut session = self.session.lock().await;
        if session.take().is_none() {
            return false;
        }
        self.monitor.stop().await;
        self.state.restore_env();
        tracing::info!("Protection shut down");
        true
    }
}
