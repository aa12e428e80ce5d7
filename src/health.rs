//! Health aggregation
//!
//! `HealthAggregator::assess` folds four independent signals into one
//! verdict: a penalty score from basic resource checks, the worst threat
//! from a full scan, and two narrow subsystem probes (build system and
//! runtime stability). The overall level is the worst of the four.
//!
//! The CPU penalty in the score and the CPU threat from the scan read the
//! same signal, so a saturated CPU counts twice. That is the established
//! behavior and is kept as-is.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::WardenConfig;
use crate::probe::{ProcessInspector, SystemProbe};
use crate::scanner::ThreatScanner;
use crate::types::{HealthLevel, HealthReport, Severity, Threat, ThreatCategory};

const MEMORY_PENALTY: u8 = 25;
const CPU_PENALTY: u8 = 20;
const ANTIVIRUS_PENALTY: u8 = 15;
const BUILD_PROCESS_PENALTY: u8 = 15;
const TEMP_SPACE_PENALTY: u8 = 20;

/// A narrow health capability of one subsystem
#[async_trait]
pub trait SubsystemProbe: Send + Sync {
    fn name(&self) -> &str;

    /// Current level; `Unknown` when the subsystem cannot be inspected
    async fn level(&self) -> HealthLevel;
}

/// Health of the build toolchain, from the number of live build processes
pub struct BuildSystemProbe {
    inspector: Arc<dyn ProcessInspector>,
    config: Arc<WardenConfig>,
}

impl BuildSystemProbe {
    pub fn new(inspector: Arc<dyn ProcessInspector>, config: Arc<WardenConfig>) -> Self {
        Self { inspector, config }
    }
}

#[async_trait]
impl SubsystemProbe for BuildSystemProbe {
    fn name(&self) -> &str {
        "build-system"
    }

    async fn level(&self) -> HealthLevel {
        let t = &self.config.thresholds;
        match self
            .inspector
            .find(&self.config.cleanup.build_tool_processes)
            .await
        {
            Ok(procs) if procs.len() > t.build_process_critical => HealthLevel::Critical,
            Ok(procs) if procs.len() > t.build_process_warning => HealthLevel::Degraded,
            Ok(_) => HealthLevel::Optimal,
            Err(e) => {
                tracing::debug!(error = %e, "Build-system probe failed");
                HealthLevel::Unknown
            }
        }
    }
}

/// Runtime stability, from host uptime
pub struct RuntimeStabilityProbe {
    probe: Arc<dyn SystemProbe>,
    config: Arc<WardenConfig>,
}

impl RuntimeStabilityProbe {
    pub fn new(probe: Arc<dyn SystemProbe>, config: Arc<WardenConfig>) -> Self {
        Self { probe, config }
    }
}

#[async_trait]
impl SubsystemProbe for RuntimeStabilityProbe {
    fn name(&self) -> &str {
        "runtime-stability"
    }

    async fn level(&self) -> HealthLevel {
        let t = &self.config.thresholds;
        match self.probe.uptime().await {
            Ok(up) => {
                if up > t.uptime_critical() {
                    HealthLevel::Critical
                } else if up > t.uptime_warning() {
                    HealthLevel::Degraded
                } else {
                    HealthLevel::Optimal
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Runtime-stability probe failed");
                HealthLevel::Unknown
            }
        }
    }
}

/// Combines scan results and subsystem probes into a `HealthReport`
pub struct HealthAggregator {
    scanner: Arc<ThreatScanner>,
    build_system: Box<dyn SubsystemProbe>,
    runtime: Box<dyn SubsystemProbe>,
    config: Arc<WardenConfig>,
}

impl HealthAggregator {
    /// Aggregator with the default subsystem probes over the scanner's probes
    pub fn new(scanner: Arc<ThreatScanner>, config: Arc<WardenConfig>) -> Self {
        let build_system = Box::new(BuildSystemProbe::new(
            scanner.inspector().clone(),
            config.clone(),
        ));
        let runtime = Box::new(RuntimeStabilityProbe::new(
            scanner.probe().clone(),
            config.clone(),
        ));
        Self::with_probes(scanner, build_system, runtime, config)
    }

    pub fn with_probes(
        scanner: Arc<ThreatScanner>,
        build_system: Box<dyn SubsystemProbe>,
        runtime: Box<dyn SubsystemProbe>,
        config: Arc<WardenConfig>,
    ) -> Self {
        Self {
            scanner,
            build_system,
            runtime,
            config,
        }
    }

    pub fn scanner(&self) -> &Arc<ThreatScanner> {
        &self.scanner
    }

    /// Compute a fresh health report
    pub async fn assess(&self) -> HealthReport {
        let (score, threats, build_system, runtime_stability) = tokio::join!(
            self.basic_score(),
            self.scanner.scan(),
            self.build_system.level(),
            self.runtime.level(),
        );

        let score_level = HealthLevel::from_score(score);
        let threat_level = HealthLevel::from_severity(
            threats.iter().map(Threat::severity).max().unwrap_or_default(),
        );
        let overall = score_level
            .max(threat_level)
            .max(build_system)
            .max(runtime_stability);

        let recommendations = self.recommendations(&threats, score, build_system, runtime_stability);

        tracing::info!(
            overall = %overall,
            score,
            threats = threats.len(),
            build_system = %build_system,
            runtime = %runtime_stability,
            "Health assessed"
        );

        HealthReport {
            timestamp: Utc::now(),
            overall,
            score,
            score_level,
            threat_level,
            build_system,
            runtime_stability,
            threats,
            recommendations,
        }
    }

    /// 100 minus fixed penalties for each resource problem found
    pub async fn basic_score(&self) -> u8 {
        let t = &self.config.thresholds;
        let probe = self.scanner.probe();
        let inspector = self.scanner.inspector();
        let mut penalty: u8 = 0;

        if let Ok(mb) = probe.available_memory_mb().await {
            if mb < t.memory_warning_mb {
                penalty += MEMORY_PENALTY;
            }
        }
        if let Ok(pct) = probe.cpu_usage_percent().await {
            if pct > t.cpu_penalty_percent {
                penalty += CPU_PENALTY;
            }
        }
        let av_limit = t.antivirus_working_set_mb * 1024 * 1024;
        if let Ok(av) = inspector.find(&self.config.cleanup.antivirus_processes).await {
            if av.iter().any(|p| p.memory_bytes > av_limit) {
                penalty += ANTIVIRUS_PENALTY;
            }
        }
        if let Ok(builds) = inspector.find(&self.config.cleanup.build_tool_processes).await {
            if builds.len() > t.build_process_warning {
                penalty += BUILD_PROCESS_PENALTY;
            }
        }
        if let Ok(mb) = probe.temp_free_space_mb().await {
            if mb < t.temp_space_warning_mb {
                penalty += TEMP_SPACE_PENALTY;
            }
        }
        100u8.saturating_sub(penalty)
    }

    fn recommendations(
        &self,
        threats: &[Threat],
        score: u8,
        build_system: HealthLevel,
        runtime: HealthLevel,
    ) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |s: String| {
            if !out.contains(&s) {
                out.push(s);
            }
        };

        for category in ThreatCategory::ALL {
            let elevated = threats.iter().any(|t| {
                t.category() == category
                    && t.severity() >= Severity::Medium
                    && !t.is_detection_error()
            });
            if elevated {
                push(category_recommendation(category).to_string());
            }
        }
        if HealthLevel::from_score(score) > HealthLevel::Optimal {
            push(format!(
                "Resource score {score}/100: free memory and temp space before building"
            ));
        }
        if build_system > HealthLevel::Optimal {
            push("Too many concurrent build-tool processes; kill orphaned builds first".into());
        }
        if runtime > HealthLevel::Optimal {
            push(format!(
                "Host uptime exceeds {} days; schedule a restart",
                self.config.thresholds.uptime_warning_days
            ));
        }
        out
    }
}

fn category_recommendation(category: ThreatCategory) -> &'static str {
    match category {
        ThreatCategory::Memory => "Close memory-heavy applications or build in low-memory mode",
        ThreatCategory::Cpu => "Reduce build parallelism until CPU load drops",
        ThreatCategory::Storage => "Free disk space on the system volume",
        ThreatCategory::Network => "Restore network connectivity or build offline",
        ThreatCategory::Security => {
            "Exclude build-output directories from antivirus real-time scanning"
        }
        ThreatCategory::SystemStability => "Restart the host to clear accumulated instability",
        ThreatCategory::FileSystem => "Release locked build outputs and shorten deep paths",
        ThreatCategory::DevEnvironment => "Stop stray build-tool processes before building",
    }
}
