//! Threat scanner: multi-category host and toolchain inspection
//!
//! `ThreatScanner::scan` runs every detector against the configured probes
//! and returns a fresh list of threats. A check that cannot complete turns
//! into a Low-severity detection-error threat in its own category, so one
//! failing probe never hides the rest of the scan.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::config::WardenConfig;
use crate::error::Result;
use crate::probe::{ProcessInspector, SystemProbe};
use crate::types::{Severity, Threat, ThreatCategory};

/// Threats gathered by one detector
struct Findings {
    category: ThreatCategory,
    threats: Vec<Threat>,
}

impl Findings {
    fn new(category: ThreatCategory) -> Self {
        Self {
            category,
            threats: Vec::new(),
        }
    }

    fn threat(&self, severity: Severity, description: String, mitigation: &str) -> Threat {
        Threat::new(self.category, severity, description, mitigation)
    }

    fn record(&mut self, result: Result<Option<Threat>>) {
        match result {
            Ok(Some(threat)) => self.threats.push(threat),
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(category = %self.category, error = %e, "Detection check failed");
                self.threats.push(Threat::detection_error(self.category, &e));
            }
        }
    }
}

/// Stateless multi-category threat detector
pub struct ThreatScanner {
    probe: Arc<dyn SystemProbe>,
    inspector: Arc<dyn ProcessInspector>,
    config: Arc<WardenConfig>,
    /// Build-output directories inspected by the file-system detector
    build_roots: RwLock<Vec<PathBuf>>,
}

impl ThreatScanner {
    pub fn new(
        probe: Arc<dyn SystemProbe>,
        inspector: Arc<dyn ProcessInspector>,
        config: Arc<WardenConfig>,
    ) -> Self {
        Self {
            probe,
            inspector,
            config,
            build_roots: RwLock::new(Vec::new()),
        }
    }

    /// Include a project's build-output directories in file-system checks
    pub fn watch_project(&self, project_dir: &Path) {
        let mut roots = self.build_roots.write().unwrap_or_else(|e| e.into_inner());
        for dir in &self.config.build.output_dirs {
            let root = project_dir.join(dir);
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
    }

    pub fn build_roots(&self) -> Vec<PathBuf> {
        self.build_roots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn probe(&self) -> &Arc<dyn SystemProbe> {
        &self.probe
    }

    pub fn inspector(&self) -> &Arc<dyn ProcessInspector> {
        &self.inspector
    }

    /// Run every detector and return the combined threat list
    ///
    /// Never fails. Detectors run concurrently; the result lists them in
    /// category order.
    pub async fn scan(&self) -> Vec<Threat> {
        let (memory, cpu, storage, network, security, stability, file_system, dev_env) = tokio::join!(
            self.detect_memory(),
            self.detect_cpu(),
            self.detect_storage(),
            self.detect_network(),
            self.detect_security(),
            self.detect_system_stability(),
            self.detect_file_system(),
            self.detect_dev_environment(),
        );

        let threats: Vec<Threat> = [
            memory,
            cpu,
            storage,
            network,
            security,
            stability,
            file_system,
            dev_env,
        ]
        .into_iter()
        .flat_map(|f| f.threats)
        .collect();

        tracing::debug!(
            threats = threats.len(),
            worst = %threats.iter().map(Threat::severity).max().unwrap_or_default(),
            "Threat scan complete"
        );
        threats
    }

    async fn detect_memory(&self) -> Findings {
        let mut f = Findings::new(ThreatCategory::Memory);
        let t = &self.config.thresholds;
        let result = self.probe.available_memory_mb().await.map(|mb| {
            if mb < t.memory_critical_mb {
                Some(f.threat(
                    Severity::Critical,
                    format!("Available memory critically low: {mb}MB"),
                    "Reclaim memory and close memory-heavy applications",
                ))
            } else if mb < t.memory_warning_mb {
                Some(f.threat(
                    Severity::Medium,
                    format!("Available memory low: {mb}MB"),
                    "Enable low-memory build mode",
                ))
            } else {
                None
            }
        });
        f.record(result);
        f
    }

    async fn detect_cpu(&self) -> Findings {
        let mut f = Findings::new(ThreatCategory::Cpu);
        let t = &self.config.thresholds;
        let result = self.probe.cpu_usage_percent().await.map(|pct| {
            if pct > t.cpu_high_percent {
                Some(f.threat(
                    Severity::High,
                    format!("CPU saturated: {pct:.1}%"),
                    "Reduce build parallelism",
                ))
            } else if pct > t.cpu_warning_percent {
                Some(f.threat(
                    Severity::Medium,
                    format!("CPU usage elevated: {pct:.1}%"),
                    "Avoid starting additional builds",
                ))
            } else {
                None
            }
        });
        f.record(result);
        f
    }

    async fn detect_storage(&self) -> Findings {
        let mut f = Findings::new(ThreatCategory::Storage);
        let limit = self.config.thresholds.disk_critical_mb;
        let result = self.probe.system_free_space_mb().await.map(|mb| {
            (mb < limit).then(|| {
                f.threat(
                    Severity::Critical,
                    format!("System volume nearly full: {mb}MB free"),
                    "Purge temp files and build caches",
                )
            })
        });
        f.record(result);
        f
    }

    async fn detect_network(&self) -> Findings {
        let mut f = Findings::new(ThreatCategory::Network);
        let min_speed = self.config.thresholds.link_speed_min_mbps;
        match self.probe.network_interfaces().await {
            Ok(interfaces) => {
                let active: Vec<_> = interfaces
                    .iter()
                    .filter(|i| i.up && !i.loopback)
                    .collect();
                if active.is_empty() {
                    let t = f.threat(
                        Severity::Medium,
                        "No active network interface".into(),
                        "Switch package restore to offline mode",
                    );
                    f.record(Ok(Some(t)));
                }
                for iface in active {
                    if let Some(speed) = iface.speed_mbps.filter(|s| *s < min_speed) {
                        let t = f.threat(
                            Severity::Low,
                            format!("Slow link on {}: {speed}Mbps", iface.name),
                            "Extend network timeouts",
                        );
                        f.record(Ok(Some(t)));
                    }
                }
            }
            Err(e) => f.record(Err(e)),
        }
        f
    }

    async fn detect_security(&self) -> Findings {
        let mut f = Findings::new(ThreatCategory::Security);

        let elevated = self.probe.is_elevated().await.map(|elevated| {
            (!elevated).then(|| {
                f.threat(
                    Severity::Low,
                    "Running without elevated privileges".into(),
                    "Some cleanup actions may be refused",
                )
            })
        });
        f.record(elevated);

        let av_limit = self.config.thresholds.antivirus_working_set_mb * 1024 * 1024;
        let antivirus = self
            .inspector
            .find(&self.config.cleanup.antivirus_processes)
            .await
            .map(|procs| {
                let heavy: Vec<_> = procs.iter().filter(|p| p.memory_bytes > av_limit).collect();
                heavy.first().map(|p| {
                    f.threat(
                        Severity::Medium,
                        format!(
                            "Antivirus '{}' active with {}MB working set",
                            p.name,
                            p.memory_bytes / (1024 * 1024)
                        ),
                        "Throttle build I/O; exclude build directories from scanning",
                    )
                })
            });
        f.record(antivirus);

        let realtime = self.probe.realtime_protection_enabled().await.map(|on| {
            on.then(|| {
                f.threat(
                    Severity::Low,
                    "Real-time malware protection is enabled".into(),
                    "Exclude build-output directories from real-time scanning",
                )
            })
        });
        f.record(realtime);
        f
    }

    async fn detect_system_stability(&self) -> Findings {
        let mut f = Findings::new(ThreatCategory::SystemStability);
        let t = &self.config.thresholds;

        let uptime = self.probe.uptime().await.map(|up| {
            (up > t.uptime_warning()).then(|| {
                f.threat(
                    Severity::Low,
                    format!("System up for {} days", up.as_secs() / 86_400),
                    "Schedule a restart",
                )
            })
        });
        f.record(uptime);

        let thermal = self.sustained_cpu().await.map(|(first, second)| {
            (first > t.cpu_sustained_percent && second > t.cpu_sustained_percent).then(|| {
                f.threat(
                    Severity::High,
                    format!("Sustained CPU load ({first:.0}%, {second:.0}%); possible thermal throttling"),
                    "Kill orphaned build processes and back off",
                )
            })
        });
        f.record(thermal);

        let errors = self.probe.recent_error_log_entries().await.map(|count| {
            (count >= t.error_log_min_entries && count > 0).then(|| {
                f.threat(
                    Severity::Medium,
                    format!("{count} OS error-log entries in the last hour"),
                    "Inspect the system log before building",
                )
            })
        });
        f.record(errors);
        f
    }

    async fn sustained_cpu(&self) -> Result<(f32, f32)> {
        let first = self.probe.cpu_usage_percent().await?;
        let second = self.probe.cpu_usage_percent().await?;
        Ok((first, second))
    }

    async fn detect_file_system(&self) -> Findings {
        let mut f = Findings::new(ThreatCategory::FileSystem);
        let roots = self.build_roots();

        let locked = self.probe.locked_files(&roots).await.map(|files| {
            files.first().map(|first| {
                f.threat(
                    Severity::Medium,
                    format!(
                        "{} locked file(s) in build output, e.g. {}",
                        files.len(),
                        first.display()
                    ),
                    "Kill orphaned build processes holding output files",
                )
            })
        });
        f.record(locked);

        let limit = self.config.thresholds.max_path_len;
        let long = self.probe.long_paths(&roots, limit).await.map(|paths| {
            paths.first().map(|first| {
                f.threat(
                    Severity::Medium,
                    format!(
                        "{} path(s) longer than {limit} characters, e.g. {}",
                        paths.len(),
                        first.display()
                    ),
                    "Move the project closer to the volume root",
                )
            })
        });
        f.record(long);

        let handle_limit = self.config.thresholds.handle_count_warning;
        let handles = self.probe.handle_count().await.map(|count| {
            (count > handle_limit).then(|| {
                f.threat(
                    Severity::Medium,
                    format!("Process holds {count} open handles"),
                    "Restart the host application",
                )
            })
        });
        f.record(handles);
        f
    }

    async fn detect_dev_environment(&self) -> Findings {
        let mut f = Findings::new(ThreatCategory::DevEnvironment);
        let t = &self.config.thresholds;

        let builds = self
            .inspector
            .find(&self.config.cleanup.build_tool_processes)
            .await
            .map(|procs| {
                let count = procs.len();
                if count > t.build_process_critical {
                    Some(f.threat(
                        Severity::High,
                        format!("{count} concurrent build-tool processes"),
                        "Kill orphaned build-tool processes",
                    ))
                } else if count > t.build_process_warning {
                    Some(f.threat(
                        Severity::Medium,
                        format!("{count} concurrent build-tool processes"),
                        "Build with a single node",
                    ))
                } else {
                    None
                }
            });
        f.record(builds);

        let versions = self
            .probe
            .toolchain_versions(&self.config.cleanup.toolchain_dirs)
            .await
            .map(|count| {
                (count > t.toolchain_versions_warning).then(|| {
                    f.threat(
                        Severity::Low,
                        format!("{count} toolchain versions installed"),
                        "Uninstall unused toolchains",
                    )
                })
            });
        f.record(versions);
        f
    }
}
