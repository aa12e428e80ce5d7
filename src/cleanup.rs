//! Cleanup actions shared by mitigations, the build guard and post-build
//!
//! Every action is best-effort: individual failures are collected into the
//! returned report and logged, never raised.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::config::WardenConfig;
use crate::error::Result;
use crate::probe::{KillOutcome, ProcessInspector};
use crate::state::MitigationState;

/// Outcome of an orphan-kill pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillReport {
    pub killed: Vec<u32>,
    /// Younger than the orphan age threshold
    pub spared: Vec<u32>,
    /// Exited before termination; counted as success
    pub vanished: Vec<u32>,
    pub failed: Vec<u32>,
}

/// Outcome of a file cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub removed: usize,
    pub failed: usize,
}

impl PurgeReport {
    fn merge(&mut self, other: PurgeReport) {
        self.removed += other.removed;
        self.failed += other.failed;
    }
}

/// Everything a full cleanup pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub processes: KillReport,
    pub files: PurgeReport,
}

/// Performs process and file cleanup
pub struct Janitor {
    inspector: Arc<dyn ProcessInspector>,
    state: Arc<MitigationState>,
    config: Arc<WardenConfig>,
}

impl Janitor {
    pub fn new(
        inspector: Arc<dyn ProcessInspector>,
        state: Arc<MitigationState>,
        config: Arc<WardenConfig>,
    ) -> Self {
        Self {
            inspector,
            state,
            config,
        }
    }

    /// Kill build-tool processes older than the configured orphan age
    pub async fn kill_orphans(&self) -> Result<KillReport> {
        self.kill_orphans_older_than(self.config.cleanup.orphan_age)
            .await
    }

    /// Kill build-tool processes at least `min_age` old; younger ones are spared
    pub async fn kill_orphans_older_than(&self, min_age: Duration) -> Result<KillReport> {
        let own_pid = std::process::id();
        let candidates = self
            .inspector
            .find(&self.config.cleanup.build_tool_processes)
            .await?;

        let mut report = KillReport::default();
        for proc in candidates.into_iter().filter(|p| p.pid != own_pid) {
            if proc.age < min_age {
                report.spared.push(proc.pid);
                continue;
            }
            match self.inspector.kill(proc.pid).await {
                Ok(KillOutcome::Killed) => {
                    tracing::info!(pid = proc.pid, name = %proc.name, age_secs = proc.age.as_secs(), "Killed orphaned build process");
                    report.killed.push(proc.pid);
                }
                Ok(KillOutcome::AlreadyGone) => report.vanished.push(proc.pid),
                Err(e) => {
                    tracing::warn!(pid = proc.pid, name = %proc.name, error = %e, "Failed to kill build process");
                    report.failed.push(proc.pid);
                }
            }
        }
        Ok(report)
    }

    /// Delete files older than the stale age from the configured temp dirs
    pub async fn purge_stale_temp(&self) -> PurgeReport {
        let dirs = self.config.cleanup.temp_dirs.clone();
        let max_age = self.config.cleanup.stale_temp_age;
        let delay = self.state.io_delay();
        run_blocking(move || purge_older_than(&dirs, max_age, delay)).await
    }

    /// Empty the toolchain temp/cache directories
    pub async fn clear_toolchain_temp(&self) -> PurgeReport {
        let mut dirs = self.config.cleanup.toolchain_temp_dirs.clone();
        dirs.extend(self.config.cleanup.temp_dirs.iter().cloned());
        let delay = self.state.io_delay();
        run_blocking(move || clear_contents(&dirs, delay)).await
    }

    /// Remove the build-output directories of the project at `project_dir`
    pub async fn remove_build_outputs(&self, project_dir: &Path) -> PurgeReport {
        let dirs: Vec<PathBuf> = self
            .config
            .build
            .output_dirs
            .iter()
            .map(|d| project_dir.join(d))
            .collect();
        let delay = self.state.io_delay();
        run_blocking(move || remove_dirs(&dirs, delay)).await
    }

    /// Orphan kill, build-output removal and temp clearing in one pass
    pub async fn full_pass(&self, project_dir: Option<&Path>) -> CleanupReport {
        let processes = match self.kill_orphans().await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "Orphan scan failed during cleanup");
                KillReport::default()
            }
        };
        let mut files = PurgeReport::default();
        if let Some(dir) = project_dir {
            files.merge(self.remove_build_outputs(dir).await);
        }
        files.merge(self.clear_toolchain_temp().await);
        tracing::debug!(
            killed = processes.killed.len(),
            removed = files.removed,
            failed = files.failed,
            "Cleanup pass complete"
        );
        CleanupReport { processes, files }
    }
}

async fn run_blocking(f: impl FnOnce() -> PurgeReport + Send + 'static) -> PurgeReport {
    match tokio::task::spawn_blocking(f).await {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!(error = %e, "Cleanup task panicked");
            PurgeReport {
                removed: 0,
                failed: 1,
            }
        }
    }
}

fn throttle(delay: Option<Duration>) {
    if let Some(d) = delay {
        std::thread::sleep(d);
    }
}

fn remove_path(path: &Path, report: &mut PurgeReport, delay: Option<Duration>) {
    throttle(delay);
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => report.removed += 1,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Could not remove");
            report.failed += 1;
        }
    }
}

fn entries(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}

fn purge_older_than(dirs: &[PathBuf], max_age: Duration, delay: Option<Duration>) -> PurgeReport {
    let now = SystemTime::now();
    let mut report = PurgeReport::default();
    for dir in dirs {
        for path in entries(dir) {
            let stale = std::fs::symlink_metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age >= max_age);
            if stale {
                remove_path(&path, &mut report, delay);
            }
        }
    }
    report
}

fn clear_contents(dirs: &[PathBuf], delay: Option<Duration>) -> PurgeReport {
    let mut report = PurgeReport::default();
    for dir in dirs {
        for path in entries(dir) {
            remove_path(&path, &mut report, delay);
        }
    }
    report
}

fn remove_dirs(dirs: &[PathBuf], delay: Option<Duration>) -> PurgeReport {
    let mut report = PurgeReport::default();
    for dir in dirs.iter().filter(|d| d.exists()) {
        remove_path(dir, &mut report, delay);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::FakeProcessInspector;
    use crate::probe::ProcessInfo;

    fn janitor_with(
        inspector: Arc<FakeProcessInspector>,
        f: impl FnOnce(&mut WardenConfig),
    ) -> Janitor {
        let mut config = WardenConfig::default();
        f(&mut config);
        Janitor::new(inspector, Arc::new(MitigationState::new()), Arc::new(config))
    }

    #[tokio::test]
    async fn test_kill_orphans_spares_young_processes() {
        let inspector = Arc::new(FakeProcessInspector::new(vec![
            ProcessInfo::new(1, "rustc", Duration::from_secs(10 * 60), 0),
            ProcessInfo::new(2, "rustc", Duration::from_secs(30), 0),
            ProcessInfo::new(3, "cargo", Duration::from_secs(6 * 60), 0),
            ProcessInfo::new(4, "firefox", Duration::from_secs(3600), 0),
        ]));
        let janitor = janitor_with(inspector.clone(), |_| {});

        let report = janitor.kill_orphans().await.unwrap();
        assert_eq!(report.killed, vec![1, 3]);
        assert_eq!(report.spared, vec![2]);
        assert_eq!(inspector.killed(), vec![1, 3]);
        // unrelated process untouched
        assert!(inspector.remaining().iter().any(|p| p.pid == 4));
    }

    #[tokio::test]
    async fn test_kill_orphans_tolerates_exit_race() {
        let inspector = Arc::new(FakeProcessInspector::new(vec![ProcessInfo::new(
            9,
            "cargo",
            Duration::from_secs(600),
            0,
        )]));
        inspector.vanish_on_kill(9);
        let janitor = janitor_with(inspector, |_| {});
        let report = janitor.kill_orphans().await.unwrap();
        assert_eq!(report.vanished, vec![9]);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn test_purge_stale_temp_keeps_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fresh.tmp"), b"x").unwrap();
        let janitor = janitor_with(Arc::default(), |c| {
            c.cleanup.temp_dirs = vec![dir.path().to_path_buf()];
            c.cleanup.stale_temp_age = Duration::from_secs(3600);
        });
        let report = janitor.purge_stale_temp().await;
        assert_eq!(report.removed, 0);
        assert!(dir.path().join("fresh.tmp").exists());

        let janitor = janitor_with(Arc::default(), |c| {
            c.cleanup.temp_dirs = vec![dir.path().to_path_buf()];
            c.cleanup.stale_temp_age = Duration::ZERO;
        });
        let report = janitor.purge_stale_temp().await;
        assert_eq!(report.removed, 1);
        assert!(!dir.path().join("fresh.tmp").exists());
    }

    #[tokio::test]
    async fn test_remove_build_outputs() {
        let project = tempfile::tempdir().unwrap();
        let incremental = project.path().join("target/debug/incremental");
        std::fs::create_dir_all(incremental.join("app-1")).unwrap();
        std::fs::write(project.path().join("Cargo.toml"), b"[package]").unwrap();

        let janitor = janitor_with(Arc::default(), |_| {});
        let report = janitor.remove_build_outputs(project.path()).await;
        assert_eq!(report.removed, 1);
        assert!(!incremental.exists());
        assert!(project.path().join("Cargo.toml").exists());
    }

    #[tokio::test]
    async fn test_clear_toolchain_temp_empties_but_keeps_dir() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp.path().join("cache")).unwrap();
        std::fs::write(temp.path().join("cache/blob"), b"x").unwrap();
        std::fs::write(temp.path().join("lock"), b"").unwrap();

        let janitor = janitor_with(Arc::default(), |c| {
            c.cleanup.temp_dirs = Vec::new();
            c.cleanup.toolchain_temp_dirs = vec![temp.path().to_path_buf()];
        });
        let report = janitor.clear_toolchain_temp().await;
        assert_eq!(report.removed, 2);
        assert!(temp.path().exists());
        assert!(std::fs::read_dir(temp.path()).unwrap().next().is_none());
    }
}
