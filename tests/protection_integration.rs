//! Protection subsystem integration tests
//!
//! End-to-end tests driving `ProtectionCoordinator` over fake probes, a fake
//! process table and scripted build runners. Covers detection, mitigation,
//! health aggregation, concurrent initialization, resilient builds and
//! post-build cleanup.

use a3s_warden::guard::BuildOutput;
use a3s_warden::mitigation::MemoryReclaimer;
use a3s_warden::probe::fake::{FakeProbe, FakeProcessInspector, ProbeReadings};
use a3s_warden::probe::ProcessInfo;
use a3s_warden::{
    AttemptOutcome, BuildRunner, HealthLevel, ProtectionCoordinator, ProtectionLevel, Result,
    Severity, ThreatCategory, WardenConfig,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PIPE_BREAK: &str = "error MSB4166: Child node \"2\" exited prematurely. Shutting down.";

#[derive(Default)]
struct CountingReclaimer(AtomicUsize);

impl MemoryReclaimer for CountingReclaimer {
    fn reclaim(&self) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Replays scripted stderr/exit pairs; each run leaves an old build-tool
/// process and a fresh incremental directory behind, like a crashed build
struct ScriptedRunner {
    script: Mutex<Vec<(i32, &'static str)>>,
    calls: AtomicUsize,
    inspector: Arc<FakeProcessInspector>,
    next_pid: AtomicU32,
}

impl ScriptedRunner {
    fn new(script: Vec<(i32, &'static str)>, inspector: Arc<FakeProcessInspector>) -> Self {
        Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
            inspector,
            next_pid: AtomicU32::new(100),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildRunner for ScriptedRunner {
    async fn run(
        &self,
        target: &Path,
        _timeout: Duration,
        _env: &[(String, String)],
    ) -> Result<BuildOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.inspector.add(ProcessInfo::new(
            pid,
            "rustc",
            Duration::from_secs(10 * 60),
            0,
        ));
        if let Some(dir) = target.parent() {
            let _ = std::fs::create_dir_all(dir.join("target/debug/incremental/app-1"));
        }

        let mut script = self.script.lock().unwrap();
        let (code, stderr) = if script.is_empty() {
            (1, "")
        } else {
            script.remove(0)
        };
        Ok(BuildOutput {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
            timed_out: false,
        })
    }
}

struct Harness {
    coordinator: ProtectionCoordinator,
    probe: Arc<FakeProbe>,
    inspector: Arc<FakeProcessInspector>,
    runner: Arc<ScriptedRunner>,
    reclaimer: Arc<CountingReclaimer>,
}

fn harness(readings: ProbeReadings, script: Vec<(i32, &'static str)>) -> Harness {
    harness_with(readings, Vec::new(), script)
}

fn harness_with(
    readings: ProbeReadings,
    processes: Vec<ProcessInfo>,
    script: Vec<(i32, &'static str)>,
) -> Harness {
    let mut config = WardenConfig::default();
    config.cleanup.temp_dirs = Vec::new();
    config.build.retry_delay = Duration::from_millis(1);
    config.mitigation.settle_delay = Duration::from_millis(1);
    config.monitor.interval = Duration::from_secs(3600);

    let probe = Arc::new(FakeProbe::new(readings));
    let inspector = Arc::new(FakeProcessInspector::new(processes));
    let runner = Arc::new(ScriptedRunner::new(script, inspector.clone()));
    let reclaimer = Arc::new(CountingReclaimer::default());
    let coordinator = ProtectionCoordinator::new(
        probe.clone(),
        inspector.clone(),
        reclaimer.clone(),
        runner.clone(),
        config,
    );
    Harness {
        coordinator,
        probe,
        inspector,
        runner,
        reclaimer,
    }
}

fn project() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("Cargo.toml");
    std::fs::write(&target, "[package]\nname = \"app\"\n").unwrap();
    (dir, target)
}

// ─── Detection & Health ──────────────────────────────────────────

#[tokio::test]
async fn test_all_healthy_inputs_are_optimal() {
    let h = harness(ProbeReadings::healthy(), Vec::new());
    let report = h.coordinator.perform_health_check().await;
    assert!(report.threats.is_empty());
    assert_eq!(report.overall, HealthLevel::Optimal);
    assert_eq!(report.score, 100);
    assert!(h.probe.cpu_samples() > 0);
}

#[tokio::test]
async fn test_low_memory_is_critical_and_reclaims_once_per_apply() {
    let mut r = ProbeReadings::healthy();
    r.available_memory_mb = 200;
    let h = harness(r, Vec::new());

    let threats = h.coordinator.scanner().scan().await;
    let memory: Vec<_> = threats
        .iter()
        .filter(|t| t.category() == ThreatCategory::Memory)
        .collect();
    assert_eq!(memory.len(), 1);
    assert_eq!(memory[0].severity(), Severity::Critical);

    // duplicates in one call still reclaim once
    let doubled = vec![memory[0].clone(), memory[0].clone()];
    h.coordinator.engine().apply(&doubled).await;
    assert_eq!(h.reclaimer.0.load(Ordering::SeqCst), 1);

    h.coordinator.engine().apply(&threats).await;
    assert_eq!(h.reclaimer.0.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_overall_is_worst_component() {
    let cases: Vec<Box<dyn Fn(&mut ProbeReadings)>> = vec![
        Box::new(|_| {}),
        Box::new(|r| r.available_memory_mb = 800),
        Box::new(|r| r.cpu_percent = 97.0),
        Box::new(|r| r.uptime = Duration::from_secs(10 * 86_400)),
        Box::new(|r| r.uptime = Duration::from_secs(40 * 86_400)),
        Box::new(|r| r.system_free_mb = 100),
        Box::new(|r| {
            r.temp_free_mb = 10;
            r.interfaces.clear();
        }),
    ];
    for case in cases {
        let mut r = ProbeReadings::healthy();
        case(&mut r);
        let h = harness(r, Vec::new());
        let report = h.coordinator.perform_health_check().await;
        let worst = [
            report.score_level,
            report.threat_level,
            report.build_system,
            report.runtime_stability,
        ]
        .into_iter()
        .max()
        .unwrap();
        assert_eq!(report.overall, worst);
    }
}

#[tokio::test]
async fn test_many_build_processes_and_orphan_kill() {
    let procs = vec![
        ProcessInfo::new(11, "rustc", Duration::from_secs(3600), 0),
        ProcessInfo::new(12, "cargo", Duration::from_secs(20 * 60), 0),
        ProcessInfo::new(13, "MSBuild.exe", Duration::from_secs(6 * 60), 0),
        ProcessInfo::new(14, "rustc", Duration::from_secs(5), 0),
        ProcessInfo::new(15, "cargo", Duration::from_secs(60), 0),
        ProcessInfo::new(16, "VBCSCompiler", Duration::from_secs(120), 0),
    ];
    let h = harness_with(ProbeReadings::healthy(), procs, Vec::new());

    let threats = h.coordinator.scanner().scan().await;
    assert!(threats
        .iter()
        .any(|t| t.category() == ThreatCategory::DevEnvironment
            && t.severity() >= Severity::Medium));

    let cleanup = h.coordinator.perform_post_build_cleanup().await;
    assert_eq!(cleanup.processes.killed, vec![11, 12, 13]);
    assert_eq!(cleanup.processes.spared, vec![14, 15, 16]);
    let left: Vec<u32> = h.inspector.remaining().iter().map(|p| p.pid).collect();
    assert_eq!(left, vec![14, 15, 16]);
}

// ─── Initialization ──────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_initialize_runs_once() {
    let h = harness(ProbeReadings::healthy(), Vec::new());
    let coordinator = Arc::new(h.coordinator);
    let mut events = coordinator.monitor().subscribe();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let c = coordinator.clone();
            tokio::spawn(async move { c.initialize(ProtectionLevel::Standard).await })
        })
        .collect();
    let mut performed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            performed += 1;
        }
    }
    assert_eq!(performed, 1);

    let status = coordinator.status().await;
    assert!(status.initialized);
    assert!(status.monitoring);

    // exactly one monitor start
    let mut starts = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, a3s_warden::MonitorEvent::Started { .. }) {
            starts += 1;
        }
    }
    assert_eq!(starts, 1);

    assert!(coordinator.shutdown().await);
    assert!(!coordinator.shutdown().await);
}

// ─── Resilient Builds ────────────────────────────────────────────

#[tokio::test]
async fn test_always_pipe_break_cleans_before_every_retry() {
    let h = harness(
        ProbeReadings::healthy(),
        vec![(1, PIPE_BREAK), (1, PIPE_BREAK), (1, PIPE_BREAK)],
    );
    let (_dir, target) = project();

    let report = h.coordinator.run_protected_build(&target, 3).await;
    assert!(!report.succeeded);
    assert!(!report.refused);
    assert_eq!(h.runner.calls(), 3);
    assert_eq!(report.attempts.len(), 3);
    assert!(report
        .attempts
        .iter()
        .all(|a| a.outcome == AttemptOutcome::PipeBreak));

    assert!(report.attempts[0].cleaned_before.is_none());
    for (i, attempt) in report.attempts.iter().enumerate().skip(1) {
        let cleanup = attempt.cleaned_before.as_ref().unwrap();
        // the process left behind by the previous attempt
        assert_eq!(cleanup.processes.killed, vec![100 + i as u32 - 1]);
        assert!(cleanup.files.removed >= 1);
    }

    // post-build cleanup took the last one
    assert_eq!(h.inspector.killed(), vec![100, 101, 102]);
    assert!(h.inspector.remaining().is_empty());
}

#[tokio::test]
async fn test_success_on_second_attempt_stops_retrying() {
    let h = harness(ProbeReadings::healthy(), vec![(1, PIPE_BREAK), (0, "")]);
    let (_dir, target) = project();

    assert!(h.coordinator.run_protected_build(&target, 3).await.succeeded);
    assert_eq!(h.runner.calls(), 2);

    // one retry cleanup and one post-build cleanup, no third cycle
    assert_eq!(h.inspector.killed(), vec![100, 101]);
}

#[tokio::test]
async fn test_ordinary_failure_is_retried_too() {
    let h = harness(
        ProbeReadings::healthy(),
        vec![(101, "error[E0425]: cannot find value `x`"), (0, "")],
    );
    let (_dir, target) = project();
    let report = h.coordinator.run_protected_build(&target, 2).await;
    assert!(report.succeeded);
    assert_eq!(report.attempts[0].outcome, AttemptOutcome::Failed);
    assert_eq!(report.attempts[1].outcome, AttemptOutcome::Success);
}

#[tokio::test]
async fn test_persistent_critical_refuses_to_build() {
    let mut r = ProbeReadings::healthy();
    r.available_memory_mb = 100;
    let h = harness(r, vec![(0, "")]);
    let (_dir, target) = project();

    assert!(!h.coordinator.prepare_for_build(&target).await);
    let report = h.coordinator.run_protected_build(&target, 3).await;
    assert!(!report.succeeded);
    assert!(report.refused);
    assert!(report.attempts.is_empty());
    assert_eq!(h.runner.calls(), 0);
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["refused"], true);

    // emergency protections ran before giving up
    let status = h.coordinator.status().await;
    assert!(status
        .active_mitigations
        .contains(&"low-memory-mode".to_string()));
    assert_eq!(status.last_health, Some(HealthLevel::Critical));
}

#[tokio::test]
async fn test_post_build_restores_environment() {
    let mut r = ProbeReadings::healthy();
    r.available_memory_mb = 900;
    let h = harness(r, vec![(0, "")]);
    let (_dir, target) = project();

    assert!(h.coordinator.prepare_for_build(&target).await);
    assert!(!h.coordinator.status().await.env_overrides.is_empty());
    h.coordinator.perform_post_build_cleanup().await;
    assert!(h.coordinator.status().await.env_overrides.is_empty());
}
