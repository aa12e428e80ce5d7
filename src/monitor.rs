//! Continuous health monitor
//!
//! Runs a background task that periodically assesses health and applies
//! mitigations. Each tick is isolated: a panic or failure inside a tick is
//! logged and reported as [`MonitorEvent::TickFailed`], and the loop goes on.
//! After a critical tick the wait doubles, up to `max_backoff_factor` times
//! the base interval; the first non-critical tick resets it.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WardenConfig;
use crate::error::panic_message;
use crate::health::HealthAggregator;
use crate::mitigation::MitigationEngine;
use crate::types::{HealthLevel, ProtectionLevel, Severity};

/// Monitor lifecycle and tick events
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Started { interval: Duration },
    TickCompleted {
        overall: HealthLevel,
        threats: usize,
        mitigations: usize,
    },
    /// The tick found a critical state and applied emergency protections
    EmergencyTriggered,
    TickFailed { error: String },
    Stopped,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic assess-and-mitigate loop
pub struct ContinuousMonitor {
    aggregator: Arc<HealthAggregator>,
    engine: Arc<MitigationEngine>,
    config: Arc<WardenConfig>,
    event_tx: broadcast::Sender<MonitorEvent>,
    running: Mutex<Option<Running>>,
}

impl ContinuousMonitor {
    pub fn new(
        aggregator: Arc<HealthAggregator>,
        engine: Arc<MitigationEngine>,
        config: Arc<WardenConfig>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            aggregator,
            engine,
            config,
            event_tx,
            running: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Start the loop at the interval for `level`; no-op if already running.
    /// The first tick happens one interval after start.
    pub fn start(&self, level: ProtectionLevel) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return false;
        }

        let base = level.monitor_interval(self.config.monitor.interval);
        let max_factor = self.config.monitor.max_backoff_factor.max(1);
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.aggregator.clone(),
            self.engine.clone(),
            self.event_tx.clone(),
            token.clone(),
            base,
            max_factor,
        ));

        tracing::info!(level = %level, interval_ms = base.as_millis() as u64, "Monitor started");
        let _ = self.event_tx.send(MonitorEvent::Started { interval: base });
        *running = Some(Running { token, handle });
        true
    }

    /// Stop the loop and wait for it to exit. Safe to call when not running.
    pub async fn stop(&self) -> bool {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(Running { token, handle }) = running else {
            return false;
        };
        token.cancel();
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Monitor task ended abnormally");
        }
        tracing::info!("Monitor stopped");
        let _ = self.event_tx.send(MonitorEvent::Stopped);
        true
    }
}

/// Interval multiplier for the next wait
pub fn next_backoff_factor(current: u32, critical: bool, max_factor: u32) -> u32 {
    if critical {
        current.saturating_mul(2).min(max_factor)
    } else {
        1
    }
}

async fn run_loop(
    aggregator: Arc<HealthAggregator>,
    engine: Arc<MitigationEngine>,
    event_tx: broadcast::Sender<MonitorEvent>,
    token: CancellationToken,
    base: Duration,
    max_factor: u32,
) {
    let mut factor = 1u32;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(base * factor) => {}
        }

        match AssertUnwindSafe(tick(&aggregator, &engine, &event_tx))
            .catch_unwind()
            .await
        {
            Ok(critical) => {
                factor = next_backoff_factor(factor, critical, max_factor);
                if critical {
                    tracing::warn!(factor, "Critical health, backing off monitor interval");
                }
            }
            Err(panic) => {
                let error = panic_message(panic.as_ref());
                tracing::error!(error = %error, "Monitor tick panicked");
                let _ = event_tx.send(MonitorEvent::TickFailed { error });
            }
        }
    }
}

/// One assess-and-mitigate pass; returns whether health was critical
async fn tick(
    aggregator: &HealthAggregator,
    engine: &MitigationEngine,
    event_tx: &broadcast::Sender<MonitorEvent>,
) -> bool {
    let report = aggregator.assess().await;
    let actionable = report.threats_at_least(Severity::Medium);
    let mut applied = engine.apply(&actionable).await;

    let critical = report.is_critical();
    if critical {
        let emergency = engine.apply_emergency().await;
        applied.applied.extend(emergency.applied);
        let _ = event_tx.send(MonitorEvent::EmergencyTriggered);
    }

    tracing::debug!(
        overall = %report.overall,
        threats = report.threats.len(),
        mitigations = applied.applied.len(),
        "Monitor tick complete"
    );
    let _ = event_tx.send(MonitorEvent::TickCompleted {
        overall: report.overall,
        threats: report.threats.len(),
        mitigations: applied.applied.len(),
    });
    critical
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::Janitor;
    use crate::health::{RuntimeStabilityProbe, SubsystemProbe};
    use crate::mitigation::SystemReclaimer;
    use crate::probe::fake::{FakeProbe, FakeProcessInspector, ProbeReadings};
    use crate::scanner::ThreatScanner;
    use crate::state::MitigationState;
    use async_trait::async_trait;

    struct PanickingProbe;

    #[async_trait]
    impl SubsystemProbe for PanickingProbe {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn level(&self) -> HealthLevel {
            panic!("probe exploded")
        }
    }

    fn monitor(readings: ProbeReadings, panicking: bool) -> ContinuousMonitor {
        let mut config = WardenConfig::default();
        config.monitor.interval = Duration::from_secs(10);
        config.cleanup.temp_dirs = Vec::new();
        let config = Arc::new(config);
        let probe = Arc::new(FakeProbe::new(readings));
        let inspector = Arc::new(FakeProcessInspector::default());
        let scanner = Arc::new(ThreatScanner::new(
            probe.clone(),
            inspector.clone(),
            config.clone(),
        ));
        let aggregator = if panicking {
            HealthAggregator::with_probes(
                scanner,
                Box::new(PanickingProbe),
                Box::new(RuntimeStabilityProbe::new(probe, config.clone())),
                config.clone(),
            )
        } else {
            HealthAggregator::new(scanner, config.clone())
        };
        let state = Arc::new(MitigationState::new());
        let janitor = Arc::new(Janitor::new(inspector, state.clone(), config.clone()));
        let engine = Arc::new(MitigationEngine::new(
            janitor,
            state,
            Arc::new(SystemReclaimer),
            config.clone(),
        ));
        ContinuousMonitor::new(Arc::new(aggregator), engine, config)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(next_backoff_factor(1, true, 4), 2);
        assert_eq!(next_backoff_factor(2, true, 4), 4);
        assert_eq!(next_backoff_factor(4, true, 4), 4);
        assert_eq!(next_backoff_factor(4, false, 4), 1);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let m = monitor(ProbeReadings::healthy(), false);
        assert!(!m.stop().await);
        assert!(!m.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_after_one_interval() {
        let m = monitor(ProbeReadings::healthy(), false);
        let mut rx = m.subscribe();
        assert!(m.start(ProtectionLevel::Standard));
        assert!(!m.start(ProtectionLevel::Standard));
        assert_eq!(
            rx.recv().await.unwrap(),
            MonitorEvent::Started {
                interval: Duration::from_secs(10)
            }
        );
        match rx.recv().await.unwrap() {
            MonitorEvent::TickCompleted { overall, .. } => {
                assert_eq!(overall, HealthLevel::Optimal)
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(m.stop().await);
        assert!(!m.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_tick_triggers_emergency() {
        let mut r = ProbeReadings::healthy();
        r.available_memory_mb = 100;
        let m = monitor(r, false);
        let mut rx = m.subscribe();
        m.start(ProtectionLevel::Standard);
        let _started = rx.recv().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), MonitorEvent::EmergencyTriggered);
        assert!(m.engine.state().flags().low_memory);
        m.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_tick_does_not_stop_loop() {
        let m = monitor(ProbeReadings::healthy(), true);
        let mut rx = m.subscribe();
        m.start(ProtectionLevel::Standard);
        let _started = rx.recv().await.unwrap();
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                MonitorEvent::TickFailed { error } => assert!(error.contains("probe exploded")),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(m.is_running());
        m.stop().await;
    }

    async fn next_tick(rx: &mut broadcast::Receiver<MonitorEvent>) -> tokio::time::Instant {
        loop {
            match rx.recv().await.unwrap() {
                MonitorEvent::TickCompleted { .. } => return tokio::time::Instant::now(),
                MonitorEvent::EmergencyTriggered => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_ticks_back_off() {
        let mut r = ProbeReadings::healthy();
        r.available_memory_mb = 100;
        let m = monitor(r, false);
        let mut rx = m.subscribe();
        let started_at = tokio::time::Instant::now();
        m.start(ProtectionLevel::Standard);
        let _started = rx.recv().await.unwrap();

        let first = next_tick(&mut rx).await;
        let second = next_tick(&mut rx).await;
        let third = next_tick(&mut rx).await;
        let fourth = next_tick(&mut rx).await;

        assert!(first - started_at >= Duration::from_secs(10));
        assert!(first - started_at < Duration::from_secs(20));
        assert!(second - first >= Duration::from_secs(20));
        assert!(second - first < Duration::from_secs(30));
        assert!(third - second >= Duration::from_secs(40));
        // capped at max_backoff_factor (4)
        assert!(fourth - third >= Duration::from_secs(40));
        assert!(fourth - third < Duration::from_secs(50));
        m.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_medium_network_threat_goes_offline_at_default_level() {
        let mut r = ProbeReadings::healthy();
        r.interfaces.clear();
        let m = monitor(r, false);
        assert_eq!(m.engine.level(), ProtectionLevel::Standard);
        let mut rx = m.subscribe();
        m.start(ProtectionLevel::Standard);
        let _started = rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            MonitorEvent::TickCompleted {
                overall,
                mitigations,
                ..
            } => {
                assert_ne!(overall, HealthLevel::Critical);
                assert!(mitigations >= 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
        let flags = m.engine.state().flags();
        assert!(flags.offline);
        assert!(flags.extended_timeouts);
        m.stop().await;
    }
}
