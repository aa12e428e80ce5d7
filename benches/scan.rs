//! Performance benchmarks for a3s-warden
//!
//! Run with: cargo bench

use std::sync::Arc;
use std::time::Duration;

use a3s_warden::mitigation::MitigationAction;
use a3s_warden::probe::fake::{FakeProbe, FakeProcessInspector, ProbeReadings};
use a3s_warden::probe::ProcessInfo;
use a3s_warden::{
    HealthAggregator, ProtectionLevel, Severity, Threat, ThreatCategory, ThreatScanner,
    WardenConfig,
};
use criterion::{criterion_group, criterion_main, Criterion};

fn scanner(readings: ProbeReadings, processes: usize) -> Arc<ThreatScanner> {
    let procs = (0..processes)
        .map(|i| {
            let name = if i % 3 == 0 { "rustc" } else { "bash" };
            ProcessInfo::new(1000 + i as u32, name, Duration::from_secs(60), 1 << 20)
        })
        .collect();
    Arc::new(ThreatScanner::new(
        Arc::new(FakeProbe::new(readings)),
        Arc::new(FakeProcessInspector::new(procs)),
        Arc::new(WardenConfig::default()),
    ))
}

fn stressed() -> ProbeReadings {
    let mut r = ProbeReadings::healthy();
    r.available_memory_mb = 300;
    r.cpu_percent = 97.0;
    r.temp_free_mb = 100;
    r.interfaces.clear();
    r
}

fn bench_plan(c: &mut Criterion) {
    let threats: Vec<Threat> = ThreatCategory::ALL
        .iter()
        .map(|&cat| Threat::new(cat, Severity::High, "bench", ""))
        .collect();

    c.bench_function("MitigationAction::plan (8 threats)", |b| {
        b.iter(|| {
            threats
                .iter()
                .flat_map(|t| MitigationAction::plan(t, ProtectionLevel::Aggressive))
                .count()
        });
    });
}

fn bench_scan(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("scan");
    for (label, readings) in [("healthy", ProbeReadings::healthy()), ("stressed", stressed())] {
        for processes in [10, 500] {
            let s = scanner(readings.clone(), processes);
            group.bench_function(format!("{label}, {processes} processes"), |b| {
                b.to_async(&rt).iter(|| async { s.scan().await });
            });
        }
    }
    group.finish();
}

fn bench_assess(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = Arc::new(WardenConfig::default());
    let aggregator = HealthAggregator::new(scanner(stressed(), 100), config);

    c.bench_function("HealthAggregator::assess (stressed)", |b| {
        b.to_async(&rt).iter(|| async { aggregator.assess().await });
    });
}

criterion_group!(benches, bench_plan, bench_scan, bench_assess);
criterion_main!(benches);
