//! # a3s-warden
//!
//! Build-environment health monitoring and adaptive mitigation.
//!
//! ## Overview
//!
//! `a3s-warden` watches the host machine and the build toolchain, classifies
//! adverse conditions (low memory, CPU saturation, full disks, antivirus
//! interference, stray build processes), applies graduated corrective actions,
//! and re-runs builds that fail from resource contention or broken build-tool
//! pipes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use a3s_warden::{ProtectionCoordinator, ProtectionLevel, WardenConfig};
//!
//! # async fn example() {
//! let warden = ProtectionCoordinator::with_system(WardenConfig::default());
//! warden.initialize(ProtectionLevel::Standard).await;
//!
//! let report = warden.run_protected_build(Path::new("Cargo.toml"), 3).await;
//! println!("Build succeeded: {}", report.succeeded);
//!
//! warden.shutdown().await;
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **ThreatScanner** - concurrent detectors over `SystemProbe` / `ProcessInspector`
//! - **MitigationEngine** - maps threats to idempotent `MitigationAction`s
//! - **HealthAggregator** - folds score, threats and subsystem probes into a `HealthReport`
//! - **ContinuousMonitor** - cancellable periodic assess-and-mitigate loop
//! - **BuildGuard** - timeout, pipe-break detection, cleanup and bounded retry
//! - **ProtectionCoordinator** - the facade; owns one of each

pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod guard;
pub mod health;
pub mod mitigation;
pub mod monitor;
pub mod probe;
pub mod scanner;
pub mod state;
pub mod types;

// Re-export core types
pub use config::WardenConfig;
pub use coordinator::{ProtectionCoordinator, SessionStatus};
pub use error::{Result, WardenError};
pub use guard::{AttemptOutcome, BuildGuard, BuildReport, BuildRunner, CommandRunner};
pub use health::{HealthAggregator, SubsystemProbe};
pub use mitigation::{ApplyReport, MitigationAction, MitigationEngine};
pub use monitor::{ContinuousMonitor, MonitorEvent};
pub use probe::{ProcessInspector, SystemProbe};
pub use scanner::ThreatScanner;
pub use types::{HealthLevel, HealthReport, ProtectionLevel, Severity, Threat, ThreatCategory};
