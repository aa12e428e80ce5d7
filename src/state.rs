//! Shared mitigation state
//!
//! Holds the flags mitigations switch on, the environment overrides handed
//! to the build tool, and the ids of mitigations applied so far. The host
//! process environment is never touched; overrides are injected into each
//! build child process instead.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use std::time::Duration;

use serde::Serialize;

/// Environment variables mitigations may set for the build tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvOverride {
    /// Cap build parallelism
    BuildJobs(usize),
    /// Single-node build: no long-lived MSBuild worker nodes
    NoNodeReuse,
    TelemetryOptOut,
    /// Workstation (non-server) GC for .NET build hosts
    WorkstationGc,
    Offline,
    /// HTTP timeout in seconds
    HttpTimeout(u32),
    NoIncremental,
}

impl EnvOverride {
    pub fn key(&self) -> &'static str {
        match self {
            EnvOverride::BuildJobs(_) => "CARGO_BUILD_JOBS",
            EnvOverride::NoNodeReuse => "MSBUILDDISABLENODEREUSE",
            EnvOverride::TelemetryOptOut => "DOTNET_CLI_TELEMETRY_OPTOUT",
            EnvOverride::WorkstationGc => "DOTNET_gcServer",
            EnvOverride::Offline => "CARGO_NET_OFFLINE",
            EnvOverride::HttpTimeout(_) => "CARGO_HTTP_TIMEOUT",
            EnvOverride::NoIncremental => "CARGO_INCREMENTAL",
        }
    }

    pub fn value(&self) -> String {
        match self {
            EnvOverride::BuildJobs(n) => n.to_string(),
            EnvOverride::NoNodeReuse | EnvOverride::TelemetryOptOut => "1".into(),
            EnvOverride::WorkstationGc | EnvOverride::NoIncremental => "0".into(),
            EnvOverride::Offline => "true".into(),
            EnvOverride::HttpTimeout(secs) => secs.to_string(),
        }
    }
}

/// Flags set by mitigations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MitigationFlags {
    pub low_memory: bool,
    pub caching_disabled: bool,
    pub offline: bool,
    pub extended_timeouts: bool,
    /// Pause between file operations while set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub io_delay: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_jobs: Option<usize>,
}

/// Process-wide mitigation state, shared by engine, cleanup and guard
#[derive(Default)]
pub struct MitigationState {
    flags: RwLock<MitigationFlags>,
    env: RwLock<BTreeMap<&'static str, String>>,
    active: RwLock<BTreeSet<String>>,
}

impl MitigationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(&self) -> MitigationFlags {
        self.flags.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update_flags(&self, f: impl FnOnce(&mut MitigationFlags)) {
        let mut flags = self.flags.write().unwrap_or_else(|e| e.into_inner());
        f(&mut flags);
    }

    pub fn io_delay(&self) -> Option<Duration> {
        self.flags().io_delay
    }

    pub fn set_env(&self, var: EnvOverride) {
        self.env
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(var.key(), var.value());
    }

    /// Current overrides as `(key, value)` pairs, sorted by key
    pub fn env_overrides(&self) -> Vec<(String, String)> {
        self.env
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    /// Drop every environment override and the build-parallelism cap
    pub fn restore_env(&self) {
        self.env.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.update_flags(|f| f.build_jobs = None);
    }

    pub fn record_active(&self, id: &str) {
        self.active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string());
    }

    /// Ids of every mitigation applied since creation
    pub fn active(&self) -> Vec<String> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}
