//! Core value types for the a3s-warden subsystem
//!
//! All types use camelCase JSON serialization so reports can be handed to a
//! diagnostics collaborator as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::WardenError;

/// Area of the host or toolchain a threat was detected in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ThreatCategory {
    Memory,
    Cpu,
    Storage,
    Network,
    Security,
    SystemStability,
    FileSystem,
    DevEnvironment,
}

impl ThreatCategory {
    /// Every category, in scan order
    pub const ALL: [ThreatCategory; 8] = [
        ThreatCategory::Memory,
        ThreatCategory::Cpu,
        ThreatCategory::Storage,
        ThreatCategory::Network,
        ThreatCategory::Security,
        ThreatCategory::SystemStability,
        ThreatCategory::FileSystem,
        ThreatCategory::DevEnvironment,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ThreatCategory::Memory => "memory",
            ThreatCategory::Cpu => "cpu",
            ThreatCategory::Storage => "storage",
            ThreatCategory::Network => "network",
            ThreatCategory::Security => "security",
            ThreatCategory::SystemStability => "system-stability",
            ThreatCategory::FileSystem => "file-system",
            ThreatCategory::DevEnvironment => "dev-environment",
        }
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Threat severity, ordered from harmless to critical
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Ordinal verdict of system fitness
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum HealthLevel {
    #[default]
    Unknown,
    Optimal,
    Degraded,
    Critical,
}

impl HealthLevel {
    /// Bucket a 0..=100 health score
    pub fn from_score(score: u8) -> Self {
        match score {
            80.. => HealthLevel::Optimal,
            60..=79 => HealthLevel::Degraded,
            _ => HealthLevel::Critical,
        }
    }

    /// Level implied by the worst threat severity seen
    pub fn from_severity(severity: Severity) -> Self {
        match severity {
            Severity::Critical => HealthLevel::Critical,
            Severity::High | Severity::Medium => HealthLevel::Degraded,
            Severity::Low | Severity::None => HealthLevel::Optimal,
        }
    }
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthLevel::Unknown => "unknown",
            HealthLevel::Optimal => "optimal",
            HealthLevel::Degraded => "degraded",
            HealthLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// How aggressively mitigations are applied and how often the monitor runs
///
/// Each level acts on every severity the level below it acts on, so
/// escalating never drops a lower level's actions.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionLevel {
    Minimal,
    #[default]
    Standard,
    Aggressive,
    Emergency,
}

impl ProtectionLevel {
    /// Lowest threat severity this level mitigates
    pub fn action_threshold(&self) -> Severity {
        match self {
            ProtectionLevel::Minimal => Severity::High,
            ProtectionLevel::Standard => Severity::Medium,
            ProtectionLevel::Aggressive | ProtectionLevel::Emergency => Severity::Low,
        }
    }

    /// Whether threats of `severity` are acted on at this level
    pub fn acts_on(&self, severity: Severity) -> bool {
        severity >= self.action_threshold()
    }

    /// Monitoring cadence derived from the configured base interval
    pub fn monitor_interval(&self, base: Duration) -> Duration {
        match self {
            ProtectionLevel::Minimal => base * 2,
            ProtectionLevel::Standard => base,
            ProtectionLevel::Aggressive => base / 2,
            ProtectionLevel::Emergency => base / 4,
        }
    }
}

impl fmt::Display for ProtectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtectionLevel::Minimal => "minimal",
            ProtectionLevel::Standard => "standard",
            ProtectionLevel::Aggressive => "aggressive",
            ProtectionLevel::Emergency => "emergency",
        };
        f.write_str(s)
    }
}

impl FromStr for ProtectionLevel {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimal" => Ok(ProtectionLevel::Minimal),
            "standard" => Ok(ProtectionLevel::Standard),
            "aggressive" => Ok(ProtectionLevel::Aggressive),
            "emergency" => Ok(ProtectionLevel::Emergency),
            other => Err(WardenError::Config(format!(
                "unknown protection level '{other}' (use minimal, standard, aggressive or emergency)"
            ))),
        }
    }
}

/// A single detected adverse condition
///
/// Threats are immutable once built; a new scan always produces new values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Threat {
    id: String,
    category: ThreatCategory,
    description: String,
    severity: Severity,
    detected_at: DateTime<Utc>,
    mitigation: String,
    #[serde(default)]
    detection_error: bool,
}

impl Threat {
    /// Create a threat stamped with the current time
    pub fn new(
        category: ThreatCategory,
        severity: Severity,
        description: impl Into<String>,
        mitigation: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("thr-{}", uuid::Uuid::new_v4()),
            category,
            description: description.into(),
            severity,
            detected_at: Utc::now(),
            mitigation: mitigation.into(),
            detection_error: false,
        }
    }

    /// Low-severity threat standing in for a probe that could not run
    pub fn detection_error(category: ThreatCategory, error: &WardenError) -> Self {
        Self {
            detection_error: true,
            ..Self::new(
                category,
                Severity::Low,
                format!("{category} detection error: {error}"),
                "Check probe permissions; results for this category are incomplete",
            )
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn category(&self) -> ThreatCategory {
        self.category
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn detected_at(&self) -> DateTime<Utc> {
        self.detected_at
    }

    pub fn mitigation(&self) -> &str {
        &self.mitigation
    }

    /// True when this threat reports a failed probe rather than a condition
    pub fn is_detection_error(&self) -> bool {
        self.detection_error
    }
}

/// Point-in-time health verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,

    /// Worst of the four contributing levels below
    pub overall: HealthLevel,

    /// Penalty score (0..=100) from the basic resource checks
    pub score: u8,

    /// `score` bucketed into a level
    pub score_level: HealthLevel,

    /// Level implied by the worst threat in `threats`
    pub threat_level: HealthLevel,

    pub build_system: HealthLevel,

    pub runtime_stability: HealthLevel,

    pub threats: Vec<Threat>,

    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl HealthReport {
    /// Worst threat severity in the report
    pub fn max_severity(&self) -> Severity {
        self.threats
            .iter()
            .map(Threat::severity)
            .max()
            .unwrap_or_default()
    }

    /// Threats at or above `severity`, in detection order
    pub fn threats_at_least(&self, severity: Severity) -> Vec<Threat> {
        self.threats
            .iter()
            .filter(|t| t.severity() >= severity)
            .cloned()
            .collect()
    }

    pub fn is_critical(&self) -> bool {
        self.overall == HealthLevel::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::None < Severity::Low);
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_health_level_ordering() {
        assert!(HealthLevel::Unknown < HealthLevel::Optimal);
        assert!(HealthLevel::Optimal < HealthLevel::Degraded);
        assert!(HealthLevel::Degraded < HealthLevel::Critical);
    }

    #[test]
    fn test_health_level_from_score_buckets() {
        assert_eq!(HealthLevel::from_score(100), HealthLevel::Optimal);
        assert_eq!(HealthLevel::from_score(80), HealthLevel::Optimal);
        assert_eq!(HealthLevel::from_score(79), HealthLevel::Degraded);
        assert_eq!(HealthLevel::from_score(60), HealthLevel::Degraded);
        assert_eq!(HealthLevel::from_score(59), HealthLevel::Critical);
        assert_eq!(HealthLevel::from_score(0), HealthLevel::Critical);
    }

    #[test]
    fn test_protection_levels_are_cumulative() {
        let levels = [
            ProtectionLevel::Minimal,
            ProtectionLevel::Standard,
            ProtectionLevel::Aggressive,
            ProtectionLevel::Emergency,
        ];
        let severities = [
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ];
        for pair in levels.windows(2) {
            for sev in severities {
                if pair[0].acts_on(sev) {
                    assert!(pair[1].acts_on(sev), "{} dropped {sev}", pair[1]);
                }
            }
        }
        assert!(!ProtectionLevel::Minimal.acts_on(Severity::Medium));
        assert!(ProtectionLevel::Minimal.acts_on(Severity::High));
        assert!(ProtectionLevel::Standard.acts_on(Severity::Medium));
        assert!(!ProtectionLevel::Standard.acts_on(Severity::Low));
        assert!(ProtectionLevel::Emergency.acts_on(Severity::Low));
    }

    #[test]
    fn test_monitor_interval_scales_with_level() {
        let base = Duration::from_secs(120);
        assert_eq!(
            ProtectionLevel::Minimal.monitor_interval(base),
            Duration::from_secs(240)
        );
        assert_eq!(ProtectionLevel::Standard.monitor_interval(base), base);
        assert_eq!(
            ProtectionLevel::Emergency.monitor_interval(base),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_protection_level_from_str() {
        assert_eq!(
            "Aggressive".parse::<ProtectionLevel>().unwrap(),
            ProtectionLevel::Aggressive
        );
        assert!("paranoid".parse::<ProtectionLevel>().is_err());
    }

    #[test]
    fn test_threat_ids_are_unique() {
        let a = Threat::new(ThreatCategory::Memory, Severity::Low, "a", "b");
        let b = Threat::new(ThreatCategory::Memory, Severity::Low, "a", "b");
        assert!(a.id().starts_with("thr-"));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_detection_error_threat_is_low() {
        let err = WardenError::detection("cpu", "permission denied");
        let t = Threat::detection_error(ThreatCategory::Cpu, &err);
        assert_eq!(t.severity(), Severity::Low);
        assert_eq!(t.category(), ThreatCategory::Cpu);
        assert!(t.is_detection_error());
        assert!(t.description().contains("permission denied"));
    }

    #[test]
    fn test_threat_serialization_camel_case() {
        let t = Threat::new(
            ThreatCategory::DevEnvironment,
            Severity::Medium,
            "too many builds",
            "kill",
        );
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["category"], "devEnvironment");
        assert_eq!(json["severity"], "medium");
        assert!(json.get("detectedAt").is_some());
    }
}
