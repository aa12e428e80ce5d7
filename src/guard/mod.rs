//! Resilient build execution
//!
//! `BuildGuard` wraps the build tool with a hard per-attempt timeout,
//! pipe-break detection and bounded retry. Every retry is preceded by a
//! growing backoff and a full cleanup pass. Nothing inside an attempt can
//! abort the retry loop, a panicking runner included; the outcome is a
//! boolean or a [`BuildReport`].

pub mod runner;

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;

use crate::cleanup::{CleanupReport, Janitor};
use crate::config::WardenConfig;
use crate::error::{panic_message, WardenError};
use crate::state::MitigationState;

pub use runner::{BuildOutput, BuildRunner, CommandRunner};

/// How one build attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AttemptOutcome {
    Success,
    /// The build tool's IPC channel broke
    PipeBreak,
    /// Non-zero exit without a pipe-break marker
    Failed,
    TimedOut,
    /// The build could not be started, or the attempt panicked
    Error,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }
}

/// Classify a finished build against the configured pipe-break markers
pub fn classify(output: &BuildOutput, markers: &[String]) -> AttemptOutcome {
    if output.timed_out {
        return AttemptOutcome::TimedOut;
    }
    let stderr = output.stderr.to_lowercase();
    if markers.iter().any(|m| stderr.contains(&m.to_lowercase())) {
        AttemptOutcome::PipeBreak
    } else if output.exit_code == Some(0) {
        AttemptOutcome::Success
    } else {
        AttemptOutcome::Failed
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub exit_code: Option<i32>,
    #[serde(with = "millis")]
    pub duration: Duration,
    /// Cleanup performed before this attempt (retries only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleaned_before: Option<CleanupReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    pub target: PathBuf,
    pub succeeded: bool,
    /// Set when no attempt was made because health stayed critical
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub refused: bool,
    pub attempts: Vec<AttemptRecord>,
}

impl BuildReport {
    pub(crate) fn new(target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
            succeeded: false,
            refused: false,
            attempts: Vec::new(),
        }
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

pub struct BuildGuard {
    runner: Arc<dyn BuildRunner>,
    janitor: Arc<Janitor>,
    state: Arc<MitigationState>,
    config: Arc<WardenConfig>,
}

impl BuildGuard {
    pub fn new(
        runner: Arc<dyn BuildRunner>,
        janitor: Arc<Janitor>,
        state: Arc<MitigationState>,
        config: Arc<WardenConfig>,
    ) -> Self {
        Self {
            runner,
            janitor,
            state,
            config,
        }
    }

    /// Build `target` with up to `max_attempts` attempts
    pub async fn execute_resilient_build(&self, target: &Path, max_attempts: u32) -> bool {
        self.execute_with_report(target, max_attempts).await.succeeded
    }

    pub async fn execute_with_report(&self, target: &Path, max_attempts: u32) -> BuildReport {
        let project_dir = project_dir(target);
        let mut report = BuildReport::new(target);

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            let record = AssertUnwindSafe(self.attempt(target, &project_dir, attempt))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let e = WardenError::BuildAttempt {
                        target: target.display().to_string(),
                        attempt,
                        reason: format!("panicked: {}", panic_message(panic.as_ref())),
                    };
                    tracing::error!(error = %e, "Build attempt panicked");
                    AttemptRecord {
                        attempt,
                        outcome: AttemptOutcome::Error,
                        exit_code: None,
                        duration: started.elapsed(),
                        cleaned_before: None,
                        error: Some(e.to_string()),
                    }
                });

            let outcome = record.outcome;
            report.attempts.push(record);
            if outcome.is_success() {
                report.succeeded = true;
                tracing::info!(target = %target.display(), attempt, "Build succeeded");
                return report;
            }
        }

        let e = WardenError::ExhaustedRetries {
            target: target.display().to_string(),
            attempts: max_attempts,
        };
        tracing::error!(error = %e, "Giving up on build");
        report
    }

    /// Cleanup (on retries) plus one runner invocation
    async fn attempt(&self, target: &Path, project_dir: &Path, attempt: u32) -> AttemptRecord {
        let build = &self.config.build;
        let cleaned_before = if attempt > 1 {
            let backoff = build.retry_delay * (attempt - 1);
            tracing::info!(attempt, backoff_ms = backoff.as_millis() as u64, "Retrying build after cleanup");
            tokio::time::sleep(backoff).await;
            Some(self.janitor.full_pass(Some(project_dir)).await)
        } else {
            None
        };

        let started = Instant::now();
        let env = self.state.env_overrides();
        let result = self.runner.run(target, build.timeout, &env).await;
        let duration = started.elapsed();

        let (outcome, exit_code, error) = match result {
            Ok(output) => {
                let outcome = classify(&output, &build.pipe_break_markers);
                log_attempt(target, attempt, outcome, &output);
                (outcome, output.exit_code, None)
            }
            Err(e) => {
                let e = WardenError::BuildAttempt {
                    target: target.display().to_string(),
                    attempt,
                    reason: e.to_string(),
                };
                tracing::warn!(error = %e, "Build attempt errored");
                (AttemptOutcome::Error, None, Some(e.to_string()))
            }
        };
        AttemptRecord {
            attempt,
            outcome,
            exit_code,
            duration,
            cleaned_before,
            error,
        }
    }
}

fn log_attempt(target: &Path, attempt: u32, outcome: AttemptOutcome, output: &BuildOutput) {
    let target = target.display();
    match outcome {
        AttemptOutcome::Success => {}
        AttemptOutcome::PipeBreak => {
            tracing::warn!(%target, attempt, "Build tool pipe broke; full cleanup before retry")
        }
        AttemptOutcome::TimedOut => {
            tracing::warn!(%target, attempt, "Build timed out and was killed")
        }
        AttemptOutcome::Failed | AttemptOutcome::Error => tracing::warn!(
            %target,
            attempt,
            exit_code = ?output.exit_code,
            stdout = %tail(&output.stdout),
            stderr = %tail(&output.stderr),
            "Build failed"
        ),
    }
}

/// Last few lines of captured output
fn tail(s: &str) -> String {
    let lines: Vec<&str> = s.lines().collect();
    lines[lines.len().saturating_sub(20)..].join("\n")
}

/// Directory holding the target's build outputs
pub fn project_dir(target: &Path) -> PathBuf {
    if target.is_dir() {
        return target.to_path_buf();
    }
    match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
