//! Build-tool invocation
//!
//! [`BuildRunner`] is the seam between the retry loop and the real build
//! tool. [`CommandRunner`] splits the configured command line with POSIX
//! shell quoting, substitutes `{target}` per argument, and runs it under a
//! hard timeout; the child is killed when the timeout drops it.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Result, WardenError};

/// Captured result of one build-tool invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    /// `None` when the process was killed or timed out
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl BuildOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Invokes the external build tool
#[async_trait]
pub trait BuildRunner: Send + Sync {
    /// Build `target` once. `Err` means the tool could not be started at all.
    async fn run(
        &self,
        target: &Path,
        timeout: Duration,
        env: &[(String, String)],
    ) -> Result<BuildOutput>;
}

/// Runs a configured command line, `{target}` replaced with the target path
pub struct CommandRunner {
    command: String,
}

impl CommandRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Program and arguments for `target`
    pub fn command_line(&self, target: &Path) -> Result<Vec<String>> {
        let target = target.to_string_lossy();
        let parts = shell_words::split(&self.command).map_err(|e| {
            WardenError::Config(format!("build command '{}': {e}", self.command))
        })?;
        Ok(parts
            .into_iter()
            .map(|part| part.replace("{target}", &target))
            .collect())
    }
}

#[async_trait]
impl BuildRunner for CommandRunner {
    async fn run(
        &self,
        target: &Path,
        timeout: Duration,
        env: &[(String, String)],
    ) -> Result<BuildOutput> {
        let parts = self.command_line(target)?;
        let Some((program, args)) = parts.split_first() else {
            return Err(WardenError::Config("build command is empty".into()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);
        if let Some(dir) = target.parent().filter(|d| d.is_dir()) {
            cmd.current_dir(dir);
        }

        tracing::debug!(program = %program, args = ?args, env = env.len(), "Spawning build");
        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(BuildOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(BuildOutput {
                timed_out: true,
                ..BuildOutput::default()
            }),
        }
    }
}
