//! External provisioning commands
//!
//! Spawn, destroy and failure-notify commands are string templates with
//! `{name}` placeholders. They run through `sh -c`, each attempt bounded by
//! a timeout, and are retried with a fixed wait before the failure-notify
//! command is fired.

use crate::error::{AutoscaleError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Exit code a spawn command uses to ask for a retry on the next tick
pub const EXIT_RETRY_LATER: i32 = 2;

/// Output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Which provisioning command is being run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Spawn,
    Destroy,
    FailureNotify,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Spawn => write!(f, "spawn"),
            CommandKind::Destroy => write!(f, "destroy"),
            CommandKind::FailureNotify => write!(f, "failure"),
        }
    }
}

/// A command line with `{name}` placeholders
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandTemplate(String);

impl CommandTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Substitute every known `{name}` placeholder
    ///
    /// Placeholders without a value are left untouched.
    pub fn render(&self, vars: &[(&str, String)]) -> String {
        let mut rendered = self.0.clone();
        for (name, value) in vars {
            rendered = rendered.replace(&format!("{{{name}}}"), value);
        }
        rendered
    }
}

impl From<&str> for CommandTemplate {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Runs a fully rendered command line
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> Result<CommandOutput>;
}

/// Executes commands through `sh -c` with a per-call timeout
pub struct ShellExecutor {
    timeout: Duration,
}

impl ShellExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, command: &str) -> Result<CommandOutput> {
        debug!(command = %command, "Running command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| AutoscaleError::CommandTimeout {
                command: command.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|source| AutoscaleError::CommandSpawn {
                command: command.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Retry-wrapped invocation of provisioning commands
pub struct CommandRunner {
    executor: Arc<dyn CommandExecutor>,
    retries: u32,
    retry_wait: Duration,
    failure_command: CommandTemplate,
}

impl CommandRunner {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        retries: u32,
        retry_wait: Duration,
        failure_command: CommandTemplate,
    ) -> Self {
        Self {
            executor,
            retries,
            retry_wait,
            failure_command,
        }
    }

    /// Run a command, retrying on failure
    ///
    /// Returns `None` once every attempt has failed; the failure-notify
    /// command has been fired by then. An empty template is not run and
    /// yields an empty successful output.
    pub async fn run(
        &self,
        kind: CommandKind,
        template: &CommandTemplate,
        vars: &[(&str, String)],
        allowed_codes: &[i32],
    ) -> Option<CommandOutput> {
        if template.is_empty() {
            debug!(kind = %kind, "No command configured, skipping");
            return Some(CommandOutput::default());
        }

        let command = template.render(vars);
        let attempts = self.retries + 1;

        for attempt in 1..=attempts {
            let failure = match self.executor.execute(&command).await {
                Ok(output) if output.code == 0 || allowed_codes.contains(&output.code) => {
                    return Some(output);
                }
                Ok(output) => {
                    warn!(
                        kind = %kind,
                        command = %command,
                        code = output.code,
                        stderr = %output.stderr.trim(),
                        attempt,
                        "Command exited with disallowed code"
                    );
                    AutoscaleError::CommandFailed {
                        command: command.clone(),
                        code: output.code,
                    }
                }
                Err(e) => {
                    warn!(kind = %kind, error = %e, attempt, "Command failed");
                    e
                }
            };

            if attempt < attempts {
                info!(
                    kind = %kind,
                    wait_secs = self.retry_wait.as_secs(),
                    remaining = attempts - attempt,
                    "Retrying command"
                );
                tokio::time::sleep(self.retry_wait).await;
            } else {
                error!(kind = %kind, error = %failure, attempts, "Command failed, giving up");
            }
        }

        self.notify_failure(&command).await;
        None
    }

    /// Fire the failure-notify command once, without retries
    pub async fn notify_failure(&self, failed_command: &str) {
        if self.failure_command.is_empty() {
            return;
        }

        let command = self
            .failure_command
            .render(&[("failed_command", failed_command.to_string())]);

        match self.executor.execute(&command).await {
            Ok(output) if output.code == 0 => {
                debug!(command = %command, "Failure command completed");
            }
            Ok(output) => {
                warn!(command = %command, code = output.code, "Failure command exited non-zero");
            }
            Err(e) => {
                warn!(error = %e, "Failure command could not be run");
            }
        }
    }
}
