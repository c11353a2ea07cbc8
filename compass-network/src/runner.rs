//! Shell command runner.
//!
//! Runs one host command at a time as an argument vector, with an optional
//! elevation prefix (`sudo -n` by default), a timeout, and captured output.
//! Non-zero exit codes are returned to the caller: several networking commands
//! answer "already in desired state" that way, and only the caller knows which.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::{NetSetupError, Result};
use crate::types::{CommandOutcome, Invocation};

/// Default per-command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes host commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `invocation` to completion.
    ///
    /// Returns the outcome even for non-zero exits; fails only with
    /// `CommandTimeout` or `CommandSpawnError`.
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutcome>;
}

/// When to prepend the elevation prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElevationMode {
    /// Prefix unless the process already runs as root
    #[default]
    Auto,
    /// Always prefix
    Always,
    /// Never prefix
    Never,
}

/// Elevation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevationConfig {
    pub mode: ElevationMode,
    /// Prefix argv, e.g. `["sudo", "-n"]`
    pub prefix: Vec<String>,
}

impl Default for ElevationConfig {
    fn default() -> Self {
        Self {
            mode: ElevationMode::Auto,
            prefix: vec!["sudo".to_string(), "-n".to_string()],
        }
    }
}

impl ElevationConfig {
    /// Resolve the prefix to use, checking that its binary exists.
    ///
    /// `is_root` is the effective-uid check and `on_path` looks a program up
    /// on `PATH`; both are parameters so the policy can be tested.
    pub fn resolve<F>(&self, is_root: bool, on_path: F) -> Result<Vec<String>>
    where
        F: Fn(&str) -> bool,
    {
        let required = match self.mode {
            ElevationMode::Never => false,
            ElevationMode::Always => true,
            ElevationMode::Auto => !is_root,
        };
        if !required {
            return Ok(Vec::new());
        }

        let Some(program) = self.prefix.first() else {
            return Err(NetSetupError::ElevationUnavailable(
                "elevation required but no prefix configured".to_string(),
            ));
        };
        if !on_path(program) {
            return Err(NetSetupError::ElevationUnavailable(format!(
                "elevation required but '{}' was not found on PATH",
                program
            )));
        }

        Ok(self.prefix.clone())
    }
}

/// Runner spawning real child processes.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    prefix: Vec<String>,
    default_timeout: Duration,
}

impl ShellRunner {
    /// Create a runner, failing with `ElevationUnavailable` when elevation is
    /// required but cannot be provided.
    ///
    /// A resolved prefix is exercised once as `<prefix> true` so that missing
    /// non-interactive rights surface here rather than on the first host
    /// command.
    pub async fn new(elevation: &ElevationConfig, default_timeout: Duration) -> Result<Self> {
        let is_root = nix::unistd::geteuid().is_root();
        let prefix = elevation.resolve(is_root, |program| which::which(program).is_ok())?;

        let runner = Self {
            prefix,
            default_timeout,
        };
        if !runner.prefix.is_empty() {
            runner.verify_elevation().await?;
        }

        debug!(
            prefix = ?runner.prefix,
            timeout_secs = default_timeout.as_secs(),
            "Shell runner ready"
        );
        Ok(runner)
    }

    async fn verify_elevation(&self) -> Result<()> {
        let check = Invocation::new(["true"]);
        let unavailable = |detail: String| {
            NetSetupError::ElevationUnavailable(format!(
                "'{} true' failed: {}",
                self.prefix.join(" "),
                detail
            ))
        };

        let outcome = self.run(&check).await.map_err(|e| unavailable(e.to_string()))?;
        if !outcome.success() {
            let stderr = outcome.stderr.trim();
            return Err(unavailable(if stderr.is_empty() {
                format!("exit code {}", outcome.exit_code)
            } else {
                stderr.to_string()
            }));
        }
        Ok(())
    }

    /// Runner without elevation.
    pub fn unprivileged(default_timeout: Duration) -> Self {
        Self {
            prefix: Vec::new(),
            default_timeout,
        }
    }

    /// The elevation prefix in use (empty when not elevating).
    pub fn prefix(&self) -> &[String] {
        &self.prefix
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    #[instrument(skip(self, invocation), fields(command = %invocation))]
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutcome> {
        let argv: Vec<&str> = self
            .prefix
            .iter()
            .chain(invocation.argv.iter())
            .map(String::as_str)
            .collect();
        let Some((program, args)) = argv.split_first() else {
            return Err(NetSetupError::CommandSpawnError {
                command: invocation.clone(),
                reason: "empty argument vector".to_string(),
            });
        };
        let timeout = invocation.timeout.unwrap_or(self.default_timeout);

        let mut cmd = Command::new(program);
        cmd.args(args)
            // Keep diagnostics such as "File exists" in a stable language
            .env("LC_ALL", "C")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| NetSetupError::CommandSpawnError {
            command: invocation.clone(),
            reason: e.to_string(),
        })?;

        let stdin_pipe = child.stdin.take();
        let input = invocation.stdin.clone();
        let feed = async move {
            if let (Some(mut pipe), Some(input)) = (stdin_pipe, input) {
                if let Err(e) = pipe.write_all(&input).await {
                    warn!(error = %e, "Failed to write command stdin");
                }
            }
        };

        let output = match tokio::time::timeout(timeout, async {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        })
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(NetSetupError::CommandSpawnError {
                    command: invocation.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs_f32(), "Command timed out, killed");
                return Err(NetSetupError::CommandTimeout {
                    command: invocation.clone(),
                    timeout,
                });
            }
        };

        let outcome = CommandOutcome {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!(exit_code = outcome.exit_code, "Command finished");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ShellRunner {
        ShellRunner::unprivileged(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_elevation_without_rights_is_refused() {
        let config = ElevationConfig {
            mode: ElevationMode::Always,
            prefix: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo 'sudo: a password is required' >&2; exit 1".to_string(),
                "sudo".to_string(),
            ],
        };
        let result = ShellRunner::new(&config, Duration::from_secs(5)).await;
        match result {
            Err(e @ NetSetupError::ElevationUnavailable(_)) => {
                assert!(e.to_string().contains("a password is required"));
                assert_eq!(e.exit_code(), 7);
            }
            other => panic!("expected ElevationUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_working_prefix_is_kept() {
        let config = ElevationConfig {
            mode: ElevationMode::Always,
            prefix: vec!["env".to_string()],
        };
        let runner = ShellRunner::new(&config, Duration::from_secs(5)).await.unwrap();
        assert_eq!(runner.prefix(), ["env"]);

        let outcome = runner.run(&Invocation::new(["printf", "ok"])).await.unwrap();
        assert_eq!(outcome.stdout, "ok");
    }

    #[test]
    fn test_resolve_prefix() {
        let config = ElevationConfig::default();
        assert_eq!(config.resolve(false, |_| true).unwrap(), ["sudo", "-n"]);
        assert!(config.resolve(true, |_| false).unwrap().is_empty());

        let missing = config.resolve(false, |_| false);
        assert!(matches!(missing, Err(NetSetupError::ElevationUnavailable(_))));

        let always = ElevationConfig {
            mode: ElevationMode::Always,
            ..Default::default()
        };
        assert_eq!(always.resolve(true, |_| true).unwrap(), ["sudo", "-n"]);

        let never = ElevationConfig {
            mode: ElevationMode::Never,
            prefix: Vec::new(),
        };
        assert!(never.resolve(false, |_| false).unwrap().is_empty());

        let empty = ElevationConfig {
            mode: ElevationMode::Always,
            prefix: Vec::new(),
        };
        assert!(matches!(
            empty.resolve(false, |_| true),
            Err(NetSetupError::ElevationUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let cmd = Invocation::new(["sh", "-c", "echo out; echo err >&2; exit 3"]);
        let outcome = runner().run(&cmd).await.unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_arguments_are_not_split() {
        let cmd = Invocation::new(["printf", "%s|", "a b", "$HOME", ";true"]);
        let outcome = runner().run(&cmd).await.unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout, "a b|$HOME|;true|");
    }

    #[tokio::test]
    async fn test_feeds_stdin() {
        let cmd = Invocation::new(["cat"]).with_stdin("port mgmt_vnic\n");
        let outcome = runner().run(&cmd).await.unwrap();
        assert_eq!(outcome.stdout, "port mgmt_vnic\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let cmd = Invocation::new(["sleep", "5"]).with_timeout(Duration::from_millis(100));
        let result = runner().run(&cmd).await;
        assert!(matches!(result, Err(NetSetupError::CommandTimeout { .. })));
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let cmd = Invocation::new(["/nonexistent/compass-netsetup-binary"]);
        let result = runner().run(&cmd).await;
        assert!(matches!(result, Err(NetSetupError::CommandSpawnError { .. })));

        let empty = runner().run(&Invocation::new(Vec::<String>::new())).await;
        assert!(matches!(empty, Err(NetSetupError::CommandSpawnError { .. })));
    }
}
