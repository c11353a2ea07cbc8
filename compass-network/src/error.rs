//! Error types for descriptor loading and host actuation.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::{CommandOutcome, Invocation, Step};

/// Errors surfaced by the netsetup core.
///
/// None of these are retried; each maps to a stable process exit code via
/// [`NetSetupError::exit_code`].
#[derive(Error, Debug)]
pub enum NetSetupError {
    /// The environment variable naming the descriptor is unset or empty.
    #[error("Environment variable {var} is not set")]
    EnvNotSet { var: String },

    /// The descriptor file is missing or unreadable.
    #[error("Network descriptor not found: {path}: {reason}")]
    ConfigNotFound { path: PathBuf, reason: String },

    /// The descriptor is not valid YAML or has the wrong shape.
    #[error("Malformed network descriptor: {0}")]
    ConfigMalformed(String),

    /// The descriptor parsed but violates an invariant.
    #[error("Invalid network descriptor: {0}")]
    ConfigInvalid(String),

    /// The host already has an incompatible port with the target name.
    #[error("Port {port} conflicts with existing host state: {found}")]
    PortConflict { port: String, found: String },

    /// A command did not exit within its timeout and was killed.
    #[error("Command timed out after {}s: {command}", timeout.as_secs_f32())]
    CommandTimeout {
        command: Invocation,
        timeout: Duration,
    },

    /// A command binary could not be launched.
    #[error("Failed to spawn command {command}: {reason}")]
    CommandSpawnError { command: Invocation, reason: String },

    /// A step failed; carries the attempted command and what happened.
    #[error("Step {step} failed running {command}: {detail}")]
    ActuationFailed {
        step: Step,
        command: Invocation,
        detail: FailureDetail,
    },

    /// Actuation was stopped by a termination signal before `step` ran.
    #[error("Interrupted before step {step} of role {role}")]
    Interrupted { role: String, step: Step },

    /// Privileged execution is required but not possible.
    #[error("Privilege elevation unavailable: {0}")]
    ElevationUnavailable(String),

    /// Another netsetup run holds the advisory lock, or it cannot be taken.
    #[error("Cannot acquire lock {path}: {reason}")]
    LockUnavailable { path: PathBuf, reason: String },
}

impl NetSetupError {
    /// Stable process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::EnvNotSet { .. } | Self::ConfigNotFound { .. } => 2,
            Self::ConfigMalformed(_) => 3,
            Self::ConfigInvalid(_) => 4,
            Self::PortConflict { .. }
            | Self::CommandTimeout { .. }
            | Self::CommandSpawnError { .. }
            | Self::ActuationFailed { .. }
            | Self::LockUnavailable { .. } => 5,
            Self::Interrupted { .. } => 6,
            Self::ElevationUnavailable(_) => 7,
        }
    }

    /// Captured stderr of the failing command, when there is one.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::ActuationFailed {
                detail: FailureDetail::Exit(outcome),
                ..
            } => Some(outcome.stderr.as_str()),
            _ => None,
        }
    }
}

/// What went wrong with the command of a failed step.
#[derive(Debug, Clone)]
pub enum FailureDetail {
    /// The command ran and exited with a status the step does not accept.
    Exit(CommandOutcome),
    /// The command was killed after the timeout.
    Timeout(Duration),
    /// The command could not be launched.
    Spawn(String),
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureDetail::Exit(outcome) => {
                write!(f, "exit code {}", outcome.exit_code)?;
                let stderr = outcome.stderr.trim();
                if !stderr.is_empty() {
                    write!(f, ": {}", stderr)?;
                }
                Ok(())
            }
            FailureDetail::Timeout(timeout) => {
                write!(f, "timed out after {}s", timeout.as_secs_f32())
            }
            FailureDetail::Spawn(reason) => write!(f, "spawn failed: {}", reason),
        }
    }
}

/// Result type alias for netsetup operations.
pub type Result<T> = std::result::Result<T, NetSetupError>;
