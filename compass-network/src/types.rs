//! Core types shared by the runner and the actuator.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A single host command as an argument vector.
///
/// Never a shell string: arguments reach the child process untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    /// Program followed by its arguments
    pub argv: Vec<String>,
    /// Bytes to feed on stdin (stdin is closed when `None`)
    #[serde(skip)]
    pub stdin: Option<Vec<u8>>,
    /// Per-command timeout; the runner default applies when `None`
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// Create an invocation from an argument vector.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            stdin: None,
            timeout: None,
        }
    }

    /// Feed `stdin` to the child process.
    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Override the runner's default timeout for this command.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The program name, if the vector is non-empty.
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    /// Arguments after the program name.
    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or(&[])
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.argv.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '\'') {
                write!(f, "'{}'", arg.replace('\'', r"'\''"))?;
            } else {
                f.write_str(arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    /// Exit code (-1 when the child was terminated by a signal)
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandOutcome {
    /// Did the command exit with status zero?
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Actuation steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    /// Ensure the internal port exists on the bridge
    EnsurePort,
    /// Remove all IPv4 addresses from the port
    FlushAddresses,
    /// Apply the MTU hint and bring the link up
    LinkUp,
    /// Set or clear the VLAN tag
    VlanTag,
    /// Add the host address
    AssignAddress,
    /// Point the default route at the gateway
    DefaultRoute,
}

impl Step {
    /// All steps in the order they run.
    pub const ALL: [Step; 6] = [
        Step::EnsurePort,
        Step::FlushAddresses,
        Step::LinkUp,
        Step::VlanTag,
        Step::AssignAddress,
        Step::DefaultRoute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::EnsurePort => "ensure-port",
            Step::FlushAddresses => "flush-addresses",
            Step::LinkUp => "link-up",
            Step::VlanTag => "vlan-tag",
            Step::AssignAddress => "assign-address",
            Step::DefaultRoute => "default-route",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
