//! Configuration management for netsetup.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use compass_common::LoggingOptions;
use compass_network::{
    ActuatorOptions, ElevationConfig, HostAddressPolicy, DEFAULT_BRIDGE, DEFAULT_DESCRIPTOR_ENV,
    DEFAULT_LOCK_FILE, DEFAULT_ROLE,
};

use crate::cli::Args;

/// Default tool configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/compass/netsetup.yaml";

/// Tool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bridge for management ports without a bridge hint
    pub bridge: String,
    /// Management roles to configure
    pub roles: Vec<String>,
    /// Advisory lock file
    pub lock_file: String,
    /// Environment variable naming the descriptor
    pub descriptor_env: String,
    /// Per-command timeout in seconds
    pub command_timeout_secs: u64,
    /// Which pool address the host takes
    pub address_policy: HostAddressPolicy,
    /// Install a default route via the role's `gw`
    pub manage_default_route: bool,
    pub elevation: ElevationConfig,
    pub logging: LoggingOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge: DEFAULT_BRIDGE.to_string(),
            roles: vec![DEFAULT_ROLE.to_string()],
            lock_file: DEFAULT_LOCK_FILE.to_string(),
            descriptor_env: DEFAULT_DESCRIPTOR_ENV.to_string(),
            command_timeout_secs: 30,
            address_policy: HostAddressPolicy::default(),
            manage_default_route: false,
            elevation: ElevationConfig::default(),
            logging: LoggingOptions::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load the explicit `--config` file, or the default one when present.
    ///
    /// A missing default file yields the built-in defaults; an explicit path
    /// that cannot be loaded is an error.
    pub fn resolve(explicit: Option<&str>) -> Result<(Self, Option<String>)> {
        match explicit {
            Some(path) => Ok((Self::load(path)?, Some(path.to_string()))),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Ok((
                Self::load(DEFAULT_CONFIG_PATH)?,
                Some(DEFAULT_CONFIG_PATH.to_string()),
            )),
            None => Ok((Self::default(), None)),
        }
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref bridge) = args.bridge {
            self.bridge = bridge.clone();
        }

        if !args.roles.is_empty() {
            self.roles = args.roles.clone();
        }

        if let Some(ref lock_file) = args.lock_file {
            self.lock_file = lock_file.clone();
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        self
    }

    /// Check values the actuator relies on.
    pub fn validate(&self) -> Result<()> {
        if self.bridge.trim().is_empty() {
            anyhow::bail!("bridge must not be empty");
        }
        if self.roles.iter().any(|r| r.trim().is_empty()) {
            anyhow::bail!("role names must not be empty");
        }
        if self.command_timeout_secs == 0 {
            anyhow::bail!("command_timeout_secs must be greater than zero");
        }
        if self.descriptor_env.is_empty() {
            anyhow::bail!("descriptor_env must not be empty");
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Actuator settings derived from this configuration.
    pub fn actuator_options(&self) -> ActuatorOptions {
        ActuatorOptions {
            bridge: self.bridge.clone(),
            roles: self.roles.iter().cloned().collect::<BTreeSet<_>>(),
            address_policy: self.address_policy,
            manage_default_route: self.manage_default_route,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use compass_common::LogFormat;
    use compass_network::ElevationMode;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bridge, "br-external");
        assert_eq!(config.roles, ["mgmt"]);
        assert_eq!(config.lock_file, "/var/lock/deploy-netsetup");
        assert_eq!(config.descriptor_env, "NETWORK");
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
        assert!(!config.manage_default_route);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
bridge: br-mgmt
roles: [mgmt, storage]
command_timeout_secs: 10
address_policy: first-of-first-range
manage_default_route: true
elevation:
  mode: never
logging:
  level: debug
  format: json
  file: /var/log/compass/netsetup.log
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.bridge, "br-mgmt");
        assert_eq!(config.roles, ["mgmt", "storage"]);
        assert_eq!(config.lock_file, "/var/lock/deploy-netsetup");
        assert_eq!(config.address_policy, HostAddressPolicy::FirstOfFirstRange);
        assert_eq!(config.elevation.mode, ElevationMode::Never);
        assert_eq!(config.elevation.prefix, ["sudo", "-n"]);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.file.as_deref(), Some("/var/log/compass/netsetup.log"));

        let options = config.actuator_options();
        assert!(options.roles.contains("storage"));
        assert!(options.manage_default_route);
    }

    #[test]
    fn test_cli_overrides_config() {
        let config = Config {
            bridge: "br-from-file".to_string(),
            roles: vec!["storage".to_string()],
            ..Default::default()
        };
        let args = Args::parse_from([
            "compass-netsetup",
            "--bridge",
            "br-cli",
            "--role",
            "mgmt",
            "--lock-file",
            "/run/netsetup.lock",
            "--log-level",
            "trace",
        ]);

        let config = config.with_cli_overrides(&args);
        assert_eq!(config.bridge, "br-cli");
        assert_eq!(config.roles, ["mgmt"]);
        assert_eq!(config.lock_file, "/run/netsetup.lock");
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    fn test_cli_without_flags_keeps_config() {
        let config = Config {
            bridge: "br-from-file".to_string(),
            ..Default::default()
        };
        let config = config.with_cli_overrides(&Args::parse_from(["compass-netsetup"]));
        assert_eq!(config.bridge, "br-from-file");
        assert_eq!(config.roles, ["mgmt"]);
    }

    #[test]
    fn test_explicit_config_must_exist() {
        assert!(Config::resolve(Some("/nonexistent/compass/netsetup.yaml")).is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bridge: br-test").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let (config, source) = Config::resolve(Some(&path)).unwrap();
        assert_eq!(config.bridge, "br-test");
        assert_eq!(source.as_deref(), Some(path.as_str()));
    }

    #[test]
    fn test_validation() {
        let config = Config {
            command_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            roles: vec![String::new()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
