//! Network descriptor model and loader.
//!
//! The descriptor is the YAML document the installer hands to netsetup through
//! an environment variable (default `NETWORK`):
//!
//! ```yaml
//! sys_intf_mappings:
//!   - name: mgmt
//!     vlan_tag: 42
//! ip_settings:
//!   - name: mgmt
//!     cidr: 192.168.10.0/24
//!     ip_ranges:
//!       - [192.168.10.100, 192.168.10.200]
//! ```
//!
//! Loading happens in two stages: serde turns the text into raw, loosely typed
//! records (shape errors are `ConfigMalformed`), then validation turns those
//! into the typed model (content errors are `ConfigInvalid`).

use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, info, instrument};

use crate::error::{NetSetupError, Result};

/// Default environment variable naming the descriptor path.
pub const DEFAULT_DESCRIPTOR_ENV: &str = "NETWORK";

/// Lowest valid 802.1Q VLAN id.
pub const VLAN_TAG_MIN: u16 = 1;
/// Highest valid 802.1Q VLAN id.
pub const VLAN_TAG_MAX: u16 = 4094;

const MTU_MIN: u32 = 68;
const MTU_MAX: u32 = 65535;

/// Root network descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkDescriptor {
    /// How each logical role is realized on the host
    pub sys_intf_mappings: Vec<InterfaceMapping>,
    /// Addressing per logical role
    pub ip_settings: Vec<IpSetting>,
    /// Unknown top-level keys, preserved but never acted on
    pub extra: BTreeMap<String, Value>,
}

/// Host realization of a logical role.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceMapping {
    /// Logical role name (e.g. "mgmt")
    pub name: String,
    /// 802.1Q tag; `None` means untagged
    pub vlan_tag: Option<u16>,
    /// Bridge hint; the configured bridge is used when absent
    pub bridge: Option<String>,
    /// MTU hint; the MTU is left alone when absent
    pub mtu: Option<u32>,
    /// Other keys of the mapping
    pub extra: BTreeMap<String, Value>,
}

/// Addressing for a logical role.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IpSetting {
    /// Role this setting applies to
    pub name: String,
    /// Network with prefix length
    pub cidr: Ipv4Net,
    /// Inclusive address pools, in descriptor order (never empty)
    pub ip_ranges: Vec<IpRange>,
    /// Optional default gateway inside `cidr`
    pub gw: Option<Ipv4Addr>,
    /// Other keys of the setting
    pub extra: BTreeMap<String, Value>,
}

/// Inclusive IPv4 address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl NetworkDescriptor {
    /// Parse and validate a descriptor from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let raw: RawDescriptor = serde_yaml::from_str(content)
            .map_err(|e| NetSetupError::ConfigMalformed(e.to_string()))?;
        raw.validate()
    }

    /// Look up the interface mapping of a role.
    pub fn mapping(&self, role: &str) -> Option<&InterfaceMapping> {
        self.sys_intf_mappings.iter().find(|m| m.name == role)
    }

    /// Look up the IP setting of a role.
    pub fn ip_setting(&self, role: &str) -> Option<&IpSetting> {
        self.ip_settings.iter().find(|s| s.name == role)
    }

    /// Role names in descriptor order.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.sys_intf_mappings.iter().map(|m| m.name.as_str())
    }
}

impl IpSetting {
    /// Prefix length of `cidr`.
    pub fn prefix_len(&self) -> u8 {
        self.cidr.prefix_len()
    }
}

/// Resolves and loads descriptors.
#[derive(Debug, Clone)]
pub struct DescriptorLoader {
    env_var: String,
}

impl DescriptorLoader {
    /// Loader reading the path from `env_var`.
    pub fn new(env_var: impl Into<String>) -> Self {
        Self {
            env_var: env_var.into(),
        }
    }

    /// Name of the environment variable consulted by [`Self::resolve_path`].
    pub fn env_var(&self) -> &str {
        &self.env_var
    }

    /// Resolve the descriptor path from the process environment.
    pub fn resolve_path(&self) -> Result<PathBuf> {
        self.resolve_path_with(|var| std::env::var_os(var))
    }

    /// Resolve the descriptor path through a custom environment lookup.
    pub fn resolve_path_with<F>(&self, lookup: F) -> Result<PathBuf>
    where
        F: FnOnce(&str) -> Option<OsString>,
    {
        match lookup(&self.env_var) {
            Some(value) if !value.is_empty() => Ok(PathBuf::from(value)),
            _ => Err(NetSetupError::EnvNotSet {
                var: self.env_var.clone(),
            }),
        }
    }

    /// Resolve the path from the environment and load it.
    pub fn load(&self) -> Result<NetworkDescriptor> {
        let path = self.resolve_path()?;
        load_from_path(&path)
    }
}

impl Default for DescriptorLoader {
    fn default() -> Self {
        Self::new(DEFAULT_DESCRIPTOR_ENV)
    }
}

/// Read, parse and validate the descriptor at `path`.
#[instrument(skip(path), fields(path = %path.as_ref().display()))]
pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<NetworkDescriptor> {
    let path = path.as_ref();

    let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::InvalidData => {
            NetSetupError::ConfigMalformed(format!("{}: not valid UTF-8", path.display()))
        }
        _ => NetSetupError::ConfigNotFound {
            path: path.to_path_buf(),
            reason: e.to_string(),
        },
    })?;

    let descriptor = NetworkDescriptor::from_yaml(&content)?;

    info!(
        mappings = descriptor.sys_intf_mappings.len(),
        ip_settings = descriptor.ip_settings.len(),
        "Network descriptor loaded"
    );
    if !descriptor.extra.is_empty() {
        debug!(
            keys = ?descriptor.extra.keys().collect::<Vec<_>>(),
            "Ignoring extra top-level descriptor keys"
        );
    }

    Ok(descriptor)
}

// =============================================================================
// RAW RECORDS
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    sys_intf_mappings: Vec<RawInterfaceMapping>,
    ip_settings: Vec<RawIpSetting>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawInterfaceMapping {
    name: String,
    #[serde(default)]
    vlan_tag: Option<i64>,
    #[serde(default)]
    bridge: Option<String>,
    #[serde(default)]
    mtu: Option<i64>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawIpSetting {
    name: String,
    cidr: String,
    #[serde(default)]
    ip_ranges: Vec<Vec<String>>,
    #[serde(default)]
    gw: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl RawDescriptor {
    fn validate(self) -> Result<NetworkDescriptor> {
        let mut names = HashSet::new();
        let mut sys_intf_mappings = Vec::with_capacity(self.sys_intf_mappings.len());
        for raw in self.sys_intf_mappings {
            if !names.insert(raw.name.clone()) {
                return Err(invalid(format!(
                    "duplicate interface mapping name '{}'",
                    raw.name
                )));
            }
            sys_intf_mappings.push(raw.validate()?);
        }

        let mut seen = HashSet::new();
        let mut ip_settings = Vec::with_capacity(self.ip_settings.len());
        for raw in self.ip_settings {
            if !names.contains(&raw.name) {
                return Err(invalid(format!(
                    "ip setting '{}' does not match any interface mapping",
                    raw.name
                )));
            }
            if !seen.insert(raw.name.clone()) {
                return Err(invalid(format!("duplicate ip setting name '{}'", raw.name)));
            }
            ip_settings.push(raw.validate()?);
        }

        Ok(NetworkDescriptor {
            sys_intf_mappings,
            ip_settings,
            extra: self.extra,
        })
    }
}

impl RawInterfaceMapping {
    fn validate(self) -> Result<InterfaceMapping> {
        let name = self.name;
        if name.trim().is_empty() {
            return Err(invalid("interface mapping name must not be empty"));
        }

        let vlan_tag = match self.vlan_tag {
            None => None,
            Some(tag) if (VLAN_TAG_MIN as i64..=VLAN_TAG_MAX as i64).contains(&tag) => {
                Some(tag as u16)
            }
            Some(tag) => {
                return Err(invalid(format!(
                    "mapping '{}': vlan_tag {} is outside {}..={}",
                    name, tag, VLAN_TAG_MIN, VLAN_TAG_MAX
                )))
            }
        };

        let mtu = match self.mtu {
            None => None,
            Some(mtu) if (MTU_MIN as i64..=MTU_MAX as i64).contains(&mtu) => Some(mtu as u32),
            Some(mtu) => {
                return Err(invalid(format!(
                    "mapping '{}': mtu {} is outside {}..={}",
                    name, mtu, MTU_MIN, MTU_MAX
                )))
            }
        };

        if let Some(bridge) = &self.bridge {
            if bridge.trim().is_empty() {
                return Err(invalid(format!("mapping '{}': bridge must not be empty", name)));
            }
        }

        Ok(InterfaceMapping {
            name,
            vlan_tag,
            bridge: self.bridge,
            mtu,
            extra: self.extra,
        })
    }
}

impl RawIpSetting {
    fn validate(self) -> Result<IpSetting> {
        let name = self.name;

        let cidr: Ipv4Net = self.cidr.trim().parse().map_err(|_| {
            invalid(format!(
                "ip setting '{}': cidr '{}' is not A.B.C.D/PP with prefix 0-32",
                name, self.cidr
            ))
        })?;

        if self.ip_ranges.is_empty() {
            return Err(invalid(format!("ip setting '{}': ip_ranges is empty", name)));
        }

        let mut ip_ranges = Vec::with_capacity(self.ip_ranges.len());
        for (i, pair) in self.ip_ranges.iter().enumerate() {
            let [start, end] = pair.as_slice() else {
                return Err(invalid(format!(
                    "ip setting '{}': ip_ranges[{}] must be a [start, end] pair",
                    name, i
                )));
            };
            let start = parse_in_network(&name, start, &cidr)?;
            let end = parse_in_network(&name, end, &cidr)?;
            if start > end {
                return Err(invalid(format!(
                    "ip setting '{}': ip_ranges[{}] starts after it ends ({} > {})",
                    name, i, start, end
                )));
            }
            ip_ranges.push(IpRange { start, end });
        }

        let gw = self
            .gw
            .as_deref()
            .map(|gw| parse_in_network(&name, gw, &cidr))
            .transpose()?;

        Ok(IpSetting {
            name,
            cidr,
            ip_ranges,
            gw,
            extra: self.extra,
        })
    }
}

fn parse_in_network(name: &str, text: &str, cidr: &Ipv4Net) -> Result<Ipv4Addr> {
    let addr: Ipv4Addr = text.trim().parse().map_err(|_| {
        invalid(format!("ip setting '{}': '{}' is not an IPv4 address", name, text))
    })?;
    if !cidr.contains(&addr) {
        return Err(invalid(format!(
            "ip setting '{}': {} lies outside {}",
            name, addr, cidr
        )));
    }
    Ok(addr)
}

fn invalid(reason: impl Into<String>) -> NetSetupError {
    NetSetupError::ConfigInvalid(reason.into())
}
