//! Host network actuator.
//!
//! Converges the host to a [`NetworkDescriptor`] for every role in the
//! management-role set. Per role, on port `<role>_vnic`:
//!
//! ```text
//! ensure-port ──► flush-addresses ──► link-up ──► vlan-tag ──► assign-address ──► default-route
//!  (query, then     (ip -4 addr        (mtu,       (set/clear    (ip addr add,      (optional,
//!   add-port or      flush)             up)         tag)          "File exists"      gw + flag)
//!   PortConflict)                                                 is satisfied)
//! ```
//!
//! Every step is a desired-state command or guarded by a state read, so a run
//! after any partial run converges. Any unexpected outcome stops the sequence:
//! steps before the failing one stay applied, later ones never run.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::commands;
use crate::descriptor::{IpSetting, NetworkDescriptor};
use crate::error::{FailureDetail, NetSetupError, Result};
use crate::interrupt::InterruptFlag;
use crate::runner::CommandRunner;
use crate::types::{CommandOutcome, Invocation, Step};

/// Default bridge for management ports.
pub const DEFAULT_BRIDGE: &str = "br-external";
/// Default management role.
pub const DEFAULT_ROLE: &str = "mgmt";
/// Suffix appended to a role name to form its port name.
pub const PORT_SUFFIX: &str = "_vnic";

/// Longest Linux interface name (IFNAMSIZ - 1).
const MAX_IFNAME_LEN: usize = 15;

/// Which address of an IP setting the deployment host takes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostAddressPolicy {
    /// `ip_ranges[0][1]`: the host sits at the top of the first pool and
    /// deployed nodes are handed addresses upward from its start.
    #[default]
    LastOfFirstRange,
    /// `ip_ranges[0][0]`
    FirstOfFirstRange,
}

impl HostAddressPolicy {
    /// Pick the host address from `setting`.
    pub fn select(&self, setting: &IpSetting) -> Option<Ipv4Addr> {
        let range = setting.ip_ranges.first()?;
        Some(match self {
            HostAddressPolicy::LastOfFirstRange => range.end,
            HostAddressPolicy::FirstOfFirstRange => range.start,
        })
    }
}

/// Actuator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorOptions {
    /// Bridge used when a mapping has no bridge hint
    pub bridge: String,
    /// Roles that may be mutated
    pub roles: BTreeSet<String>,
    pub address_policy: HostAddressPolicy,
    /// Point the default route at the role's `gw` when it has one
    pub manage_default_route: bool,
}

impl Default for ActuatorOptions {
    fn default() -> Self {
        Self {
            bridge: DEFAULT_BRIDGE.to_string(),
            roles: BTreeSet::from([DEFAULT_ROLE.to_string()]),
            address_policy: HostAddressPolicy::default(),
            manage_default_route: false,
        }
    }
}

/// Desired host state for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleTarget {
    pub role: String,
    pub port: String,
    pub bridge: String,
    pub vlan_tag: Option<u16>,
    pub mtu: Option<u32>,
    /// Host address with the prefix of the role's `cidr`
    pub address: Option<Ipv4Net>,
    /// Gateway to install as default route
    pub gateway: Option<Ipv4Addr>,
}

impl RoleTarget {
    /// The mutating commands each step issues, ignoring current host state.
    pub fn plan(&self) -> Vec<PlannedStep> {
        let mut steps = vec![
            PlannedStep {
                step: Step::EnsurePort,
                commands: vec![commands::add_internal_port(&self.bridge, &self.port)],
            },
            PlannedStep {
                step: Step::FlushAddresses,
                commands: vec![commands::flush_ipv4(&self.port)],
            },
            PlannedStep {
                step: Step::LinkUp,
                commands: self.link_up_commands(),
            },
            PlannedStep {
                step: Step::VlanTag,
                commands: vec![self.vlan_command()],
            },
        ];
        if let Some(address) = &self.address {
            steps.push(PlannedStep {
                step: Step::AssignAddress,
                commands: vec![commands::add_address(&self.port, address)],
            });
        }
        if let Some(gateway) = self.gateway {
            steps.push(PlannedStep {
                step: Step::DefaultRoute,
                commands: vec![commands::replace_default_route(&self.port, gateway)],
            });
        }
        steps
    }

    fn link_up_commands(&self) -> Vec<Invocation> {
        let mut cmds = Vec::with_capacity(2);
        if let Some(mtu) = self.mtu {
            cmds.push(commands::set_mtu(&self.port, mtu));
        }
        cmds.push(commands::link_up(&self.port));
        cmds
    }

    fn vlan_command(&self) -> Invocation {
        match self.vlan_tag {
            Some(tag) => commands::set_port_tag(&self.port, tag),
            None => commands::clear_port_tag(&self.port),
        }
    }
}

/// One step of a dry-run plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedStep {
    pub step: Step,
    pub commands: Vec<Invocation>,
}

/// Dry-run plan for a role.
#[derive(Debug, Clone, Serialize)]
pub struct RolePlan {
    pub target: RoleTarget,
    pub steps: Vec<PlannedStep>,
}

/// What a completed step did.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: Step,
    /// Every command issued, queries included
    pub commands: Vec<Invocation>,
    /// Whether a mutating command changed host state
    pub changed: bool,
}

/// Result of converging one role.
#[derive(Debug, Clone, Serialize)]
pub struct RoleReport {
    pub role: String,
    pub port: String,
    pub bridge: String,
    pub steps: Vec<StepRecord>,
}

/// Result of a full actuation run.
#[derive(Debug, Clone, Serialize)]
pub struct ActuationReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub roles: Vec<RoleReport>,
    /// Descriptor roles outside the management-role set
    pub unmanaged_roles: Vec<String>,
    /// Management roles the descriptor does not map
    pub missing_roles: Vec<String>,
}

/// Resolved targets plus the roles that were left alone.
#[derive(Debug, Clone)]
pub struct Selection {
    pub targets: Vec<RoleTarget>,
    pub unmanaged_roles: Vec<String>,
    pub missing_roles: Vec<String>,
}

/// Resolve the management roles of `descriptor` into targets.
pub fn select_targets(descriptor: &NetworkDescriptor, options: &ActuatorOptions) -> Result<Selection> {
    let mut targets = Vec::new();
    let mut unmanaged_roles = Vec::new();

    for mapping in &descriptor.sys_intf_mappings {
        if !options.roles.contains(&mapping.name) {
            unmanaged_roles.push(mapping.name.clone());
            continue;
        }

        let port = port_name(&mapping.name)?;
        let setting = descriptor.ip_setting(&mapping.name);
        let address = setting
            .and_then(|s| {
                options
                    .address_policy
                    .select(s)
                    .map(|addr| Ipv4Net::new(addr, s.prefix_len()))
            })
            .transpose()
            .map_err(|e| NetSetupError::ConfigInvalid(format!("role '{}': {}", mapping.name, e)))?;
        let gateway = if options.manage_default_route {
            setting.and_then(|s| s.gw)
        } else {
            None
        };

        targets.push(RoleTarget {
            role: mapping.name.clone(),
            port,
            bridge: mapping
                .bridge
                .clone()
                .unwrap_or_else(|| options.bridge.clone()),
            vlan_tag: mapping.vlan_tag,
            mtu: mapping.mtu,
            address,
            gateway,
        });
    }

    let missing_roles: Vec<String> = options
        .roles
        .iter()
        .filter(|role| descriptor.mapping(role).is_none())
        .cloned()
        .collect();

    Ok(Selection {
        targets,
        unmanaged_roles,
        missing_roles,
    })
}

/// Port name of a role, validated as a Linux interface name.
pub fn port_name(role: &str) -> Result<String> {
    let port = format!("{}{}", role, PORT_SUFFIX);
    if port.len() > MAX_IFNAME_LEN {
        return Err(NetSetupError::ConfigInvalid(format!(
            "role '{}': port name '{}' exceeds {} characters",
            role, port, MAX_IFNAME_LEN
        )));
    }
    if !port
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(NetSetupError::ConfigInvalid(format!(
            "role '{}': '{}' is not a valid interface name",
            role, port
        )));
    }
    Ok(port)
}

/// Applies descriptors to the host through a [`CommandRunner`].
pub struct HostNetworkActuator<R> {
    runner: R,
    options: ActuatorOptions,
    interrupt: InterruptFlag,
}

impl<R: CommandRunner> HostNetworkActuator<R> {
    pub fn new(runner: R, options: ActuatorOptions) -> Self {
        Self {
            runner,
            options,
            interrupt: InterruptFlag::new(),
        }
    }

    /// Stop before the next step once `interrupt` is triggered.
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn options(&self) -> &ActuatorOptions {
        &self.options
    }

    /// Dry-run plan: the mutating commands per role, without touching the host.
    pub fn plan(&self, descriptor: &NetworkDescriptor) -> Result<Vec<RolePlan>> {
        let selection = select_targets(descriptor, &self.options)?;
        Ok(selection
            .targets
            .into_iter()
            .map(|target| RolePlan {
                steps: target.plan(),
                target,
            })
            .collect())
    }

    /// Converge every management role, in descriptor order.
    #[instrument(skip_all, fields(bridge = %self.options.bridge))]
    pub async fn apply(&self, descriptor: &NetworkDescriptor) -> Result<ActuationReport> {
        let started_at = Utc::now();
        let selection = select_targets(descriptor, &self.options)?;

        for role in &selection.missing_roles {
            warn!(role = %role, "Management role not present in descriptor, skipping");
        }
        for role in &selection.unmanaged_roles {
            debug!(role = %role, "Role not in management set, leaving untouched");
        }

        let mut roles = Vec::with_capacity(selection.targets.len());
        for target in &selection.targets {
            roles.push(self.converge(target).await?);
        }

        Ok(ActuationReport {
            started_at,
            finished_at: Utc::now(),
            roles,
            unmanaged_roles: selection.unmanaged_roles,
            missing_roles: selection.missing_roles,
        })
    }

    #[instrument(skip_all, fields(role = %target.role, port = %target.port))]
    async fn converge(&self, target: &RoleTarget) -> Result<RoleReport> {
        info!(
            bridge = %target.bridge,
            vlan_tag = ?target.vlan_tag,
            address = ?target.address.map(|a| a.to_string()),
            "Converging role"
        );

        let mut steps = Vec::new();

        self.checkpoint(target, Step::EnsurePort)?;
        steps.push(self.ensure_port(target).await?);

        self.checkpoint(target, Step::FlushAddresses)?;
        let flush = commands::flush_ipv4(&target.port);
        self.exec_ok(target, Step::FlushAddresses, &flush).await?;
        steps.push(done(target, Step::FlushAddresses, vec![flush], true));

        self.checkpoint(target, Step::LinkUp)?;
        let link = target.link_up_commands();
        for cmd in &link {
            self.exec_ok(target, Step::LinkUp, cmd).await?;
        }
        steps.push(done(target, Step::LinkUp, link, true));

        self.checkpoint(target, Step::VlanTag)?;
        let vlan = target.vlan_command();
        self.exec_ok(target, Step::VlanTag, &vlan).await?;
        steps.push(done(target, Step::VlanTag, vec![vlan], true));

        if let Some(address) = &target.address {
            self.checkpoint(target, Step::AssignAddress)?;
            steps.push(self.assign_address(target, address).await?);
        } else {
            debug!("No ip setting for role, leaving the link unaddressed");
        }

        if let Some(gateway) = target.gateway {
            self.checkpoint(target, Step::DefaultRoute)?;
            let route = commands::replace_default_route(&target.port, gateway);
            self.exec_ok(target, Step::DefaultRoute, &route).await?;
            steps.push(done(target, Step::DefaultRoute, vec![route], true));
        }

        Ok(RoleReport {
            role: target.role.clone(),
            port: target.port.clone(),
            bridge: target.bridge.clone(),
            steps,
        })
    }

    /// Step 1: create the internal port, or verify the existing one.
    ///
    /// Conflicts are detected from reads only, before anything is mutated.
    async fn ensure_port(&self, target: &RoleTarget) -> Result<StepRecord> {
        let step = Step::EnsurePort;
        let query = commands::port_to_bridge(&target.port);
        let owner = self.exec(target, step, &query).await?;
        let mut issued = vec![query];

        if !owner.success() {
            if !owner.stderr.contains("no port named") {
                return Err(self.failed(target, step, issued.remove(0), owner));
            }
            let add = commands::add_internal_port(&target.bridge, &target.port);
            self.exec_ok(target, step, &add).await?;
            issued.push(add);
            return Ok(done(target, step, issued, true));
        }

        let bridge = owner.stdout.trim();
        if bridge != target.bridge {
            return Err(NetSetupError::PortConflict {
                port: target.port.clone(),
                found: format!(
                    "attached to bridge {} instead of {}",
                    bridge, target.bridge
                ),
            });
        }

        let query = commands::interface_type(&target.port);
        let kind = self.exec(target, step, &query).await?;
        if !kind.success() {
            return Err(self.failed(target, step, query, kind));
        }
        issued.push(query);

        match kind.stdout.trim().trim_matches('"') {
            "internal" => Ok(done(target, step, issued, false)),
            other => Err(NetSetupError::PortConflict {
                port: target.port.clone(),
                found: format!(
                    "interface type '{}' instead of 'internal'",
                    if other.is_empty() { "system" } else { other }
                ),
            }),
        }
    }

    /// Step 5: add the host address; an existing identical address satisfies it.
    async fn assign_address(&self, target: &RoleTarget, address: &Ipv4Net) -> Result<StepRecord> {
        let step = Step::AssignAddress;
        let add = commands::add_address(&target.port, address);
        let outcome = self.exec(target, step, &add).await?;

        if outcome.success() {
            return Ok(done(target, step, vec![add], true));
        }
        if outcome.stderr.contains("File exists") {
            debug!(address = %address, "Address already assigned");
            return Ok(done(target, step, vec![add], false));
        }
        Err(self.failed(target, step, add, outcome))
    }

    fn checkpoint(&self, target: &RoleTarget, step: Step) -> Result<()> {
        if self.interrupt.is_triggered() {
            warn!(role = %target.role, step = %step, "Interrupted, not starting step");
            return Err(NetSetupError::Interrupted {
                role: target.role.clone(),
                step,
            });
        }
        Ok(())
    }

    /// Run a command, turning transport errors into `ActuationFailed`.
    async fn exec(&self, target: &RoleTarget, step: Step, cmd: &Invocation) -> Result<CommandOutcome> {
        debug!(step = %step, command = %cmd, "Running");
        self.runner.run(cmd).await.map_err(|e| match e {
            NetSetupError::CommandTimeout { command, timeout } => {
                self.step_error(target, step, command, FailureDetail::Timeout(timeout))
            }
            NetSetupError::CommandSpawnError { command, reason } => {
                self.step_error(target, step, command, FailureDetail::Spawn(reason))
            }
            other => other,
        })
    }

    /// Run a desired-state command that must exit zero.
    async fn exec_ok(&self, target: &RoleTarget, step: Step, cmd: &Invocation) -> Result<()> {
        let outcome = self.exec(target, step, cmd).await?;
        if outcome.success() {
            Ok(())
        } else {
            Err(self.failed(target, step, cmd.clone(), outcome))
        }
    }

    fn failed(
        &self,
        target: &RoleTarget,
        step: Step,
        command: Invocation,
        outcome: CommandOutcome,
    ) -> NetSetupError {
        self.step_error(target, step, command, FailureDetail::Exit(outcome))
    }

    /// A terminal Ctrl-C also kills the running child, so a failure seen while
    /// the flag is set is reported as the interruption.
    fn step_error(
        &self,
        target: &RoleTarget,
        step: Step,
        command: Invocation,
        detail: FailureDetail,
    ) -> NetSetupError {
        if self.interrupt.is_triggered() {
            warn!(
                role = %target.role,
                step = %step,
                command = %command,
                detail = %detail,
                "Command failed after interrupt"
            );
            return NetSetupError::Interrupted {
                role: target.role.clone(),
                step,
            };
        }
        NetSetupError::ActuationFailed {
            step,
            command,
            detail,
        }
    }
}

fn done(target: &RoleTarget, step: Step, commands: Vec<Invocation>, changed: bool) -> StepRecord {
    info!(role = %target.role, port = %target.port, step = %step, changed, "Step complete");
    StepRecord {
        step,
        commands,
        changed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(yaml: &str) -> NetworkDescriptor {
        NetworkDescriptor::from_yaml(yaml).unwrap()
    }

    const MULTI_ROLE: &str = r#"
sys_intf_mappings:
  - name: mgmt
    vlan_tag: 42
  - name: storage
    bridge: br-storage
    mtu: 9000
ip_settings:
  - name: mgmt
    cidr: 192.168.10.0/24
    gw: 192.168.10.1
    ip_ranges:
      - [192.168.10.100, 192.168.10.200]
      - [192.168.10.220, 192.168.10.250]
  - name: storage
    cidr: 172.16.0.0/16
    ip_ranges:
      - [172.16.1.1, 172.16.1.254]
"#;

    #[test]
    fn test_address_policy() {
        let d = descriptor(MULTI_ROLE);
        let setting = d.ip_setting("mgmt").unwrap();
        assert_eq!(
            HostAddressPolicy::LastOfFirstRange.select(setting),
            Some(Ipv4Addr::new(192, 168, 10, 200))
        );
        assert_eq!(
            HostAddressPolicy::FirstOfFirstRange.select(setting),
            Some(Ipv4Addr::new(192, 168, 10, 100))
        );
    }

    #[test]
    fn test_default_selection() {
        let d = descriptor(MULTI_ROLE);
        let selection = select_targets(&d, &ActuatorOptions::default()).unwrap();

        assert_eq!(selection.targets.len(), 1);
        assert_eq!(selection.unmanaged_roles, ["storage"]);
        assert!(selection.missing_roles.is_empty());

        let mgmt = &selection.targets[0];
        assert_eq!(mgmt.port, "mgmt_vnic");
        assert_eq!(mgmt.bridge, "br-external");
        assert_eq!(mgmt.vlan_tag, Some(42));
        assert_eq!(mgmt.address.unwrap().to_string(), "192.168.10.200/24");
        assert_eq!(mgmt.gateway, None);
    }

    #[test]
    fn test_selection_with_hints_and_routes() {
        let d = descriptor(MULTI_ROLE);
        let options = ActuatorOptions {
            roles: BTreeSet::from(["mgmt".to_string(), "storage".to_string(), "external".to_string()]),
            manage_default_route: true,
            ..Default::default()
        };
        let selection = select_targets(&d, &options).unwrap();

        assert_eq!(selection.targets.len(), 2);
        assert_eq!(selection.missing_roles, ["external"]);
        assert_eq!(selection.targets[0].gateway, Some(Ipv4Addr::new(192, 168, 10, 1)));

        let storage = &selection.targets[1];
        assert_eq!(storage.bridge, "br-storage");
        assert_eq!(storage.mtu, Some(9000));
        assert_eq!(storage.address.unwrap().to_string(), "172.16.1.254/16");
    }

    #[test]
    fn test_port_name_validation() {
        assert_eq!(port_name("mgmt").unwrap(), "mgmt_vnic");
        assert!(matches!(port_name("verylongrole"), Err(NetSetupError::ConfigInvalid(_))));
        assert!(matches!(port_name("a b"), Err(NetSetupError::ConfigInvalid(_))));
    }

    #[test]
    fn test_plan_untagged_without_addressing() {
        let d = descriptor("sys_intf_mappings:\n  - name: mgmt\nip_settings: []\n");
        let selection = select_targets(&d, &ActuatorOptions::default()).unwrap();
        let plan = selection.targets[0].plan();

        let steps: Vec<Step> = plan.iter().map(|p| p.step).collect();
        assert_eq!(
            steps,
            [Step::EnsurePort, Step::FlushAddresses, Step::LinkUp, Step::VlanTag]
        );
        assert_eq!(
            plan[3].commands[0].to_string(),
            "ovs-vsctl clear port mgmt_vnic tag"
        );
    }
}
