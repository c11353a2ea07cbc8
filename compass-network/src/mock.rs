//! Mock command runner for testing and development.
//!
//! Simulates the slice of an Open vSwitch + iproute2 host that netsetup
//! touches, in memory: bridges, their ports, interface types, VLAN tags, link
//! state, MTUs, IPv4 addresses and the default route. Commands are interpreted
//! from their argument vectors and answer with the exit codes and messages the
//! real tools use.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::{NetSetupError, Result};
use crate::interrupt::InterruptFlag;
use crate::runner::CommandRunner;
use crate::types::{CommandOutcome, Invocation};

/// Simulated host network state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MockHost {
    /// Bridge name -> port names
    pub bridges: BTreeMap<String, BTreeSet<String>>,
    /// Kernel interfaces, including OVS internal ports
    pub interfaces: BTreeMap<String, MockInterface>,
    /// Default route as (gateway, device)
    pub default_route: Option<(String, String)>,
}

/// Simulated interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MockInterface {
    /// OVS interface type ("" for a plain system interface)
    pub kind: String,
    /// VLAN tag of the OVS port, if any
    pub tag: Option<u16>,
    pub up: bool,
    pub mtu: u32,
    /// Addresses in `A.B.C.D/PP` form
    pub addresses: BTreeSet<String>,
}

impl MockInterface {
    /// A fresh interface of the given OVS type, down, no addresses.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            tag: None,
            up: false,
            mtu: 1500,
            addresses: BTreeSet::new(),
        }
    }
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an empty bridge.
    pub fn with_bridge(mut self, bridge: &str) -> Self {
        self.bridges.entry(bridge.to_string()).or_default();
        self
    }

    /// Attach a port of OVS type `kind` to `bridge` (created if needed).
    pub fn with_port(mut self, bridge: &str, port: &str, kind: &str) -> Self {
        self.bridges
            .entry(bridge.to_string())
            .or_default()
            .insert(port.to_string());
        self.interfaces
            .insert(port.to_string(), MockInterface::new(kind));
        self
    }

    /// Add or replace an interface.
    pub fn with_interface(mut self, name: &str, interface: MockInterface) -> Self {
        self.interfaces.insert(name.to_string(), interface);
        self
    }

    /// Bridge owning `port`, if any.
    pub fn port_bridge(&self, port: &str) -> Option<&str> {
        self.bridges
            .iter()
            .find(|(_, ports)| ports.contains(port))
            .map(|(bridge, _)| bridge.as_str())
    }

    pub fn interface(&self, name: &str) -> Option<&MockInterface> {
        self.interfaces.get(name)
    }

    /// Interpret one command against the simulated state.
    fn apply(&mut self, argv: &[&str]) -> CommandOutcome {
        match argv {
            ["ovs-vsctl", "port-to-br", port] => match self.port_bridge(port) {
                Some(bridge) => ok(format!("{}\n", bridge)),
                None => fail(1, format!("ovs-vsctl: no port named {}\n", port)),
            },
            ["ovs-vsctl", "get", "Interface", iface, "type"] => {
                if self.port_bridge(iface).is_none() {
                    return no_row(iface, "Interface");
                }
                match self.interfaces.get(*iface) {
                    Some(i) if i.kind.is_empty() => ok("\"\"\n".to_string()),
                    Some(i) => ok(format!("{}\n", i.kind)),
                    None => no_row(iface, "Interface"),
                }
            }
            ["ovs-vsctl", "--may-exist", "add-port", bridge, port, "--", "set", "Interface", iface, setting] => {
                if !self.bridges.contains_key(*bridge) {
                    return fail(1, format!("ovs-vsctl: no bridge named {}\n", bridge));
                }
                if let Some(owner) = self.port_bridge(port) {
                    if owner != *bridge {
                        return fail(
                            1,
                            format!(
                                "ovs-vsctl: \"--may-exist add-port {} {}\" but {} is actually attached to bridge {}\n",
                                bridge, port, port, owner
                            ),
                        );
                    }
                }
                let Some(kind) = setting.strip_prefix("type=") else {
                    return unsupported(argv);
                };
                if let Some(ports) = self.bridges.get_mut(*bridge) {
                    ports.insert(port.to_string());
                }
                self.interfaces
                    .entry(iface.to_string())
                    .or_insert_with(|| MockInterface::new(kind))
                    .kind = kind.to_string();
                ok(String::new())
            }
            ["ovs-vsctl", "set", "port", port, setting] => {
                let Some(tag) = setting.strip_prefix("tag=").and_then(|t| t.parse::<u16>().ok()) else {
                    return unsupported(argv);
                };
                if self.port_bridge(port).is_none() {
                    return no_row(port, "Port");
                }
                match self.interfaces.get_mut(*port) {
                    Some(i) => {
                        i.tag = Some(tag);
                        ok(String::new())
                    }
                    None => no_row(port, "Port"),
                }
            }
            ["ovs-vsctl", "clear", "port", port, "tag"] => {
                if self.port_bridge(port).is_none() {
                    return no_row(port, "Port");
                }
                match self.interfaces.get_mut(*port) {
                    Some(i) => {
                        i.tag = None;
                        ok(String::new())
                    }
                    None => no_row(port, "Port"),
                }
            }
            ["ip", "-4", "addr", "flush", "dev", iface] => match self.interfaces.get_mut(*iface) {
                Some(i) => {
                    i.addresses.clear();
                    ok(String::new())
                }
                None => fail(1, format!("Device \"{}\" does not exist.\n", iface)),
            },
            ["ip", "link", "set", iface, "up"] => match self.interfaces.get_mut(*iface) {
                Some(i) => {
                    i.up = true;
                    ok(String::new())
                }
                None => no_device(iface),
            },
            ["ip", "link", "set", "dev", iface, "mtu", mtu] => {
                let Ok(mtu) = mtu.parse::<u32>() else {
                    return unsupported(argv);
                };
                match self.interfaces.get_mut(*iface) {
                    Some(i) => {
                        i.mtu = mtu;
                        ok(String::new())
                    }
                    None => no_device(iface),
                }
            }
            ["ip", "addr", "add", address, "dev", iface] => match self.interfaces.get_mut(*iface) {
                Some(i) => {
                    if i.addresses.insert(address.to_string()) {
                        ok(String::new())
                    } else {
                        fail(2, "RTNETLINK answers: File exists\n".to_string())
                    }
                }
                None => no_device(iface),
            },
            ["ip", "route", "replace", "default", "via", gateway, "dev", iface] => {
                if !self.interfaces.contains_key(*iface) {
                    return no_device(iface);
                }
                self.default_route = Some((gateway.to_string(), iface.to_string()));
                ok(String::new())
            }
            _ => unsupported(argv),
        }
    }
}

fn ok(stdout: String) -> CommandOutcome {
    CommandOutcome {
        exit_code: 0,
        stdout,
        stderr: String::new(),
    }
}

fn fail(exit_code: i32, stderr: String) -> CommandOutcome {
    CommandOutcome {
        exit_code,
        stdout: String::new(),
        stderr,
    }
}

fn no_row(name: &str, table: &str) -> CommandOutcome {
    fail(
        1,
        format!("ovs-vsctl: no row \"{}\" in table {}\n", name, table),
    )
}

fn no_device(iface: &str) -> CommandOutcome {
    fail(1, format!("Cannot find device \"{}\"\n", iface))
}

fn unsupported(argv: &[&str]) -> CommandOutcome {
    fail(127, format!("mock: unsupported command: {}\n", argv.join(" ")))
}

/// Injected failure for commands whose text contains a pattern.
#[derive(Debug, Clone)]
enum Fault {
    Exit(CommandOutcome),
    Timeout,
    Spawn(String),
}

/// Command runner backed by a [`MockHost`].
///
/// Records every invocation; failures can be injected per command pattern and
/// an [`InterruptFlag`] can be triggered after a given number of commands.
#[derive(Debug, Default)]
pub struct MockRunner {
    host: Mutex<MockHost>,
    history: Mutex<Vec<Invocation>>,
    faults: Mutex<Vec<(String, Fault)>>,
    interrupt: Mutex<Option<(usize, InterruptFlag)>>,
}

impl MockRunner {
    /// Create a runner over `host`.
    pub fn new(host: MockHost) -> Self {
        Self {
            host: Mutex::new(host),
            ..Default::default()
        }
    }

    /// Snapshot of the simulated host.
    pub fn host(&self) -> MockHost {
        self.host.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Every invocation received so far, in order.
    pub fn history(&self) -> Vec<Invocation> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Forget the recorded history.
    pub fn clear_history(&self) {
        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }
    }

    /// Answer commands containing `pattern` with a non-zero exit.
    pub fn fail_when(&self, pattern: &str, exit_code: i32, stderr: &str) {
        self.push_fault(
            pattern,
            Fault::Exit(CommandOutcome {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            }),
        );
    }

    /// Answer commands containing `pattern` with a timeout.
    pub fn time_out_when(&self, pattern: &str) {
        self.push_fault(pattern, Fault::Timeout);
    }

    /// Answer commands containing `pattern` with a spawn failure.
    pub fn spawn_error_when(&self, pattern: &str, reason: &str) {
        self.push_fault(pattern, Fault::Spawn(reason.to_string()));
    }

    /// Trigger `flag` once `commands` commands have run.
    pub fn interrupt_after(&self, commands: usize, flag: InterruptFlag) {
        if let Ok(mut interrupt) = self.interrupt.lock() {
            *interrupt = Some((commands, flag));
        }
    }

    fn push_fault(&self, pattern: &str, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push((pattern.to_string(), fault));
        }
    }

    fn find_fault(&self, line: &str) -> Option<Fault> {
        let faults = self.faults.lock().ok()?;
        faults
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, fault)| fault.clone())
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutcome> {
        let line = invocation.to_string();
        debug!(command = %line, "Mock command");

        let count = {
            let mut history = self.history.lock().map_err(|_| spawn_error(invocation, "history lock poisoned"))?;
            history.push(invocation.clone());
            history.len()
        };

        if let Ok(interrupt) = self.interrupt.lock() {
            if let Some((after, flag)) = interrupt.as_ref() {
                if count >= *after {
                    flag.trigger();
                }
            }
        }

        match self.find_fault(&line) {
            Some(Fault::Exit(outcome)) => return Ok(outcome),
            Some(Fault::Timeout) => {
                return Err(NetSetupError::CommandTimeout {
                    command: invocation.clone(),
                    timeout: invocation.timeout.unwrap_or(Duration::from_secs(30)),
                })
            }
            Some(Fault::Spawn(reason)) => return Err(spawn_error(invocation, &reason)),
            None => {}
        }

        let argv: Vec<&str> = invocation.argv.iter().map(String::as_str).collect();
        let mut host = self
            .host
            .lock()
            .map_err(|_| spawn_error(invocation, "host lock poisoned"))?;
        Ok(host.apply(&argv))
    }
}

fn spawn_error(invocation: &Invocation, reason: &str) -> NetSetupError {
    NetSetupError::CommandSpawnError {
        command: invocation.clone(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(runner: &MockRunner, argv: &[&str]) -> CommandOutcome {
        runner
            .run(&Invocation::new(argv.iter().copied()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_port_lifecycle() {
        let runner = MockRunner::new(MockHost::new().with_bridge("br-external"));

        let missing = run(&runner, &["ovs-vsctl", "port-to-br", "mgmt_vnic"]).await;
        assert_eq!(missing.exit_code, 1);
        assert!(missing.stderr.contains("no port named"));

        let add = run(
            &runner,
            &[
                "ovs-vsctl", "--may-exist", "add-port", "br-external", "mgmt_vnic", "--",
                "set", "Interface", "mgmt_vnic", "type=internal",
            ],
        )
        .await;
        assert!(add.success());

        let owner = run(&runner, &["ovs-vsctl", "port-to-br", "mgmt_vnic"]).await;
        assert_eq!(owner.stdout, "br-external\n");

        let kind = run(&runner, &["ovs-vsctl", "get", "Interface", "mgmt_vnic", "type"]).await;
        assert_eq!(kind.stdout, "internal\n");

        assert!(run(&runner, &["ovs-vsctl", "set", "port", "mgmt_vnic", "tag=42"]).await.success());
        assert_eq!(runner.host().interface("mgmt_vnic").unwrap().tag, Some(42));
        assert!(run(&runner, &["ovs-vsctl", "clear", "port", "mgmt_vnic", "tag"]).await.success());
        assert_eq!(runner.host().interface("mgmt_vnic").unwrap().tag, None);
    }

    #[tokio::test]
    async fn test_address_semantics() {
        let runner = MockRunner::new(MockHost::new().with_port("br-external", "mgmt_vnic", "internal"));

        let add = ["ip", "addr", "add", "10.0.0.5/24", "dev", "mgmt_vnic"];
        assert!(run(&runner, &add).await.success());

        let again = run(&runner, &add).await;
        assert_eq!(again.exit_code, 2);
        assert!(again.stderr.contains("File exists"));

        assert!(run(&runner, &["ip", "-4", "addr", "flush", "dev", "mgmt_vnic"]).await.success());
        assert!(runner.host().interface("mgmt_vnic").unwrap().addresses.is_empty());

        let gone = run(&runner, &["ip", "link", "set", "eth9", "up"]).await;
        assert_eq!(gone.exit_code, 1);
    }

    #[tokio::test]
    async fn test_system_interface_type_is_quoted_empty() {
        let runner = MockRunner::new(MockHost::new().with_port("br-external", "eth1", ""));
        let kind = run(&runner, &["ovs-vsctl", "get", "Interface", "eth1", "type"]).await;
        assert_eq!(kind.stdout, "\"\"\n");
    }

    #[tokio::test]
    async fn test_faults_and_history() {
        let runner = MockRunner::new(MockHost::new());
        runner.fail_when("link set", 2, "RTNETLINK answers: Operation not permitted\n");
        runner.time_out_when("route");

        let failed = run(&runner, &["ip", "link", "set", "mgmt_vnic", "up"]).await;
        assert_eq!(failed.exit_code, 2);

        let timed_out = runner
            .run(&Invocation::new(["ip", "route", "replace", "default"]))
            .await;
        assert!(matches!(timed_out, Err(NetSetupError::CommandTimeout { .. })));

        let unknown = run(&runner, &["brctl", "show"]).await;
        assert_eq!(unknown.exit_code, 127);

        assert_eq!(runner.history().len(), 3);
        runner.clear_history();
        assert!(runner.history().is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_after() {
        let runner = MockRunner::new(MockHost::new());
        let flag = InterruptFlag::new();
        runner.interrupt_after(2, flag.clone());

        run(&runner, &["brctl", "show"]).await;
        assert!(!flag.is_triggered());
        run(&runner, &["brctl", "show"]).await;
        assert!(flag.is_triggered());
    }
}
