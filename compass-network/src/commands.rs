//! Argument vectors for the host networking tools.
//!
//! Every host command netsetup issues is built here, so the exact
//! `ovs-vsctl` / `ip` surface other deployment tooling observes lives in one
//! place.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::types::Invocation;

const OVS_VSCTL: &str = "ovs-vsctl";
const IP: &str = "ip";

/// `ovs-vsctl port-to-br <port>`: prints the owning bridge, exit 1 if absent.
pub fn port_to_bridge(port: &str) -> Invocation {
    Invocation::new([OVS_VSCTL, "port-to-br", port])
}

/// `ovs-vsctl get Interface <iface> type`.
pub fn interface_type(iface: &str) -> Invocation {
    Invocation::new([OVS_VSCTL, "get", "Interface", iface, "type"])
}

/// Create `port` on `bridge` as an internal port.
pub fn add_internal_port(bridge: &str, port: &str) -> Invocation {
    Invocation::new([
        OVS_VSCTL,
        "--may-exist",
        "add-port",
        bridge,
        port,
        "--",
        "set",
        "Interface",
        port,
        "type=internal",
    ])
}

pub fn set_port_tag(port: &str, tag: u16) -> Invocation {
    let tag = format!("tag={}", tag);
    Invocation::new([OVS_VSCTL, "set", "port", port, tag.as_str()])
}

pub fn clear_port_tag(port: &str) -> Invocation {
    Invocation::new([OVS_VSCTL, "clear", "port", port, "tag"])
}

/// Remove every IPv4 address of `iface`.
pub fn flush_ipv4(iface: &str) -> Invocation {
    Invocation::new([IP, "-4", "addr", "flush", "dev", iface])
}

pub fn set_mtu(iface: &str, mtu: u32) -> Invocation {
    let mtu = mtu.to_string();
    Invocation::new([IP, "link", "set", "dev", iface, "mtu", mtu.as_str()])
}

pub fn link_up(iface: &str) -> Invocation {
    Invocation::new([IP, "link", "set", iface, "up"])
}

/// `ip addr add A.B.C.D/PP dev <iface>`.
pub fn add_address(iface: &str, address: &Ipv4Net) -> Invocation {
    let address = address.to_string();
    Invocation::new([IP, "addr", "add", address.as_str(), "dev", iface])
}

pub fn replace_default_route(iface: &str, gateway: Ipv4Addr) -> Invocation {
    let gateway = gateway.to_string();
    Invocation::new([
        IP,
        "route",
        "replace",
        "default",
        "via",
        gateway.as_str(),
        "dev",
        iface,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_side_contract() {
        assert_eq!(
            add_internal_port("br-external", "mgmt_vnic").to_string(),
            "ovs-vsctl --may-exist add-port br-external mgmt_vnic -- set Interface mgmt_vnic type=internal"
        );
        assert_eq!(set_port_tag("mgmt_vnic", 42).to_string(), "ovs-vsctl set port mgmt_vnic tag=42");
        assert_eq!(flush_ipv4("mgmt_vnic").to_string(), "ip -4 addr flush dev mgmt_vnic");
        assert_eq!(link_up("mgmt_vnic").to_string(), "ip link set mgmt_vnic up");

        let address: Ipv4Net = "192.168.10.200/24".parse().unwrap();
        assert_eq!(
            add_address("mgmt_vnic", &address).argv,
            ["ip", "addr", "add", "192.168.10.200/24", "dev", "mgmt_vnic"]
        );
        assert_eq!(
            replace_default_route("mgmt_vnic", Ipv4Addr::new(10, 1, 0, 1)).to_string(),
            "ip route replace default via 10.1.0.1 dev mgmt_vnic"
        );
    }
}
