//! Shell command builders, NAT rule builders and device naming

use l3_agent_common::shell;
use l3_agent_common::{AgentError, AgentResult};
use l3_agent_types::{PortForwardRule, Route};
use once_cell::sync::Lazy;
use regex::Regex;

/// Prefix of router namespaces
pub const NS_PREFIX: &str = "qrouter-";
/// Prefix of floating-IP namespaces of distributed routers
pub const FIP_NS_PREFIX: &str = "fip-";
/// Prefix of internal router devices
pub const INTERNAL_DEV_PREFIX: &str = "qr-";
/// Prefix of external gateway devices
pub const EXTERNAL_DEV_PREFIX: &str = "qg-";
/// Prefix of HA devices
pub const HA_DEV_PREFIX: &str = "ha-";
/// Prefix of the router side of the link into the floating-IP namespace
pub const RTR_FIP_DEV_PREFIX: &str = "rfp-";

/// Linux limits interface names to 15 bytes including the NUL
pub const DEVICE_NAME_LEN: usize = 14;

/// Default Open vSwitch integration bridge
pub const OVS_INTEGRATION_BRIDGE: &str = "br-int";

fn device_name(prefix: &str, id: &str) -> String {
    let keep = DEVICE_NAME_LEN - prefix.len();
    let short: String = id.chars().take(keep).collect();
    format!("{}{}", prefix, short)
}

/// Namespace of a router
pub fn router_ns_name(router_id: &str) -> String {
    format!("{}{}", NS_PREFIX, router_id)
}

/// Floating-IP namespace of an external network
pub fn fip_ns_name(ext_net_id: &str) -> String {
    format!("{}{}", FIP_NS_PREFIX, ext_net_id)
}

/// Device of an internal router port
pub fn internal_device_name(port_id: &str) -> String {
    device_name(INTERNAL_DEV_PREFIX, port_id)
}

/// Device of the external gateway port
pub fn external_device_name(port_id: &str) -> String {
    device_name(EXTERNAL_DEV_PREFIX, port_id)
}

/// Device of the HA port
pub fn ha_device_name(port_id: &str) -> String {
    device_name(HA_DEV_PREFIX, port_id)
}

/// Router side of the link into the floating-IP namespace
pub fn rtr_fip_device_name(router_id: &str) -> String {
    device_name(RTR_FIP_DEV_PREFIX, router_id)
}

/// Linux bridge of a network
pub fn linux_bridge_name(network_id: &str) -> String {
    device_name("brq", network_id)
}

/// Root-namespace peer of a veth pair
pub fn tap_device_name(device: &str) -> String {
    let suffix = device.get(3..).unwrap_or(device);
    format!("tap{}", suffix)
}

/// Wrap a command so that it runs inside `namespace`
pub fn ns_exec(namespace: Option<&str>, cmd: &str) -> String {
    match namespace {
        Some(ns) => format!(
            "{} netns exec {} {}",
            shell::IP_CMD,
            shell::shellquote(ns),
            cmd
        ),
        None => cmd.to_string(),
    }
}

/// Build namespace creation command
pub fn build_netns_add_cmd(ns: &str) -> String {
    format!("{} netns add {}", shell::IP_CMD, shell::shellquote(ns))
}

/// Build namespace deletion command
pub fn build_netns_delete_cmd(ns: &str) -> String {
    format!("{} netns delete {}", shell::IP_CMD, shell::shellquote(ns))
}

/// Build namespace listing command
pub fn build_netns_list_cmd() -> String {
    format!("{} netns list", shell::IP_CMD)
}

/// Build device query command
pub fn build_link_show_cmd(device: &str) -> String {
    format!(
        "{} link show dev {}",
        shell::IP_CMD,
        shell::shellquote(device)
    )
}

/// Build device bring-up command
pub fn build_link_set_up_cmd(device: &str) -> String {
    format!("{} link set {} up", shell::IP_CMD, shell::shellquote(device))
}

/// Build MAC assignment command
pub fn build_link_set_mac_cmd(device: &str, mac: &str) -> String {
    format!(
        "{} link set {} address {}",
        shell::IP_CMD,
        shell::shellquote(device),
        shell::shellquote(mac)
    )
}

/// Build command moving a device into a namespace
pub fn build_link_set_netns_cmd(device: &str, ns: &str) -> String {
    format!(
        "{} link set {} netns {}",
        shell::IP_CMD,
        shell::shellquote(device),
        shell::shellquote(ns)
    )
}

/// Build device deletion command
pub fn build_link_del_cmd(device: &str) -> String {
    format!("{} link del {}", shell::IP_CMD, shell::shellquote(device))
}

/// Build veth pair creation command
pub fn build_veth_add_cmd(tap: &str, device: &str) -> String {
    format!(
        "{} link add {} type veth peer name {}",
        shell::IP_CMD,
        shell::shellquote(tap),
        shell::shellquote(device)
    )
}

/// Build Open vSwitch internal port creation command
pub fn build_ovs_add_port_cmd(bridge: &str, device: &str, port_id: &str, mac: &str) -> String {
    format!(
        "{} -- --may-exist add-port {} {} -- set Interface {} type=internal \
         -- set Interface {} external-ids:iface-id={} external-ids:attached-mac={}",
        shell::OVS_VSCTL_CMD,
        shell::shellquote(bridge),
        shell::shellquote(device),
        shell::shellquote(device),
        shell::shellquote(device),
        shell::shellquote(port_id),
        shell::shellquote(mac)
    )
}

/// Build Open vSwitch port deletion command
pub fn build_ovs_del_port_cmd(bridge: &str, device: &str) -> String {
    format!(
        "{} -- --if-exists del-port {} {}",
        shell::OVS_VSCTL_CMD,
        shell::shellquote(bridge),
        shell::shellquote(device)
    )
}

/// Build Linux bridge enslave command
pub fn build_brctl_addif_cmd(bridge: &str, device: &str) -> String {
    format!(
        "{} addif {} {}",
        shell::BRCTL_CMD,
        shell::shellquote(bridge),
        shell::shellquote(device)
    )
}

fn family_flag(cidr: &str) -> &'static str {
    if cidr.contains(':') {
        "-6"
    } else {
        "-4"
    }
}

/// Build address add command
pub fn build_addr_add_cmd(device: &str, cidr: &str) -> String {
    format!(
        "{} {} addr add {} dev {}",
        shell::IP_CMD,
        family_flag(cidr),
        shell::shellquote(cidr),
        shell::shellquote(device)
    )
}

/// Build address delete command
pub fn build_addr_del_cmd(device: &str, cidr: &str) -> String {
    format!(
        "{} {} addr del {} dev {}",
        shell::IP_CMD,
        family_flag(cidr),
        shell::shellquote(cidr),
        shell::shellquote(device)
    )
}

/// Build IPv4 address listing command
pub fn build_addr_show_cmd(device: &str) -> String {
    format!(
        "{} -o -4 addr show dev {}",
        shell::IP_CMD,
        shell::shellquote(device)
    )
}

/// Build route replace command
pub fn build_route_replace_cmd(route: &Route) -> String {
    format!(
        "{} route replace {} via {}",
        shell::IP_CMD,
        shell::shellquote(&route.destination),
        shell::shellquote(&route.nexthop)
    )
}

/// Build route delete command
pub fn build_route_del_cmd(route: &Route) -> String {
    format!(
        "{} route del {} via {}",
        shell::IP_CMD,
        shell::shellquote(&route.destination),
        shell::shellquote(&route.nexthop)
    )
}

/// Build IPv4 forwarding command
pub fn build_enable_forwarding_cmd() -> String {
    format!("{} -w net.ipv4.ip_forward=1", shell::SYSCTL_CMD)
}

/// DNAT rule of one port-forwarding entry, for the PREROUTING chain
pub fn build_dnat_rule(rule: &PortForwardRule) -> AgentResult<String> {
    let outside_addr = rule.outside_addr.as_deref().ok_or_else(|| {
        AgentError::internal(format!("port forwarding {} has no outside address", rule))
    })?;
    Ok(format!(
        "-p {} -d {} --dport {} -j DNAT --to {}:{}",
        rule.protocol, outside_addr, rule.outside_port, rule.inside_addr, rule.inside_port
    ))
}

/// 1:1 NAT rules of a floating IP as (chain, rule) pairs
pub fn floating_forward_rules(floating_ip: &str, fixed_ip: &str) -> Vec<(&'static str, String)> {
    vec![
        (
            "PREROUTING",
            format!("-d {}/32 -j DNAT --to {}", floating_ip, fixed_ip),
        ),
        (
            "OUTPUT",
            format!("-d {}/32 -j DNAT --to {}", floating_ip, fixed_ip),
        ),
        (
            "float-snat",
            format!("-s {}/32 -j SNAT --to {}", fixed_ip, floating_ip),
        ),
    ]
}

/// Default SNAT rules of a gateway as (chain, rule) pairs
pub fn external_gateway_nat_rules(ex_gw_ip: &str, interface: &str) -> Vec<(&'static str, String)> {
    vec![
        (
            "POSTROUTING",
            format!(
                "! -i {} ! -o {} -m conntrack ! --ctstate DNAT -j ACCEPT",
                interface, interface
            ),
        ),
        (
            "snat",
            format!("-o {} -j SNAT --to-source {}", interface, ex_gw_ip),
        ),
    ]
}

/// Parse `ip netns list` output into namespace names
pub fn parse_netns_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

static INET_ADDR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\binet6?\s+(\S+)").expect("Invalid regex pattern"));

/// Parse `ip -o addr show` output into CIDRs
pub fn parse_addr_show(output: &str) -> Vec<String> {
    INET_ADDR_RE
        .captures_iter(output)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use l3_agent_types::Protocol;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_device_names_are_truncated() {
        let port_id = "5c4b3a2f-1d2e-4f5a-9b8c-7d6e5f4a3b2c";
        assert_eq!(internal_device_name(port_id), "qr-5c4b3a2f-1d");
        assert_eq!(external_device_name(port_id), "qg-5c4b3a2f-1d");
        assert_eq!(ha_device_name(port_id), "ha-5c4b3a2f-1d");
        assert_eq!(rtr_fip_device_name(port_id), "rfp-5c4b3a2f-1");
        assert_eq!(internal_device_name(port_id).len(), DEVICE_NAME_LEN);
        assert_eq!(tap_device_name("qr-5c4b3a2f-1d"), "tap5c4b3a2f-1d");
    }

    #[test]
    fn test_namespace_names() {
        assert_eq!(router_ns_name("r1"), "qrouter-r1");
        assert_eq!(fip_ns_name("ext"), "fip-ext");
    }

    #[test]
    fn test_ns_exec() {
        let cmd = ns_exec(Some("qrouter-r1"), &build_link_set_up_cmd("qr-1"));
        assert!(cmd.starts_with("/sbin/ip netns exec \"qrouter-r1\" /sbin/ip link set"));
        assert_eq!(ns_exec(None, "true"), "true");
    }

    #[test]
    fn test_build_netns_cmds() {
        assert!(build_netns_add_cmd("qrouter-r1").contains("ip netns add \"qrouter-r1\""));
        assert!(build_netns_delete_cmd("qrouter-r1").contains("ip netns delete"));
        assert!(build_netns_list_cmd().contains("ip netns list"));
    }

    #[test]
    fn test_build_addr_cmds() {
        let cmd = build_addr_add_cmd("qg-1", "172.24.4.2/24");
        assert!(cmd.contains("ip -4 addr add \"172.24.4.2/24\" dev \"qg-1\""));
        let cmd = build_addr_del_cmd("qr-1", "2001:db8::1/64");
        assert!(cmd.contains("ip -6 addr del"));
    }

    #[test]
    fn test_build_route_cmds() {
        let route = Route::new("192.168.0.0/24", "10.0.0.254");
        assert!(build_route_replace_cmd(&route)
            .contains("route replace \"192.168.0.0/24\" via \"10.0.0.254\""));
        assert!(build_route_del_cmd(&route).contains("route del"));
    }

    #[test]
    fn test_build_ovs_cmds() {
        let cmd = build_ovs_add_port_cmd("br-int", "qr-1", "port-1", "fa:16:3e:00:00:01");
        assert!(cmd.contains("--may-exist add-port \"br-int\" \"qr-1\""));
        assert!(cmd.contains("external-ids:iface-id=\"port-1\""));
        assert!(build_ovs_del_port_cmd("br-ex", "qg-1").contains("--if-exists del-port"));
    }

    #[test]
    fn test_build_dnat_rule() {
        let rule = PortForwardRule::new(Protocol::Tcp, 80, "10.0.0.5", 8080)
            .with_outside_addr("172.24.4.2");
        assert_eq!(
            build_dnat_rule(&rule).unwrap(),
            "-p tcp -d 172.24.4.2 --dport 80 -j DNAT --to 10.0.0.5:8080"
        );
    }

    #[test]
    fn test_build_dnat_rule_requires_outside_addr() {
        let rule = PortForwardRule::new(Protocol::Udp, 53, "10.0.0.5", 53);
        assert!(build_dnat_rule(&rule).is_err());
    }

    #[test]
    fn test_floating_forward_rules() {
        let rules = floating_forward_rules("172.24.4.9", "10.0.0.5");
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0], ("PREROUTING", "-d 172.24.4.9/32 -j DNAT --to 10.0.0.5".to_string()));
        assert_eq!(rules[2].0, "float-snat");
    }

    #[test]
    fn test_external_gateway_nat_rules() {
        let rules = external_gateway_nat_rules("172.24.4.2", "qg-1");
        assert_eq!(rules[1], ("snat", "-o qg-1 -j SNAT --to-source 172.24.4.2".to_string()));
    }

    #[test]
    fn test_parse_netns_list() {
        let output = "qrouter-r1 (id: 0)\nfip-ext (id: 1)\nqrouter-r2\n";
        assert_eq!(parse_netns_list(output), vec!["qrouter-r1", "fip-ext", "qrouter-r2"]);
    }

    #[test]
    fn test_parse_addr_show() {
        let output = "12: rfp-r1    inet 169.254.31.29/31 scope global rfp-r1\\       valid_lft forever\n\
                      12: rfp-r1    inet 172.24.4.9/32 scope global rfp-r1\\       valid_lft forever";
        assert_eq!(parse_addr_show(output), vec!["169.254.31.29/31", "172.24.4.9/32"]);
    }

    #[test]
    fn test_shellquote_safety() {
        let cmd = build_netns_add_cmd("qrouter-$(reboot)");
        assert!(cmd.contains("\\$(reboot)"));
    }
}
