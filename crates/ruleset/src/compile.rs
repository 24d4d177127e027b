//! Lowering the object graph to an nftables ruleset.
//!
//! [`compile`] is a pure function: no I/O, no clock, no kernel.  Given equal
//! graphs and capabilities it produces byte-identical text, which is what
//! makes generation fingerprints meaningful.
//!
//! The shape of the generated ruleset:
//!
//! - one `inet` table holding everything Zonewall owns;
//! - declared address sets (static sets populated inline, dynamic sets
//!   declared empty for the set manager to fill);
//! - per-zone, per-protocol counters, always emitted: named counter
//!   objects where the kernel has them, anonymous per-rule counters where
//!   it does not;
//! - base `input`/`forward`/`output` chains with stateful precedence and an
//!   interface-to-zone `vmap` classifier;
//! - per-zone chains that count, admit management traffic and dispatch to
//!   per-policy chains;
//! - per-policy chains running the ordered rules and ending in the policy's
//!   default action; undeclared zone pairs fall through to the base chain's
//!   drop policy;
//! - NAT `prerouting`/`postrouting` chains, with an auxiliary re-masquerade
//!   rule for hairpin DNAT.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::caps::{Capabilities, Feature};
use crate::emit::{braced, Emitter};
use crate::graph::{Fingerprint, Graph};
use crate::model::{
    AddrMatch, AddrSet, Endpoint, NatKind, Policy, Rule, SetSource, TimeWindow, Zone,
};

/// The nftables table owned by Zonewall.
pub const TABLE_NAME: &str = "zonewall";

/// Management service ports, in the order they are emitted.
const SSH_PORT: u16 = 22;
const WEB_UI_PORT: u16 = 443;
const API_PORT: u16 = 8443;

/// Weekday names as nftables spells them, Monday first to match the
/// document's weekday mask.
const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

//----------- CompiledRuleset --------------------------------------------------

/// The output of compilation: a complete kernel ruleset description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledRuleset {
    /// The nftables table the text defines.
    pub table: String,

    /// The complete `table inet ... { }` definition.
    pub text: String,

    /// The address sets the ruleset declares.
    pub sets: Vec<SetManifest>,

    /// SHA-256 over `text`.
    pub fingerprint: Fingerprint,
}

/// One declared address set, as the applier and set manager see it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetManifest {
    /// The set name, as it appears in the kernel table.
    pub name: String,

    /// The element kind.
    pub elem: crate::model::ElemKind,

    /// Where the elements come from.
    pub source: SetSource,
}

impl SetManifest {
    /// Whether the set's contents outlive the document that declared it.
    pub fn is_runtime(&self) -> bool {
        !matches!(self.source, SetSource::Static { .. })
    }
}

//----------- CompileError -----------------------------------------------------

/// A failure to lower the graph on this kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompileError {
    /// The document uses a construct the kernel cannot express.
    Capability(Feature),

    /// A rule references a set the graph does not declare.
    ///
    /// The validator rejects this before compilation; seeing it here means a
    /// caller skipped validation.
    UnknownSet {
        /// The referring rule.
        rule: String,
        /// The missing set.
        set: String,
    },

    /// A rule mixes IPv4 and IPv6 prefixes in one address clause.
    MixedFamilies {
        /// The offending rule.
        rule: String,
    },
}

impl std::error::Error for CompileError {}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capability(feature) => {
                write!(f, "this kernel does not support {feature}")
            }
            Self::UnknownSet { rule, set } => {
                write!(f, "rule '{rule}' references unknown set '@{set}'")
            }
            Self::MixedFamilies { rule } => {
                write!(f, "rule '{rule}' mixes IPv4 and IPv6 prefixes")
            }
        }
    }
}

//----------- compile ----------------------------------------------------------

/// Lower a validated graph into a concrete ruleset.
pub fn compile(graph: &Graph, caps: &Capabilities) -> Result<CompiledRuleset, CompileError> {
    let mut e = Emitter::new();
    e.open(format!("table inet {TABLE_NAME}"));

    emit_sets(&mut e, graph);
    if caps.named_counters {
        emit_counter_objects(&mut e, graph);
    }
    emit_base_chains(&mut e, graph);
    emit_zone_chains(&mut e, graph, caps)?;
    emit_policy_chains(&mut e, graph, caps)?;
    emit_nat_chains(&mut e, graph);

    e.close();

    let text = e.finish();
    let fingerprint = Fingerprint::of(text.as_bytes());
    let sets = graph
        .sets
        .values()
        .map(|set| SetManifest {
            name: set.name.clone(),
            elem: set.elem,
            source: set.source.clone(),
        })
        .collect();

    Ok(CompiledRuleset {
        table: TABLE_NAME.into(),
        text,
        sets,
        fingerprint,
    })
}

/// The minimal "admin only" ruleset used in safe mode.
///
/// Admits established return traffic, loopback, and SSH/API/ping from the
/// given management interfaces; everything else is dropped, and no traffic
/// is forwarded.
pub fn compile_safe_mode(admin_interfaces: &[String]) -> CompiledRuleset {
    let mut e = Emitter::new();
    e.open(format!("table inet {TABLE_NAME}"));

    e.open("chain input");
    e.line("type filter hook input priority filter; policy drop;");
    e.line("ct state established,related accept");
    e.line("ct state invalid drop");
    e.line("iif \"lo\" accept");
    if !admin_interfaces.is_empty() {
        let ifaces: Vec<String> = admin_interfaces.iter().map(|i| format!("\"{i}\"")).collect();
        let ifaces = braced(&ifaces);
        e.line(format!(
            "iifname {ifaces} tcp dport {} accept",
            braced(&[SSH_PORT.to_string(), API_PORT.to_string()])
        ));
        e.line(format!("iifname {ifaces} icmp type echo-request accept"));
        e.line(format!("iifname {ifaces} icmpv6 type echo-request accept"));
    }
    e.close();

    e.open("chain forward");
    e.line("type filter hook forward priority filter; policy drop;");
    e.line("ct state established,related accept");
    e.close();

    e.open("chain output");
    e.line("type filter hook output priority filter; policy accept;");
    e.close();

    e.close();

    let text = e.finish();
    let fingerprint = Fingerprint::of(text.as_bytes());
    CompiledRuleset {
        table: TABLE_NAME.into(),
        text,
        sets: Vec::new(),
        fingerprint,
    }
}

//--- Sets

fn emit_sets(e: &mut Emitter, graph: &Graph) {
    for set in graph.sets.values() {
        e.open(format!("set {}", set.name));
        e.line(format!("type {}", set.elem.nft_type()));
        if set.elem.is_interval() {
            e.line("flags interval");
        }
        if let SetSource::Static { elements } = &set.source {
            if !elements.is_empty() {
                e.line(format!("elements = {{ {} }}", elements.join(", ")));
            }
        }
        e.close();
    }
    if !graph.sets.is_empty() {
        e.blank();
    }
}

//--- Counters

/// The protocol buckets that get a counter per zone.
const COUNTED_PROTOCOLS: [&str; 4] = ["tcp", "udp", "icmp", "other"];

fn counter_name(zone: &str, proto: &str) -> String {
    format!("cnt_{zone}_{proto}")
}

/// Declare the named counter objects, one per zone and protocol bucket.
fn emit_counter_objects(e: &mut Emitter, graph: &Graph) {
    for zone in graph.zones.keys() {
        for proto in COUNTED_PROTOCOLS {
            e.line(format!("counter {} {{ }}", counter_name(zone, proto)));
        }
    }
    if !graph.zones.is_empty() {
        e.blank();
    }
}

/// The counting rules at the head of a zone's input and forward chains.
///
/// Counters are emitted regardless of kernel support: a kernel without
/// named counter objects gets anonymous per-rule counters instead, which
/// still show up in a ruleset listing.  Only the `firewall.counters`
/// read-back needs the named form.
fn emit_count_rules(e: &mut Emitter, zone: &str, caps: &Capabilities) {
    let reference = |proto: &str| {
        if caps.named_counters {
            format!("counter name \"{}\"", counter_name(zone, proto))
        } else {
            "counter".to_string()
        }
    };

    for proto in ["tcp", "udp", "icmp"] {
        e.line(format!("meta l4proto {proto} {}", reference(proto)));
    }
    e.line(format!(
        "meta l4proto != {{ tcp, udp, icmp }} {}",
        reference("other")
    ));
}

//--- Base chains

/// The `vmap` dispatch from member interfaces to a per-zone chain.
fn zone_vmap(graph: &Graph, selector: &str, prefix: &str) -> Option<String> {
    let mut entries = Vec::new();
    for zone in graph.zones.keys() {
        for iface in graph.zone_members(zone) {
            entries.push(format!("\"{}\" : jump {prefix}_{zone}", iface.name));
        }
    }
    if entries.is_empty() {
        return None;
    }
    // Sorted by interface name so output does not depend on zone order.
    entries.sort();
    Some(format!("{selector} vmap {{ {} }}", entries.join(", ")))
}

fn emit_base_chains(e: &mut Emitter, graph: &Graph) {
    e.open("chain input");
    e.line("type filter hook input priority filter; policy drop;");
    e.line("ct state established,related accept");
    e.line("ct state invalid drop");
    e.line("iif \"lo\" accept");
    if let Some(vmap) = zone_vmap(graph, "iifname", "in") {
        e.line(vmap);
    }
    e.close();

    e.open("chain forward");
    e.line("type filter hook forward priority filter; policy drop;");
    e.line("ct state established,related accept");
    e.line("ct state invalid drop");
    if let Some(vmap) = zone_vmap(graph, "iifname", "fwd") {
        e.line(vmap);
    }
    e.close();

    // Locally originated traffic is admitted unless a firewall-to-zone
    // policy says otherwise; a drop default here would sever the router's
    // own resolvers and fetchers.
    e.open("chain output");
    e.line("type filter hook output priority filter; policy accept;");
    if let Some(vmap) = zone_vmap(graph, "oifname", "out") {
        e.line(vmap);
    }
    e.close();
}

//--- Zone chains

fn endpoint_label(endpoint: &Endpoint) -> String {
    match endpoint {
        Endpoint::Firewall => "fw".into(),
        Endpoint::Zone(name) => name.clone(),
    }
}

fn policy_chain_name(policy: &Policy) -> String {
    format!(
        "pol_{}_{}",
        endpoint_label(&policy.from),
        endpoint_label(&policy.to)
    )
}

fn emit_zone_chains(
    e: &mut Emitter,
    graph: &Graph,
    caps: &Capabilities,
) -> Result<(), CompileError> {
    for (name, zone) in &graph.zones {
        // Input: traffic from the zone to the router itself.
        e.open(format!("chain in_{name}"));
        emit_count_rules(e, name, caps);
        emit_management_rules(e, zone);
        if let Some(policy) = graph
            .policies
            .get(&(Endpoint::Zone(name.clone()), Endpoint::Firewall))
        {
            e.line(format!("jump {}", policy_chain_name(policy)));
        }
        e.close();

        // Forward: traffic from the zone to other zones.
        e.open(format!("chain fwd_{name}"));
        emit_count_rules(e, name, caps);
        let mut entries = Vec::new();
        for (key, policy) in &graph.policies {
            let (from, to) = key;
            if *from != Endpoint::Zone(name.clone()) {
                continue;
            }
            let Endpoint::Zone(to_zone) = to else {
                continue;
            };
            for iface in graph.zone_members(to_zone) {
                entries.push(format!(
                    "\"{}\" : jump {}",
                    iface.name,
                    policy_chain_name(policy)
                ));
            }
        }
        if !entries.is_empty() {
            entries.sort();
            e.line(format!("oifname vmap {{ {} }}", entries.join(", ")));
        }
        e.close();

        // Output: traffic from the router into the zone.
        e.open(format!("chain out_{name}"));
        if let Some(policy) = graph
            .policies
            .get(&(Endpoint::Firewall, Endpoint::Zone(name.clone())))
        {
            e.line(format!("jump {}", policy_chain_name(policy)));
        }
        e.close();
    }
    Ok(())
}

fn emit_management_rules(e: &mut Emitter, zone: &Zone) {
    let mut ports = Vec::new();
    if zone.management.ssh {
        ports.push(SSH_PORT.to_string());
    }
    if zone.management.web_ui {
        ports.push(WEB_UI_PORT.to_string());
    }
    if zone.management.api {
        ports.push(API_PORT.to_string());
    }
    if !ports.is_empty() {
        e.line(format!("tcp dport {} accept", braced(&ports)));
    }
    if zone.management.ping {
        e.line("icmp type echo-request accept");
        e.line("icmpv6 type echo-request accept");
    }
}

//--- Policy chains

fn emit_policy_chains(
    e: &mut Emitter,
    graph: &Graph,
    caps: &Capabilities,
) -> Result<(), CompileError> {
    for policy in graph.policies.values() {
        e.open(format!("chain {}", policy_chain_name(policy)));
        for rule in &policy.rules {
            e.line(lower_rule(rule, graph, caps)?);
        }
        e.line(policy.default_action.to_string());
        e.close();
    }
    Ok(())
}

/// The address family of one clause, for selecting `ip` vs `ip6` matches.
#[derive(Copy, Clone, PartialEq, Eq)]
enum Family {
    V4,
    V6,
    Ether,
}

impl Family {
    fn selector(self) -> &'static str {
        match self {
            Self::V4 => "ip",
            Self::V6 => "ip6",
            Self::Ether => "ether",
        }
    }
}

fn clause_family(rule: &Rule, clause: &AddrMatch, graph: &Graph) -> Result<Family, CompileError> {
    match clause {
        AddrMatch::Any => Ok(Family::V4),
        AddrMatch::Cidrs(nets) => {
            let mut family = None;
            for net in nets {
                let this = match net {
                    IpNet::V4(_) => Family::V4,
                    IpNet::V6(_) => Family::V6,
                };
                if *family.get_or_insert(this) != this {
                    return Err(CompileError::MixedFamilies {
                        rule: rule.name.clone(),
                    });
                }
            }
            Ok(family.unwrap_or(Family::V4))
        }
        AddrMatch::Set(name) => {
            let set: &AddrSet = graph.sets.get(name).ok_or_else(|| CompileError::UnknownSet {
                rule: rule.name.clone(),
                set: name.clone(),
            })?;
            Ok(match set.elem {
                crate::model::ElemKind::Ipv4 | crate::model::ElemKind::Cidr => Family::V4,
                crate::model::ElemKind::Ipv6 => Family::V6,
                crate::model::ElemKind::Mac => Family::Ether,
            })
        }
    }
}

fn lower_addr(
    out: &mut String,
    rule: &Rule,
    clause: &AddrMatch,
    direction: &str,
    graph: &Graph,
) -> Result<(), CompileError> {
    let family = clause_family(rule, clause, graph)?;
    match clause {
        AddrMatch::Any => {}
        AddrMatch::Cidrs(nets) => {
            let rendered: Vec<String> = nets.iter().map(|net| net.to_string()).collect();
            out.push_str(&format!(
                "{} {direction}addr {} ",
                family.selector(),
                braced(&rendered)
            ));
        }
        AddrMatch::Set(name) => {
            out.push_str(&format!("{} {direction}addr @{name} ", family.selector()));
        }
    }
    Ok(())
}

fn lower_time(window: &TimeWindow) -> String {
    let fmt_minutes = |m: u16| format!("{:02}:{:02}", m / 60, m % 60);
    let mut out = format!(
        "meta hour \"{}\"-\"{}\" ",
        fmt_minutes(window.start),
        fmt_minutes(window.end)
    );
    if !window.all_days() {
        let days: Vec<String> = DAY_NAMES
            .iter()
            .enumerate()
            .filter(|(i, _)| window.days & (1 << i) != 0)
            .map(|(_, name)| format!("\"{name}\""))
            .collect();
        out.push_str(&format!("meta day {} ", braced(&days)));
    }
    out
}

/// Lower one rule to a single nftables statement.
fn lower_rule(rule: &Rule, graph: &Graph, caps: &Capabilities) -> Result<String, CompileError> {
    let mut out = String::new();

    lower_addr(&mut out, rule, &rule.source, "s", graph)?;
    lower_addr(&mut out, rule, &rule.destination, "d", graph)?;

    if !rule.ports.is_empty() {
        // The validator guarantees a TCP/UDP protocol here.
        let proto = rule.protocol.expect("port clauses imply a protocol");
        let ports: Vec<String> = rule.ports.iter().map(|range| range.to_string()).collect();
        out.push_str(&format!("{proto} dport {} ", braced(&ports)));
    } else if let Some(proto) = rule.protocol {
        out.push_str(&format!("meta l4proto {proto} "));
    }

    if let Some(window) = &rule.time {
        if !caps.time_windows {
            return Err(CompileError::Capability(Feature::TimeWindows));
        }
        out.push_str(&lower_time(window));
    }

    if let Some(limit) = &rule.limit {
        if !caps.rate_limit {
            return Err(CompileError::Capability(Feature::RateLimit));
        }
        out.push_str(&format!("limit rate {}/{} ", limit.rate, limit.per));
        if let Some(burst) = limit.burst {
            out.push_str(&format!("burst {burst} packets "));
        }
    }

    if let Some(prefix) = &rule.log {
        out.push_str(&format!("log prefix \"{prefix}: \" "));
    }

    out.push_str(&rule.action.to_string());
    Ok(out)
}

//--- NAT chains

fn emit_nat_chains(e: &mut Emitter, graph: &Graph) {
    if graph.nat.is_empty() {
        return;
    }

    e.open("chain prerouting");
    e.line("type nat hook prerouting priority dstnat; policy accept;");
    for nat in &graph.nat {
        if let NatKind::Dnat {
            in_interface,
            protocol,
            port,
            to,
            to_port,
            ..
        } = &nat.kind
        {
            let target = match to_port {
                Some(to_port) => format!("{to}:{to_port}"),
                None => to.to_string(),
            };
            e.line(format!(
                "iifname \"{in_interface}\" {protocol} dport {port} dnat to {target}"
            ));
        }
    }
    e.close();

    e.open("chain postrouting");
    e.line("type nat hook postrouting priority srcnat; policy accept;");
    for nat in &graph.nat {
        match &nat.kind {
            NatKind::Masquerade { out_interface } => {
                e.line(format!("oifname \"{out_interface}\" masquerade"));
            }
            NatKind::Snat {
                out_interface,
                source,
                to,
            } => {
                let mut line = format!("oifname \"{out_interface}\" ");
                if let Some(source) = source {
                    line.push_str(&format!("{} saddr {source} ", ip_family(source)));
                }
                line.push_str(&format!("snat to {to}"));
                e.line(line);
            }
            NatKind::Dnat {
                protocol,
                port,
                to,
                to_port,
                hairpin,
                ..
            } => {
                // Hairpin: internal clients reaching the forwarded service
                // via the external address need their source rewritten, or
                // the target would reply past the router.
                if *hairpin {
                    let dport = to_port.unwrap_or(port.start);
                    e.line(format!(
                        "{} daddr {to} {protocol} dport {dport} masquerade",
                        addr_family(to)
                    ));
                }
            }
        }
    }
    e.close();
}

fn ip_family(net: &IpNet) -> &'static str {
    match net {
        IpNet::V4(_) => "ip",
        IpNet::V6(_) => "ip6",
    }
}

fn addr_family(addr: &IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => "ip",
        IpAddr::V6(_) => "ip6",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Action, Addressing, ElemKind, Interface, InterfaceKind, Management, Nat, PortRange,
        Protocol, RateLimit, RateUnit,
    };

    fn home_router() -> Graph {
        let mut graph = Graph::default();
        graph.zones.insert(
            "wan".into(),
            Zone {
                name: "wan".into(),
                description: None,
                management: Management::default(),
            },
        );
        graph.zones.insert(
            "lan".into(),
            Zone {
                name: "lan".into(),
                description: Some("the home network".into()),
                management: Management {
                    ssh: true,
                    api: true,
                    ping: true,
                    ..Default::default()
                },
            },
        );
        graph.interfaces.insert(
            "eth0".into(),
            Interface {
                name: "eth0".into(),
                kind: InterfaceKind::Physical,
                zone: Some("wan".into()),
                addressing: Addressing::DhcpClient,
                mtu: None,
            },
        );
        graph.interfaces.insert(
            "eth1".into(),
            Interface {
                name: "eth1".into(),
                kind: InterfaceKind::Physical,
                zone: Some("lan".into()),
                addressing: Addressing::Static {
                    addrs: vec!["192.168.1.1/24".parse().unwrap()],
                },
                mtu: None,
            },
        );
        graph.policies.insert(
            (Endpoint::Zone("lan".into()), Endpoint::Zone("wan".into())),
            Policy {
                from: Endpoint::Zone("lan".into()),
                to: Endpoint::Zone("wan".into()),
                default_action: Action::Accept,
                rules: Vec::new(),
            },
        );
        graph.nat.push(Nat {
            name: "masq".into(),
            kind: NatKind::Masquerade {
                out_interface: "eth0".into(),
            },
        });
        graph
    }

    #[test]
    fn compilation_is_deterministic() {
        let graph = home_router();
        let a = compile(&graph, &Capabilities::FULL).unwrap();
        let b = compile(&graph, &Capabilities::FULL).unwrap();
        assert_eq!(a.text, b.text);
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn home_router_lowers_to_expected_shape() {
        let compiled = compile(&home_router(), &Capabilities::FULL).unwrap();
        let text = &compiled.text;

        assert!(text.starts_with("table inet zonewall {"));
        // Stateful precedence before any policy dispatch.
        let est = text.find("ct state established,related accept").unwrap();
        let vmap = text.find("iifname vmap").unwrap();
        assert!(est < vmap);
        // Zone membership classifier covers both interfaces.
        assert!(text.contains("\"eth0\" : jump in_wan"));
        assert!(text.contains("\"eth1\" : jump in_lan"));
        // The LAN->WAN policy chain ends in its default action.
        assert!(text.contains("chain pol_lan_wan"));
        // Masquerade out of the WAN interface.
        assert!(text.contains("oifname \"eth0\" masquerade"));
        // Management services on LAN only.
        assert!(text.contains("tcp dport { 22, 8443 } accept"));
        // Per-zone counters exist for both zones.
        assert!(text.contains("counter cnt_lan_tcp { }"));
        assert!(text.contains("counter cnt_wan_udp { }"));
    }

    #[test]
    fn undeclared_pairs_fall_through_to_drop() {
        let compiled = compile(&home_router(), &Capabilities::FULL).unwrap();
        // No WAN->LAN policy, so fwd_wan has no dispatch entries and the
        // forward hook's drop policy applies.
        assert!(compiled.text.contains("chain fwd_wan"));
        assert!(!compiled.text.contains("pol_wan_lan"));
        assert!(compiled
            .text
            .contains("type filter hook forward priority filter; policy drop;"));
    }

    #[test]
    fn set_reference_lowers_to_kernel_set() {
        let mut graph = home_router();
        graph.sets.insert(
            "blocked".into(),
            AddrSet {
                name: "blocked".into(),
                elem: ElemKind::Ipv4,
                source: SetSource::Runtime { persist: true },
            },
        );
        let key = (Endpoint::Zone("lan".into()), Endpoint::Zone("wan".into()));
        graph.policies.get_mut(&key).unwrap().rules.push(Rule {
            name: "no-blocked".into(),
            action: Action::Drop,
            protocol: None,
            source: AddrMatch::Any,
            destination: AddrMatch::Set("blocked".into()),
            ports: Vec::new(),
            time: None,
            limit: None,
            log: None,
        });

        let compiled = compile(&graph, &Capabilities::FULL).unwrap();
        // Declared but not populated: the set manager owns runtime contents.
        assert!(compiled.text.contains("set blocked"));
        assert!(!compiled.text.contains("elements"));
        assert!(compiled.text.contains("ip daddr @blocked drop"));
        assert!(compiled.sets.iter().any(|set| set.name == "blocked"));
    }

    #[test]
    fn static_sets_are_populated_inline() {
        let mut graph = Graph::default();
        graph.sets.insert(
            "admins".into(),
            AddrSet {
                name: "admins".into(),
                elem: ElemKind::Cidr,
                source: SetSource::Static {
                    elements: vec!["10.0.0.0/24".into(), "10.1.0.0/24".into()],
                },
            },
        );
        let compiled = compile(&graph, &Capabilities::FULL).unwrap();
        assert!(compiled.text.contains("flags interval"));
        assert!(compiled
            .text
            .contains("elements = { 10.0.0.0/24, 10.1.0.0/24 }"));
    }

    #[test]
    fn missing_kernel_features_refuse_compilation() {
        let mut graph = home_router();
        let key = (Endpoint::Zone("lan".into()), Endpoint::Zone("wan".into()));
        graph.policies.get_mut(&key).unwrap().rules.push(Rule {
            name: "evenings".into(),
            action: Action::Accept,
            protocol: Some(Protocol::Tcp),
            source: AddrMatch::Any,
            destination: AddrMatch::Any,
            ports: vec![PortRange::single(443)],
            time: Some(TimeWindow {
                start: 18 * 60,
                end: 23 * 60,
                days: TimeWindow::EVERY_DAY,
            }),
            limit: None,
            log: None,
        });

        let caps = Capabilities {
            time_windows: false,
            ..Capabilities::FULL
        };
        assert_eq!(
            compile(&graph, &caps),
            Err(CompileError::Capability(Feature::TimeWindows))
        );
        // With the feature present the window lowers to an hour match.
        let compiled = compile(&graph, &Capabilities::FULL).unwrap();
        assert!(compiled.text.contains("meta hour \"18:00\"-\"23:00\""));
    }

    #[test]
    fn counters_fall_back_to_anonymous_without_named_support() {
        let caps = Capabilities {
            named_counters: false,
            ..Capabilities::FULL
        };
        let compiled = compile(&home_router(), &caps).unwrap();

        // No counter objects and no named references...
        assert!(!compiled.text.contains("counter cnt_"));
        assert!(!compiled.text.contains("counter name"));
        // ...but the per-zone, per-protocol counting rules are still there.
        assert!(compiled.text.contains("meta l4proto tcp counter"));
        assert!(compiled.text.contains("meta l4proto != { tcp, udp, icmp } counter"));
    }

    #[test]
    fn rate_limits_lower_with_burst() {
        let mut graph = home_router();
        let key = (Endpoint::Zone("lan".into()), Endpoint::Zone("wan".into()));
        graph.policies.get_mut(&key).unwrap().rules.push(Rule {
            name: "ssh-limit".into(),
            action: Action::Accept,
            protocol: Some(Protocol::Tcp),
            source: AddrMatch::Any,
            destination: AddrMatch::Any,
            ports: vec![PortRange::single(22)],
            time: None,
            limit: Some(RateLimit {
                rate: 10,
                per: RateUnit::Minute,
                burst: Some(5),
            }),
            log: Some("ssh".into()),
        });

        let compiled = compile(&graph, &Capabilities::FULL).unwrap();
        assert!(compiled
            .text
            .contains("tcp dport 22 limit rate 10/minute burst 5 packets log prefix \"ssh: \" accept"));
    }

    #[test]
    fn hairpin_dnat_emits_the_auxiliary_masquerade() {
        let mut graph = home_router();
        graph.nat.push(Nat {
            name: "web".into(),
            kind: NatKind::Dnat {
                in_interface: "eth0".into(),
                protocol: Protocol::Tcp,
                port: PortRange::single(80),
                to: "192.168.1.10".parse().unwrap(),
                to_port: None,
                hairpin: true,
            },
        });

        let compiled = compile(&graph, &Capabilities::FULL).unwrap();
        assert!(compiled
            .text
            .contains("iifname \"eth0\" tcp dport 80 dnat to 192.168.1.10"));
        assert!(compiled
            .text
            .contains("ip daddr 192.168.1.10 tcp dport 80 masquerade"));
    }

    #[test]
    fn safe_mode_admits_admin_traffic_only() {
        let compiled = compile_safe_mode(&["eth1".into()]);
        assert!(compiled.text.contains("policy drop;"));
        assert!(compiled
            .text
            .contains("iifname \"eth1\" tcp dport { 22, 8443 } accept"));
        assert!(!compiled.text.contains("vmap"));
    }

    #[test]
    fn unknown_set_reference_is_refused() {
        let mut graph = home_router();
        let key = (Endpoint::Zone("lan".into()), Endpoint::Zone("wan".into()));
        graph.policies.get_mut(&key).unwrap().rules.push(Rule {
            name: "bad".into(),
            action: Action::Drop,
            protocol: None,
            source: AddrMatch::Set("nonexistent".into()),
            destination: AddrMatch::Any,
            ports: Vec::new(),
            time: None,
            limit: None,
            log: None,
        });

        assert_eq!(
            compile(&graph, &Capabilities::FULL),
            Err(CompileError::UnknownSet {
                rule: "bad".into(),
                set: "nonexistent".into()
            })
        );
    }
}
