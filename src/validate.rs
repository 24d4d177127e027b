//! Validating a parsed document and building the object graph.
//!
//! Validation runs a fixed sequence of passes:
//!
//! 1. **Uniqueness**: every named entity is unique within its category.
//! 2. **Referential**: every cross-reference resolves: zones named by
//!    interfaces, parents of vlans and members of bonds, sets named by
//!    rules, policy endpoints, NAT and route-group interfaces.
//! 3. **Structural**: addresses, ports, time windows and rate limits
//!    parse; port clauses only appear with protocols that carry ports.
//! 4. **Semantic**: the management surface stays reachable; losing the
//!    API plane entirely is flagged (the per-client lockout check happens
//!    at apply time, where the requesting path is known).
//! 5. **Policy analysis**: rules shadowed by earlier rules produce
//!    warnings; under strict validation the warnings become errors.
//!
//! Failures in passes 1–3 are fatal to the request.  The output of a
//! successful run is the canonical [`Graph`], so callers can never obtain a
//! graph that did not pass validation.

use std::collections::BTreeSet;
use std::fmt;

use ipnet::IpNet;
use tracing::debug;

use zonewall_api::ApiError;
use zonewall_ruleset::model::{
    Action, AddrMatch, AddrSet, Addressing, BondMode, ElectionPolicy, ElemKind, Endpoint,
    Interface, InterfaceKind, Management, Nat, NatKind, Policy, PortRange, Protocol, RateLimit,
    RateUnit, Route, RouteGroup, Rule, SetSource, TimeWindow, Uplink, Zone,
};
use zonewall_ruleset::Graph;

use crate::doc::v2::{
    AddrSpec, IpsetSpec, NatSpec, PolicySpec, PortSpec, RouteGroupSpec, RouteSpec, RuleSpec,
    TimeSpec, ZoneSpec,
};

//----------- Validated --------------------------------------------------------

/// The outcome of successful validation.
#[derive(Clone, Debug)]
pub struct Validated {
    /// The canonical object graph.
    pub graph: Graph,

    /// Non-fatal findings.
    pub warnings: Vec<Warning>,
}

/// A non-fatal validation finding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Warning {
    /// A rule can never match because an earlier rule covers it.
    Shadowed {
        /// The policy, as `from->to`.
        policy: String,
        /// The shadowed rule.
        rule: String,
        /// The earlier rule covering it.
        by: String,
    },

    /// No zone exposes the API service; the API plane will be unreachable
    /// from everywhere once this document is applied.
    ApiUnreachable,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shadowed { policy, rule, by } => {
                write!(
                    f,
                    "policy[{policy}]: rule '{rule}' is shadowed by earlier rule '{by}' \
                     and can never match"
                )
            }
            Self::ApiUnreachable => {
                f.write_str("no zone exposes the API service; management will be unreachable")
            }
        }
    }
}

fn err(path: impl Into<String>, reason: impl Into<String>) -> ApiError {
    ApiError::Validate {
        path: path.into(),
        reason: reason.into(),
    }
}

//----------- validate ---------------------------------------------------------

/// Validate a parsed document and build its object graph.
///
/// With `strict`, shadowing warnings are promoted to errors.
pub fn validate(spec: &crate::doc::v2::Spec, strict: bool) -> Result<Validated, ApiError> {
    // Disabled blocks are treated as absent throughout.
    let zones: Vec<&ZoneSpec> = spec.zone.iter().filter(|z| z.enabled).collect();
    let interfaces: Vec<&crate::doc::v2::InterfaceSpec> =
        spec.interface.iter().filter(|i| i.enabled).collect();
    let policies: Vec<&PolicySpec> = spec.policy.iter().filter(|p| p.enabled).collect();
    let nat: Vec<&NatSpec> = spec.nat.iter().filter(|n| n.enabled).collect();
    let ipsets: Vec<&IpsetSpec> = spec.ipset.iter().filter(|s| s.enabled).collect();
    let routes: Vec<&RouteSpec> = spec.route.iter().filter(|r| r.enabled).collect();
    let route_groups: Vec<&RouteGroupSpec> =
        spec.route_group.iter().filter(|g| g.enabled).collect();

    // Pass 1: uniqueness.
    check_unique("zone", zones.iter().map(|z| z.name.as_str()))?;
    check_unique("interface", interfaces.iter().map(|i| i.name.as_str()))?;
    check_unique("nat", nat.iter().map(|n| n.name.as_str()))?;
    check_unique("ipset", ipsets.iter().map(|s| s.name.as_str()))?;
    check_unique("route_group", route_groups.iter().map(|g| g.name.as_str()))?;
    {
        let mut seen = BTreeSet::new();
        for policy in &policies {
            if !seen.insert((policy.from.as_str(), policy.to.as_str())) {
                return Err(err(
                    format!("policy[{}->{}]", policy.from, policy.to),
                    "declared more than once",
                ));
            }
        }
    }
    for policy in &policies {
        let path = format!("policy[{}->{}]", policy.from, policy.to);
        check_unique(
            &format!("{path}.rule"),
            policy.rule.iter().filter(|r| r.enabled).map(|r| r.name.as_str()),
        )?;
    }

    // Pass 2: referential.
    let zone_names: BTreeSet<&str> = zones.iter().map(|z| z.name.as_str()).collect();
    let iface_names: BTreeSet<&str> = interfaces.iter().map(|i| i.name.as_str()).collect();
    let set_names: BTreeSet<&str> = ipsets.iter().map(|s| s.name.as_str()).collect();

    for iface in &interfaces {
        let path = format!("interface[{}]", iface.name);
        if let Some(zone) = &iface.zone {
            if !zone_names.contains(zone.as_str()) {
                return Err(err(&path, format!("unknown zone '{zone}'")));
            }
        }
        if let Some(vlan) = &iface.vlan {
            if !iface_names.contains(vlan.parent.as_str()) {
                return Err(err(&path, format!("unknown vlan parent '{}'", vlan.parent)));
            }
        }
        if let Some(bond) = &iface.bond {
            for member in &bond.members {
                if !iface_names.contains(member.as_str()) {
                    return Err(err(&path, format!("unknown bond member '{member}'")));
                }
            }
        }
    }

    for policy in &policies {
        let path = format!("policy[{}->{}]", policy.from, policy.to);
        for endpoint in [&policy.from, &policy.to] {
            if endpoint != "firewall" && !zone_names.contains(endpoint.as_str()) {
                return Err(err(&path, format!("unknown zone '{endpoint}'")));
            }
        }
        for rule in policy.rule.iter().filter(|r| r.enabled) {
            for clause in [&rule.source, &rule.destination].into_iter().flatten() {
                for entry in clause.entries() {
                    if let Some(set) = entry.strip_prefix('@') {
                        if !set_names.contains(set) {
                            return Err(err(
                                format!("{path}.rule[{}]", rule.name),
                                format!("unknown address set '@{set}'"),
                            ));
                        }
                    }
                }
            }
        }
    }

    for nat_spec in &nat {
        if !iface_names.contains(nat_spec.interface.as_str()) {
            return Err(err(
                format!("nat[{}]", nat_spec.name),
                format!("unknown interface '{}'", nat_spec.interface),
            ));
        }
    }

    for route in &routes {
        if let Some(device) = &route.device {
            if !iface_names.contains(device.as_str()) {
                return Err(err(
                    format!("route[{}]", route.dest),
                    format!("unknown interface '{device}'"),
                ));
            }
        }
    }

    for group in &route_groups {
        let path = format!("route_group[{}]", group.name);
        for uplink in &group.uplink {
            if !iface_names.contains(uplink.interface.as_str()) {
                return Err(err(&path, format!("unknown interface '{}'", uplink.interface)));
            }
        }
    }

    // Pass 3: structural, building the graph entities as we go.
    let mut graph = Graph::default();

    for zone in &zones {
        graph.zones.insert(
            zone.name.clone(),
            Zone {
                name: zone.name.clone(),
                description: zone.description.clone(),
                management: Management {
                    ssh: zone.management.ssh,
                    web_ui: zone.management.web_ui,
                    api: zone.management.api,
                    ping: zone.management.ping,
                },
            },
        );
    }

    for iface in &interfaces {
        graph
            .interfaces
            .insert(iface.name.clone(), build_interface(iface)?);
    }

    for policy in &policies {
        let built = build_policy(policy)?;
        graph
            .policies
            .insert((built.from.clone(), built.to.clone()), built);
    }

    for nat_spec in &nat {
        graph.nat.push(build_nat(nat_spec)?);
    }

    for ipset in &ipsets {
        graph.sets.insert(ipset.name.clone(), build_ipset(ipset)?);
    }

    for route in &routes {
        graph.routes.push(build_route(route)?);
    }

    for group in &route_groups {
        graph
            .route_groups
            .insert(group.name.clone(), build_route_group(group)?);
    }

    for (name, table) in spec.service_blocks() {
        if table
            .get("enabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
        {
            // The default toml map is key-ordered, so this rendering is
            // canonical and diffable.
            let canonical = toml::to_string(table).map_err(|e| {
                err(format!("[{name}]"), format!("cannot canonicalize: {e}"))
            })?;
            graph.services.insert(name.to_string(), canonical);
        }
    }

    // Pass 4: semantic.
    let mut warnings = Vec::new();
    if !graph.zones.values().any(|zone| zone.management.api) {
        warnings.push(Warning::ApiUnreachable);
    }

    // Pass 5: policy analysis.
    for policy in graph.policies.values() {
        let key = format!("{}->{}", policy.from, policy.to);
        for (i, rule) in policy.rules.iter().enumerate() {
            if let Some(earlier) = policy.rules[..i].iter().find(|e| shadows(e, rule)) {
                warnings.push(Warning::Shadowed {
                    policy: key.clone(),
                    rule: rule.name.clone(),
                    by: earlier.name.clone(),
                });
            }
        }
    }

    if strict {
        if let Some(warning) = warnings
            .iter()
            .find(|w| matches!(w, Warning::Shadowed { .. }))
        {
            return Err(err("policy", warning.to_string()));
        }
    }

    debug!(
        zones = graph.zones.len(),
        interfaces = graph.interfaces.len(),
        policies = graph.policies.len(),
        warnings = warnings.len(),
        "Validated configuration document"
    );

    Ok(Validated { graph, warnings })
}

fn check_unique<'a>(
    category: &str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), ApiError> {
    let mut seen = BTreeSet::new();
    for name in names {
        if name.is_empty() {
            return Err(err(format!("{category}[]"), "missing a name"));
        }
        if !seen.insert(name) {
            return Err(err(
                format!("{category}[{name}]"),
                "declared more than once",
            ));
        }
    }
    Ok(())
}

//--- Structural builders

fn build_interface(spec: &crate::doc::v2::InterfaceSpec) -> Result<Interface, ApiError> {
    let path = format!("interface[{}]", spec.name);

    let kinds_declared =
        usize::from(spec.vlan.is_some()) + usize::from(spec.bond.is_some()) + usize::from(spec.wireguard.is_some());
    if kinds_declared > 1 {
        return Err(err(&path, "at most one of vlan, bond and wireguard"));
    }

    let kind = if let Some(vlan) = &spec.vlan {
        if vlan.id == 0 || vlan.id > 4094 {
            return Err(err(&path, format!("vlan id {} out of range 1-4094", vlan.id)));
        }
        InterfaceKind::Vlan {
            parent: vlan.parent.clone(),
            id: vlan.id,
        }
    } else if let Some(bond) = &spec.bond {
        if bond.members.is_empty() {
            return Err(err(&path, "a bond needs at least one member"));
        }
        InterfaceKind::Bond {
            members: bond.members.clone(),
            mode: match bond.mode {
                crate::doc::v2::BondModeSpec::ActiveBackup => BondMode::ActiveBackup,
                crate::doc::v2::BondModeSpec::RoundRobin => BondMode::RoundRobin,
                crate::doc::v2::BondModeSpec::Lacp => BondMode::Lacp,
            },
        }
    } else if let Some(wireguard) = &spec.wireguard {
        InterfaceKind::Wireguard {
            listen_port: wireguard.listen_port,
        }
    } else {
        InterfaceKind::Physical
    };

    let addressing = if spec.dhcp {
        if !spec.ipv4.is_empty() || !spec.ipv6.is_empty() {
            return Err(err(&path, "dhcp and static addresses are mutually exclusive"));
        }
        Addressing::DhcpClient
    } else if spec.ipv4.is_empty() && spec.ipv6.is_empty() {
        Addressing::None
    } else {
        let mut addrs = Vec::new();
        for (family, entries) in [("ipv4", &spec.ipv4), ("ipv6", &spec.ipv6)] {
            for entry in entries {
                let net = parse_net(&path, entry)?;
                let matches_family = match net {
                    IpNet::V4(_) => family == "ipv4",
                    IpNet::V6(_) => family == "ipv6",
                };
                if !matches_family {
                    return Err(err(&path, format!("'{entry}' is not an {family} prefix")));
                }
                addrs.push(net);
            }
        }
        Addressing::Static { addrs }
    };

    Ok(Interface {
        name: spec.name.clone(),
        kind,
        zone: spec.zone.clone(),
        addressing,
        mtu: spec.mtu,
    })
}

fn build_policy(spec: &PolicySpec) -> Result<Policy, ApiError> {
    let path = format!("policy[{}->{}]", spec.from, spec.to);
    let from: Endpoint = spec.from.parse().expect("endpoint parsing is total");
    let to: Endpoint = spec.to.parse().expect("endpoint parsing is total");

    let mut rules = Vec::new();
    for rule in spec.rule.iter().filter(|r| r.enabled) {
        rules.push(build_rule(&path, rule)?);
    }

    Ok(Policy {
        from,
        to,
        default_action: parse_action(&path, &spec.default)?,
        rules,
    })
}

fn build_rule(policy_path: &str, spec: &RuleSpec) -> Result<Rule, ApiError> {
    let path = format!("{policy_path}.rule[{}]", spec.name);

    let protocol = spec
        .protocol
        .as_deref()
        .map(|p| parse_protocol(&path, p))
        .transpose()?;

    let ports = spec
        .ports
        .iter()
        .map(|port| parse_port(&path, port))
        .collect::<Result<Vec<_>, _>>()?;

    if !ports.is_empty() {
        match protocol {
            Some(proto) if proto.has_ports() => {}
            Some(proto) => {
                return Err(err(&path, format!("protocol '{proto}' does not carry ports")));
            }
            None => {
                return Err(err(&path, "port clauses require a protocol"));
            }
        }
    }

    Ok(Rule {
        name: spec.name.clone(),
        action: parse_action(&path, &spec.action)?,
        protocol,
        source: parse_addr_match(&path, spec.source.as_ref())?,
        destination: parse_addr_match(&path, spec.destination.as_ref())?,
        ports,
        time: spec.time.as_ref().map(|t| parse_time(&path, t)).transpose()?,
        limit: spec
            .limit
            .as_ref()
            .map(|l| parse_limit(&path, &l.rate, l.burst))
            .transpose()?,
        log: spec.log.clone(),
    })
}

fn build_nat(spec: &NatSpec) -> Result<Nat, ApiError> {
    let path = format!("nat[{}]", spec.name);
    let kind = match spec.kind.as_str() {
        "masquerade" => NatKind::Masquerade {
            out_interface: spec.interface.clone(),
        },
        "snat" => {
            let to = spec
                .to
                .as_deref()
                .ok_or_else(|| err(&path, "snat requires 'to'"))?;
            NatKind::Snat {
                out_interface: spec.interface.clone(),
                source: spec
                    .source
                    .as_deref()
                    .map(|s| parse_net(&path, s))
                    .transpose()?,
                to: parse_addr(&path, to)?,
            }
        }
        "dnat" => {
            let protocol = spec
                .protocol
                .as_deref()
                .ok_or_else(|| err(&path, "dnat requires 'protocol'"))?;
            let protocol = parse_protocol(&path, protocol)?;
            if !protocol.has_ports() {
                return Err(err(&path, format!("protocol '{protocol}' does not carry ports")));
            }
            let port = spec
                .port
                .as_ref()
                .ok_or_else(|| err(&path, "dnat requires 'port'"))?;
            let to = spec
                .to
                .as_deref()
                .ok_or_else(|| err(&path, "dnat requires 'to'"))?;
            NatKind::Dnat {
                in_interface: spec.interface.clone(),
                protocol,
                port: parse_port(&path, port)?,
                to: parse_addr(&path, to)?,
                to_port: spec.to_port,
                hairpin: spec.hairpin,
            }
        }
        other => return Err(err(&path, format!("unknown nat kind '{other}'"))),
    };

    Ok(Nat {
        name: spec.name.clone(),
        kind,
    })
}

fn build_ipset(spec: &IpsetSpec) -> Result<AddrSet, ApiError> {
    let path = format!("ipset[{}]", spec.name);
    let elem = match spec.elem.as_str() {
        "" | "ipv4" => ElemKind::Ipv4,
        "ipv6" => ElemKind::Ipv6,
        "cidr" => ElemKind::Cidr,
        "mac" => ElemKind::Mac,
        other => return Err(err(&path, format!("unknown element type '{other}'"))),
    };

    let source = match spec.source_kind() {
        "static" => {
            for element in &spec.elements {
                check_element(&path, elem, element)?;
            }
            SetSource::Static {
                elements: spec.elements.clone(),
            }
        }
        "url" => {
            let url = spec
                .url
                .as_deref()
                .ok_or_else(|| err(&path, "url-sourced sets require 'url'"))?;
            url::Url::parse(url).map_err(|e| err(&path, format!("invalid url: {e}")))?;
            SetSource::Url {
                url: url.to_string(),
                refresh_secs: spec.refresh_secs,
                max_elements: spec.max_elements,
            }
        }
        "dns" => {
            if spec.domains.is_empty() {
                return Err(err(&path, "dns-sourced sets require 'domains'"));
            }
            SetSource::Dns {
                domains: spec.domains.clone(),
                min_refresh_secs: spec.min_refresh_secs,
            }
        }
        "runtime" => SetSource::Runtime {
            persist: spec.persist,
        },
        other => return Err(err(&path, format!("unknown source '{other}'"))),
    };

    Ok(AddrSet {
        name: spec.name.clone(),
        elem,
        source,
    })
}

fn build_route(spec: &RouteSpec) -> Result<Route, ApiError> {
    let path = format!("route[{}]", spec.dest);
    let dest = if spec.dest == "default" {
        "0.0.0.0/0".parse().expect("a valid literal")
    } else {
        parse_net(&path, &spec.dest)?
    };
    if spec.via.is_none() && spec.device.is_none() {
        return Err(err(&path, "a route needs 'via' or 'device'"));
    }
    Ok(Route {
        dest,
        via: spec
            .via
            .as_deref()
            .map(|v| parse_addr(&path, v))
            .transpose()?,
        device: spec.device.clone(),
        metric: spec.metric,
    })
}

fn build_route_group(spec: &RouteGroupSpec) -> Result<RouteGroup, ApiError> {
    let path = format!("route_group[{}]", spec.name);
    if spec.uplink.is_empty() {
        return Err(err(&path, "a route group needs at least one uplink"));
    }
    let election = match spec.policy.as_str() {
        "failover" => ElectionPolicy::Failover,
        "balance" => ElectionPolicy::Balance,
        other => return Err(err(&path, format!("unknown election policy '{other}'"))),
    };
    let mut uplinks = Vec::new();
    for uplink in &spec.uplink {
        uplinks.push(Uplink {
            interface: uplink.interface.clone(),
            gateway: parse_addr(&path, &uplink.gateway)?,
            probe_target: parse_addr(&path, &uplink.probe)?,
        });
    }
    Ok(RouteGroup {
        name: spec.name.clone(),
        uplinks,
        election,
    })
}

//--- Field parsers

fn parse_action(path: &str, text: &str) -> Result<Action, ApiError> {
    match text {
        "accept" => Ok(Action::Accept),
        "reject" => Ok(Action::Reject),
        "drop" => Ok(Action::Drop),
        other => Err(err(path, format!("unknown action '{other}'"))),
    }
}

fn parse_protocol(path: &str, text: &str) -> Result<Protocol, ApiError> {
    match text {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        "icmp" => Ok(Protocol::Icmp),
        other => match other.parse::<u8>() {
            Ok(number) => Ok(Protocol::Number(number)),
            Err(_) => Err(err(path, format!("unknown protocol '{other}'"))),
        },
    }
}

fn parse_port(path: &str, spec: &PortSpec) -> Result<PortRange, ApiError> {
    match spec {
        PortSpec::Port(port) => Ok(PortRange::single(*port)),
        PortSpec::Range(text) => {
            let Some((start, end)) = text.split_once('-') else {
                return match text.trim().parse::<u16>() {
                    Ok(port) => Ok(PortRange::single(port)),
                    Err(_) => Err(err(path, format!("invalid port '{text}'"))),
                };
            };
            let start: u16 = start
                .trim()
                .parse()
                .map_err(|_| err(path, format!("invalid port range '{text}'")))?;
            let end: u16 = end
                .trim()
                .parse()
                .map_err(|_| err(path, format!("invalid port range '{text}'")))?;
            if start > end {
                return Err(err(path, format!("port range '{text}' is inverted")));
            }
            Ok(PortRange { start, end })
        }
    }
}

fn parse_addr_match(path: &str, spec: Option<&AddrSpec>) -> Result<AddrMatch, ApiError> {
    let Some(spec) = spec else {
        return Ok(AddrMatch::Any);
    };
    let entries = spec.entries();
    if entries.is_empty() {
        return Ok(AddrMatch::Any);
    }

    if let [entry] = entries.as_slice() {
        if let Some(set) = entry.strip_prefix('@') {
            return Ok(AddrMatch::Set(set.to_string()));
        }
        if *entry == "any" {
            return Ok(AddrMatch::Any);
        }
    }

    let mut nets = Vec::new();
    for entry in entries {
        if entry.starts_with('@') {
            return Err(err(path, "a set reference cannot be mixed with addresses"));
        }
        nets.push(parse_net(path, entry)?);
    }
    Ok(AddrMatch::Cidrs(nets))
}

fn parse_net(path: &str, text: &str) -> Result<IpNet, ApiError> {
    if let Ok(net) = text.parse::<IpNet>() {
        return Ok(net);
    }
    // A bare address is the /32 or /128 containing it.
    match text.parse::<std::net::IpAddr>() {
        Ok(addr) => Ok(IpNet::from(addr)),
        Err(_) => Err(err(path, format!("invalid address or prefix '{text}'"))),
    }
}

fn parse_addr(path: &str, text: &str) -> Result<std::net::IpAddr, ApiError> {
    text.parse()
        .map_err(|_| err(path, format!("invalid address '{text}'")))
}

fn check_element(path: &str, elem: ElemKind, text: &str) -> Result<(), ApiError> {
    let ok = match elem {
        ElemKind::Ipv4 => text.parse::<std::net::Ipv4Addr>().is_ok(),
        ElemKind::Ipv6 => text.parse::<std::net::Ipv6Addr>().is_ok(),
        ElemKind::Cidr => text.parse::<ipnet::Ipv4Net>().is_ok(),
        ElemKind::Mac => {
            let bytes: Vec<&str> = text.split(':').collect();
            bytes.len() == 6 && bytes.iter().all(|b| u8::from_str_radix(b, 16).is_ok())
        }
    };
    if ok {
        Ok(())
    } else {
        Err(err(path, format!("'{text}' is not a valid element for this set type")))
    }
}

fn parse_time(path: &str, spec: &TimeSpec) -> Result<TimeWindow, ApiError> {
    let minutes = |text: &str| -> Result<u16, ApiError> {
        let Some((hours, minutes)) = text.split_once(':') else {
            return Err(err(path, format!("invalid time '{text}', expected HH:MM")));
        };
        let hours: u16 = hours
            .parse()
            .map_err(|_| err(path, format!("invalid time '{text}'")))?;
        let minutes: u16 = minutes
            .parse()
            .map_err(|_| err(path, format!("invalid time '{text}'")))?;
        if hours > 23 || minutes > 59 {
            return Err(err(path, format!("invalid time '{text}'")));
        }
        Ok(hours * 60 + minutes)
    };

    let mut days = 0u8;
    if spec.days.is_empty() {
        days = TimeWindow::EVERY_DAY;
    }
    for day in &spec.days {
        let bit = match day.as_str() {
            "mon" => 0,
            "tue" => 1,
            "wed" => 2,
            "thu" => 3,
            "fri" => 4,
            "sat" => 5,
            "sun" => 6,
            other => return Err(err(path, format!("unknown weekday '{other}'"))),
        };
        days |= 1 << bit;
    }

    Ok(TimeWindow {
        start: minutes(&spec.start)?,
        end: minutes(&spec.end)?,
        days,
    })
}

fn parse_limit(path: &str, rate: &str, burst: Option<u32>) -> Result<RateLimit, ApiError> {
    let Some((count, unit)) = rate.split_once('/') else {
        return Err(err(path, format!("invalid rate '{rate}', expected count/unit")));
    };
    let count: u32 = count
        .trim()
        .parse()
        .map_err(|_| err(path, format!("invalid rate '{rate}'")))?;
    let per = match unit.trim() {
        "second" => RateUnit::Second,
        "minute" => RateUnit::Minute,
        "hour" => RateUnit::Hour,
        "day" => RateUnit::Day,
        other => return Err(err(path, format!("unknown rate unit '{other}'"))),
    };
    Ok(RateLimit {
        rate: count,
        per,
        burst,
    })
}

//--- Shadow analysis

/// Whether `earlier` makes `later` unreachable.
///
/// Deliberately conservative: only report a shadow when the earlier rule
/// provably covers everything the later one could match.
fn shadows(earlier: &Rule, later: &Rule) -> bool {
    if earlier.time.is_some() || earlier.limit.is_some() {
        return false;
    }
    if let Some(proto) = earlier.protocol {
        if later.protocol != Some(proto) {
            return false;
        }
    }
    if !ports_cover(&earlier.ports, &later.ports) {
        return false;
    }
    addr_covers(&earlier.source, &later.source) && addr_covers(&earlier.destination, &later.destination)
}

fn addr_covers(outer: &AddrMatch, inner: &AddrMatch) -> bool {
    match (outer, inner) {
        (AddrMatch::Any, _) => true,
        (AddrMatch::Set(a), AddrMatch::Set(b)) => a == b,
        (AddrMatch::Cidrs(outer), AddrMatch::Cidrs(inner)) => inner
            .iter()
            .all(|net| outer.iter().any(|cover| cover.contains(net))),
        _ => false,
    }
}

fn ports_cover(outer: &[PortRange], inner: &[PortRange]) -> bool {
    if outer.is_empty() {
        return true;
    }
    if inner.is_empty() {
        return false;
    }
    inner.iter().all(|range| {
        outer
            .iter()
            .any(|cover| cover.start <= range.start && range.end <= cover.end)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn check(text: &str) -> Result<Validated, ApiError> {
        validate(&doc::parse(text).unwrap(), false)
    }

    const HOME_ROUTER: &str = r#"
[[zone]]
name = "wan"

[[zone]]
name = "lan"
management = { ssh = true, api = true, ping = true }

[[interface]]
name = "eth0"
zone = "wan"
dhcp = true

[[interface]]
name = "eth1"
zone = "lan"
ipv4 = ["192.168.1.1/24"]

[[policy]]
from = "lan"
to = "wan"
default = "accept"

[[nat]]
name = "masq"
kind = "masquerade"
interface = "eth0"
"#;

    #[test]
    fn the_home_router_document_validates() {
        let validated = check(HOME_ROUTER).unwrap();
        assert_eq!(validated.graph.zones.len(), 2);
        assert_eq!(validated.graph.interfaces.len(), 2);
        assert!(validated.warnings.is_empty());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let text = r#"
[[zone]]
name = "lan"

[[zone]]
name = "lan"
"#;
        let errmsg = check(text).unwrap_err();
        let ApiError::Validate { path, .. } = errmsg else {
            panic!("expected a validation error");
        };
        assert_eq!(path, "zone[lan]");
    }

    #[test]
    fn dangling_references_are_rejected() {
        let text = r#"
[[interface]]
name = "eth0"
zone = "dmz"
"#;
        assert!(matches!(
            check(text).unwrap_err(),
            ApiError::Validate { path, .. } if path == "interface[eth0]"
        ));

        let text = r#"
[[zone]]
name = "lan"

[[policy]]
from = "lan"
to = "dmz"
"#;
        assert!(matches!(
            check(text).unwrap_err(),
            ApiError::Validate { path, .. } if path == "policy[lan->dmz]"
        ));
    }

    #[test]
    fn the_reserved_firewall_endpoint_resolves() {
        let text = r#"
[[zone]]
name = "lan"
management = { api = true }

[[policy]]
from = "lan"
to = "firewall"
default = "drop"
"#;
        let validated = check(text).unwrap();
        assert!(validated
            .graph
            .policies
            .contains_key(&(Endpoint::Zone("lan".into()), Endpoint::Firewall)));
    }

    #[test]
    fn port_clauses_need_a_port_protocol() {
        let text = r#"
[[zone]]
name = "lan"
management = { api = true }

[[zone]]
name = "wan"

[[policy]]
from = "lan"
to = "wan"

[[policy.rule]]
name = "bad"
action = "accept"
protocol = "icmp"
ports = [80]
"#;
        let errmsg = check(text).unwrap_err();
        assert!(matches!(
            errmsg,
            ApiError::Validate { reason, .. } if reason.contains("does not carry ports")
        ));
    }

    #[test]
    fn inverted_ranges_and_bad_cidrs_are_structural_errors() {
        let text = r#"
[[zone]]
name = "lan"
management = { api = true }

[[zone]]
name = "wan"

[[policy]]
from = "lan"
to = "wan"

[[policy.rule]]
name = "bad"
action = "accept"
protocol = "tcp"
ports = ["90-80"]
"#;
        assert!(matches!(
            check(text).unwrap_err(),
            ApiError::Validate { reason, .. } if reason.contains("inverted")
        ));

        let text = r#"
[[interface]]
name = "eth0"
ipv4 = ["not-an-address"]
"#;
        assert!(check(text).is_err());
    }

    #[test]
    fn rule_set_references_must_resolve() {
        let text = r#"
[[zone]]
name = "lan"
management = { api = true }

[[zone]]
name = "wan"

[[policy]]
from = "lan"
to = "wan"

[[policy.rule]]
name = "blocked"
action = "drop"
destination = "@threats"
"#;
        assert!(matches!(
            check(text).unwrap_err(),
            ApiError::Validate { reason, .. } if reason.contains("@threats")
        ));
    }

    #[test]
    fn losing_the_api_everywhere_is_flagged() {
        let text = r#"
[[zone]]
name = "lan"
management = { ssh = true }
"#;
        let validated = check(text).unwrap();
        assert!(validated.warnings.contains(&Warning::ApiUnreachable));
    }

    #[test]
    fn shadowed_rules_warn_and_fail_strict() {
        let text = r#"
[[zone]]
name = "lan"
management = { api = true }

[[zone]]
name = "wan"

[[policy]]
from = "lan"
to = "wan"

[[policy.rule]]
name = "wide"
action = "accept"
protocol = "tcp"
ports = ["1-1024"]

[[policy.rule]]
name = "narrow"
action = "drop"
protocol = "tcp"
ports = [80]
"#;
        let spec = doc::parse(text).unwrap();
        let validated = validate(&spec, false).unwrap();
        assert!(matches!(
            &validated.warnings[..],
            [Warning::Shadowed { rule, by, .. }] if rule == "narrow" && by == "wide"
        ));

        assert!(validate(&spec, true).is_err());
    }

    #[test]
    fn rate_limited_rules_do_not_shadow() {
        let text = r#"
[[zone]]
name = "lan"
management = { api = true }

[[zone]]
name = "wan"

[[policy]]
from = "lan"
to = "wan"

[[policy.rule]]
name = "limited"
action = "accept"
protocol = "tcp"
ports = [22]
limit = { rate = "10/minute" }

[[policy.rule]]
name = "fallback"
action = "drop"
protocol = "tcp"
ports = [22]
"#;
        let validated = check(text).unwrap();
        assert!(validated.warnings.is_empty());
    }

    #[test]
    fn disabled_blocks_are_invisible() {
        let text = r#"
[[zone]]
name = "lan"
management = { api = true }

[[zone]]
name = "dmz"
enabled = false

[[interface]]
name = "eth1"
zone = "lan"
ipv4 = ["192.168.1.1/24"]
"#;
        let validated = check(text).unwrap();
        assert_eq!(validated.graph.zones.len(), 1);

        // Referencing the disabled zone fails.
        let text = r#"
[[zone]]
name = "dmz"
enabled = false

[[interface]]
name = "eth1"
zone = "dmz"
"#;
        assert!(check(text).is_err());
    }

    #[test]
    fn service_blocks_canonicalize_into_the_graph() {
        let text = r#"
[[zone]]
name = "lan"
management = { api = true }

[dhcp]
range_start = "192.168.1.100"
range_end = "192.168.1.200"

[dns]
enabled = false
"#;
        let validated = check(text).unwrap();
        assert!(validated.graph.services.contains_key("dhcp"));
        // Disabled service blocks are dropped.
        assert!(!validated.graph.services.contains_key("dns"));
    }
}
