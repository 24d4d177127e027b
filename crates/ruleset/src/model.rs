//! The entity model.
//!
//! These types are the canonical representation of a validated
//! configuration.  They are produced by the daemon's document parser,
//! cross-checked by its validator, and consumed by [`compile`].  All
//! relationships between entities are by stable string label; the resolver
//! lives with the validator, not here.
//!
//! [`compile`]: crate::compile::compile

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

//----------- Zone -------------------------------------------------------------

/// A logical trust region.
///
/// Interfaces are assigned to zones; policies govern traffic between zones.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    /// The unique name of the zone.
    pub name: String,

    /// A human-readable description.
    pub description: Option<String>,

    /// Which management services are reachable from this zone.
    pub management: Management,
}

/// Management services offered to a zone.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Management {
    /// SSH access to the router itself.
    pub ssh: bool,

    /// The web UI, served by the API plane.
    pub web_ui: bool,

    /// The HTTP API, served by the API plane.
    pub api: bool,

    /// ICMP echo to the router itself.
    pub ping: bool,
}

impl Management {
    /// Whether any management service is exposed to the zone.
    pub fn any(&self) -> bool {
        self.ssh || self.web_ui || self.api || self.ping
    }
}

//----------- Interface --------------------------------------------------------

/// A named L2/L3 endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// The unique kernel name of the interface.
    pub name: String,

    /// What kind of device this is.
    pub kind: InterfaceKind,

    /// The zone this interface belongs to, if any.
    pub zone: Option<String>,

    /// How the interface is addressed.
    pub addressing: Addressing,

    /// An explicit MTU, if not the kernel default.
    pub mtu: Option<u32>,
}

/// The kind of an interface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterfaceKind {
    /// A physical device, assumed to exist already.
    Physical,

    /// An 802.1Q VLAN on top of a parent device.
    Vlan {
        /// The parent interface, by name.
        parent: String,

        /// The VLAN id (1..=4094).
        id: u16,
    },

    /// A bonded device aggregating several members.
    Bond {
        /// The member interfaces, by name.
        members: Vec<String>,

        /// The bonding mode.
        mode: BondMode,
    },

    /// A WireGuard tunnel device.
    ///
    /// The tunnel itself is managed by the WireGuard service adapter; the
    /// core only tracks the device and its zone membership.
    Wireguard {
        /// The UDP listen port.
        listen_port: u16,
    },
}

/// Bonding modes supported by the kernel driver.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BondMode {
    ActiveBackup,
    RoundRobin,
    Lacp,
}

impl fmt::Display for BondMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ActiveBackup => "active-backup",
            Self::RoundRobin => "round-robin",
            Self::Lacp => "802.3ad",
        })
    }
}

/// How an interface obtains its addresses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Addressing {
    /// Statically configured prefixes.
    Static {
        /// The addresses, with prefix lengths.
        addrs: Vec<IpNet>,
    },

    /// Addresses from an upstream DHCP server.
    DhcpClient,

    /// No L3 configuration (e.g. a bare bond member).
    None,
}

//----------- Policy -----------------------------------------------------------

/// An endpoint of a policy: a zone, or the router itself.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Endpoint {
    /// Traffic terminating at or originating from the router.
    Firewall,

    /// A declared zone, by name.
    Zone(String),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Firewall => f.write_str("firewall"),
            Self::Zone(name) => f.write_str(name),
        }
    }
}

impl FromStr for Endpoint {
    type Err = core::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "firewall" => Self::Firewall,
            other => Self::Zone(other.into()),
        })
    }
}

/// An ordered ruleset from one endpoint to another.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Where matched traffic comes from.
    pub from: Endpoint,

    /// Where matched traffic goes.
    pub to: Endpoint,

    /// What happens to traffic no rule matched.
    pub default_action: Action,

    /// The rules, evaluated in order.
    pub rules: Vec<Rule>,
}

/// What to do with a matched packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Accept,
    Reject,
    Drop,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Drop => "drop",
        })
    }
}

//----------- Rule -------------------------------------------------------------

/// One match/action line within a policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// The name of the rule, unique within its policy.
    pub name: String,

    /// The action taken on a match.
    pub action: Action,

    /// The transport protocol to match, if any.
    pub protocol: Option<Protocol>,

    /// The source addresses to match.
    pub source: AddrMatch,

    /// The destination addresses to match.
    pub destination: AddrMatch,

    /// The destination ports to match.
    ///
    /// Only meaningful for protocols that carry ports; the validator rejects
    /// port clauses on other protocols.
    pub ports: Vec<PortRange>,

    /// A time-of-day restriction.
    pub time: Option<TimeWindow>,

    /// A rate limit.
    pub limit: Option<RateLimit>,

    /// Log matched packets with this prefix.
    pub log: Option<String>,
}

/// A transport protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    /// A raw IP protocol number.
    Number(u8),
}

impl Protocol {
    /// Whether this protocol admits port clauses.
    pub fn has_ports(&self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
            Self::Icmp => f.write_str("icmp"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// A source or destination address clause.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddrMatch {
    /// Match anything.
    Any,

    /// Match any of the given prefixes.
    Cidrs(Vec<IpNet>),

    /// Match membership of a named address set (`@name` in the document).
    Set(String),
}

impl AddrMatch {
    /// The set name referenced by this clause, if any.
    pub fn set_ref(&self) -> Option<&str> {
        match self {
            Self::Set(name) => Some(name),
            _ => None,
        }
    }
}

/// An inclusive port range.  A single port is a range of length one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// A range covering exactly one port.
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A time-of-day window with a weekday mask.
///
/// Times are minutes since midnight, local to the router.  A window whose
/// end precedes its start wraps past midnight.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Start of the window, minutes since midnight.
    pub start: u16,

    /// End of the window, minutes since midnight (exclusive).
    pub end: u16,

    /// Weekday mask, bit 0 = Monday through bit 6 = Sunday.
    pub days: u8,
}

impl TimeWindow {
    /// All seven weekdays.
    pub const EVERY_DAY: u8 = 0x7f;

    /// Whether the mask names every weekday.
    pub fn all_days(&self) -> bool {
        self.days & Self::EVERY_DAY == Self::EVERY_DAY
    }
}

/// A token-bucket rate limit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Allowed events per unit.
    pub rate: u32,

    /// The unit of the rate.
    pub per: RateUnit,

    /// Extra burst allowance, in packets.
    pub burst: Option<u32>,
}

/// The denominator of a rate limit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl fmt::Display for RateUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        })
    }
}

//----------- Nat --------------------------------------------------------------

/// A NAT rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nat {
    /// The name of the rule, unique among NAT rules.
    pub name: String,

    /// What kind of translation to perform.
    pub kind: NatKind,
}

/// The kinds of NAT rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NatKind {
    /// Source-NAT outbound traffic to the outbound interface's address.
    Masquerade {
        /// The outbound interface.
        out_interface: String,
    },

    /// Rewrite the source of outbound traffic to a fixed address.
    Snat {
        /// The outbound interface.
        out_interface: String,

        /// Only translate traffic from these prefixes, if given.
        source: Option<IpNet>,

        /// The replacement source address.
        to: IpAddr,
    },

    /// Redirect inbound traffic to an internal host.
    Dnat {
        /// The inbound interface.
        in_interface: String,

        /// The transport protocol.
        protocol: Protocol,

        /// The inbound destination port(s).
        port: PortRange,

        /// The internal target address.
        to: IpAddr,

        /// The internal target port; defaults to the inbound port.
        to_port: Option<u16>,

        /// Re-masquerade locally originated traffic matching this selector
        /// so that hosts on the internal network can reach the forward via
        /// the external address.
        hairpin: bool,
    },
}

//----------- AddrSet ----------------------------------------------------------

/// A named set of addresses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrSet {
    /// The unique name of the set (referenced as `@name` in rules).
    pub name: String,

    /// The kind of element stored.
    pub elem: ElemKind,

    /// Where elements come from.
    pub source: SetSource,
}

impl AddrSet {
    /// Whether the set's contents are mutated at runtime rather than by the
    /// configuration document.
    pub fn is_runtime(&self) -> bool {
        !matches!(self.source, SetSource::Static { .. })
    }
}

/// The element kind of an address set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElemKind {
    Ipv4,
    Ipv6,
    /// IPv4 prefixes.
    Cidr,
    Mac,
}

impl ElemKind {
    /// The nftables set type for this element kind.
    pub fn nft_type(&self) -> &'static str {
        match self {
            Self::Ipv4 | Self::Cidr => "ipv4_addr",
            Self::Ipv6 => "ipv6_addr",
            Self::Mac => "ether_addr",
        }
    }

    /// Whether the kernel set needs interval support.
    pub fn is_interval(&self) -> bool {
        matches!(self, Self::Cidr)
    }
}

/// Where an address set's elements come from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SetSource {
    /// Elements listed in the configuration document.
    ///
    /// Replaced wholesale on every reload.
    Static {
        /// The elements, in document order.
        elements: Vec<String>,
    },

    /// Elements fetched from a URL (threat intelligence feeds).
    Url {
        /// Where to fetch from.
        url: String,

        /// How often to refresh, in seconds.
        refresh_secs: u64,

        /// Refuse feeds larger than this many elements.
        max_elements: usize,
    },

    /// Elements resolved from DNS names, refreshed per TTL.
    Dns {
        /// The domains to resolve.
        domains: Vec<String>,

        /// Refresh floor, in seconds, for very short TTLs.
        min_refresh_secs: u64,
    },

    /// Elements added and removed by other subsystems at runtime.
    Runtime {
        /// Whether contents survive a daemon restart (persisted to disk).
        persist: bool,
    },
}

//----------- Route ------------------------------------------------------------

/// A static route.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// The destination prefix.
    pub dest: IpNet,

    /// The next hop, if routed via a gateway.
    pub via: Option<IpAddr>,

    /// The egress device, if pinned to one.
    pub device: Option<String>,

    /// The route metric.
    pub metric: Option<u32>,
}

/// A multi-uplink failover group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteGroup {
    /// The unique name of the group.
    pub name: String,

    /// The uplinks, in priority order.
    pub uplinks: Vec<Uplink>,

    /// How the active uplink is elected.
    pub election: ElectionPolicy,
}

/// One uplink within a route group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uplink {
    /// The egress interface.
    pub interface: String,

    /// The gateway address.
    pub gateway: IpAddr,

    /// The address probed to judge uplink health.
    pub probe_target: IpAddr,
}

/// How a route group elects its active uplink.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElectionPolicy {
    /// The first healthy uplink in declaration order wins.
    Failover,

    /// All healthy uplinks are installed with equal-cost routes.
    Balance,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_round_trips_the_reserved_label() {
        let fw: Endpoint = "firewall".parse().unwrap();
        assert_eq!(fw, Endpoint::Firewall);
        assert_eq!(fw.to_string(), "firewall");

        let zone: Endpoint = "lan".parse().unwrap();
        assert_eq!(zone, Endpoint::Zone("lan".into()));
    }

    #[test]
    fn port_range_display() {
        assert_eq!(PortRange::single(22).to_string(), "22");
        assert_eq!(PortRange { start: 10, end: 20 }.to_string(), "10-20");
    }

    #[test]
    fn only_tcp_and_udp_carry_ports() {
        assert!(Protocol::Tcp.has_ports());
        assert!(Protocol::Udp.has_ports());
        assert!(!Protocol::Icmp.has_ports());
        assert!(!Protocol::Number(47).has_ports());
    }
}
