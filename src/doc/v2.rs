//! Version 2 of the configuration document.
//!
//! This is the current schema.  Field names here are the document language;
//! they use underscores (`route_group`, `schema_version`) rather than the
//! kebab-case of Zonewall's internal state files, because the document is
//! operator-facing and predates those conventions.

use serde::{Deserialize, Serialize};

use crate::doc::CURRENT_SCHEMA_VERSION;

fn default_true() -> bool {
    true
}

fn current_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

fn default_refresh_secs() -> u64 {
    3600
}

fn default_max_elements() -> usize {
    65536
}

fn default_min_refresh_secs() -> u64 {
    300
}

fn default_drop() -> String {
    "drop".into()
}

fn default_failover() -> String {
    "failover".into()
}

//----------- Spec -------------------------------------------------------------

/// A configuration document.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Spec {
    /// The declared schema version.
    #[serde(default = "current_version")]
    pub schema_version: u32,

    pub zone: Vec<ZoneSpec>,
    pub interface: Vec<InterfaceSpec>,
    pub policy: Vec<PolicySpec>,
    pub nat: Vec<NatSpec>,
    pub ipset: Vec<IpsetSpec>,
    pub route: Vec<RouteSpec>,
    pub route_group: Vec<RouteGroupSpec>,

    // Service subsystems.  The core does not interpret these beyond the
    // 'enabled' flag; each is handed, canonicalized, to its adapter.
    pub dhcp: Option<toml::Table>,
    pub dns: Option<toml::Table>,
    pub vpn: Option<toml::Table>,
    pub wireguard: Option<toml::Table>,
    pub qos: Option<toml::Table>,
    pub notifications: Option<toml::Table>,
    pub api: Option<toml::Table>,
    pub rule_learning: Option<toml::Table>,
}

impl Spec {
    /// The service blocks, by subsystem name, declaration order fixed.
    pub fn service_blocks(&self) -> impl Iterator<Item = (&'static str, &toml::Table)> {
        [
            ("dhcp", &self.dhcp),
            ("dns", &self.dns),
            ("vpn", &self.vpn),
            ("wireguard", &self.wireguard),
            ("qos", &self.qos),
            ("notifications", &self.notifications),
            ("api", &self.api),
            ("rule_learning", &self.rule_learning),
        ]
        .into_iter()
        .filter_map(|(name, block)| Some((name, block.as_ref()?)))
    }

    /// Mutable access to the present service blocks, for masking.
    pub fn service_blocks_mut(&mut self) -> impl Iterator<Item = &mut toml::Table> {
        [
            &mut self.dhcp,
            &mut self.dns,
            &mut self.vpn,
            &mut self.wireguard,
            &mut self.qos,
            &mut self.notifications,
            &mut self.api,
            &mut self.rule_learning,
        ]
        .into_iter()
        .flatten()
    }
}

//----------- ZoneSpec ---------------------------------------------------------

/// A `[[zone]]` block.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ZoneSpec {
    pub name: String,
    pub description: Option<String>,
    pub management: ManagementSpec,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// The management services exposed to a zone.
#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct ManagementSpec {
    pub ssh: bool,
    pub web_ui: bool,
    pub api: bool,
    pub ping: bool,
}

//----------- InterfaceSpec ----------------------------------------------------

/// An `[[interface]]` block.
///
/// The interface kind is implied by which sub-table is present: `vlan`,
/// `bond`, `wireguard`, or none of them for a physical device.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct InterfaceSpec {
    pub name: String,
    pub zone: Option<String>,

    pub vlan: Option<VlanSpec>,
    pub bond: Option<BondSpec>,
    pub wireguard: Option<WireguardIfSpec>,

    /// Obtain addresses via DHCP.
    pub dhcp: bool,

    /// Static IPv4 prefixes, e.g. `"192.168.1.1/24"`.
    pub ipv4: Vec<String>,

    /// Static IPv6 prefixes.
    pub ipv6: Vec<String>,

    pub mtu: Option<u32>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VlanSpec {
    pub parent: String,
    pub id: u16,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BondSpec {
    pub members: Vec<String>,
    #[serde(default)]
    pub mode: BondModeSpec,
}

#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BondModeSpec {
    #[default]
    ActiveBackup,
    RoundRobin,
    Lacp,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WireguardIfSpec {
    pub listen_port: u16,
}

//----------- PolicySpec -------------------------------------------------------

/// A `[[policy]]` block.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct PolicySpec {
    /// The source endpoint: a zone name or `firewall`.
    pub from: String,

    /// The destination endpoint: a zone name or `firewall`.
    pub to: String,

    /// The action for traffic no rule matched.
    #[serde(rename = "default", default = "default_drop")]
    pub default: String,

    /// The ordered rules.
    pub rule: Vec<RuleSpec>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// A `[[policy.rule]]` block.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuleSpec {
    pub name: String,
    pub action: String,
    pub protocol: Option<String>,

    /// Source addresses: a CIDR, a list of CIDRs, or `"@set"`.
    pub source: Option<AddrSpec>,

    /// Destination addresses, same forms.
    pub destination: Option<AddrSpec>,

    /// Destination ports: numbers or `"start-end"` ranges.
    pub ports: Vec<PortSpec>,

    pub time: Option<TimeSpec>,
    pub limit: Option<LimitSpec>,

    /// Log matched packets with this prefix.
    pub log: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// An address clause: one entry or a list.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AddrSpec {
    One(String),
    Many(Vec<String>),
}

impl AddrSpec {
    /// The clause as a list of entries.
    pub fn entries(&self) -> Vec<&str> {
        match self {
            Self::One(s) => vec![s.as_str()],
            Self::Many(list) => list.iter().map(String::as_str).collect(),
        }
    }
}

/// A port entry: a number or a `"start-end"` range.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PortSpec {
    Port(u16),
    Range(String),
}

/// A time-of-day restriction.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TimeSpec {
    /// `"HH:MM"`.
    pub start: String,

    /// `"HH:MM"`, exclusive.
    pub end: String,

    /// Lowercase three-letter weekdays; empty means every day.
    #[serde(default)]
    pub days: Vec<String>,
}

/// A rate limit.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LimitSpec {
    /// `"count/unit"`, e.g. `"10/minute"`.
    pub rate: String,

    pub burst: Option<u32>,
}

//----------- NatSpec ----------------------------------------------------------

/// A `[[nat]]` block.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct NatSpec {
    pub name: String,

    /// `"masquerade"`, `"snat"` or `"dnat"`.
    pub kind: String,

    /// The interface the translation is tied to: outbound for masquerade
    /// and snat, inbound for dnat.
    pub interface: String,

    /// dnat: the transport protocol.
    pub protocol: Option<String>,

    /// dnat: the inbound port or range.
    pub port: Option<PortSpec>,

    /// snat: only translate traffic from this prefix.
    pub source: Option<String>,

    /// dnat/snat: the translation target address.
    pub to: Option<String>,

    /// dnat: the target port, defaulting to the inbound port.
    pub to_port: Option<u16>,

    /// dnat: also reach the forward from inside via the external address.
    pub hairpin: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

//----------- IpsetSpec --------------------------------------------------------

/// An `[[ipset]]` block.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct IpsetSpec {
    pub name: String,

    /// Element kind: `"ipv4"`, `"ipv6"`, `"cidr"` or `"mac"`.
    #[serde(rename = "type")]
    pub elem: String,

    /// Source kind: `"static"`, `"url"`, `"dns"` or `"runtime"`.  When
    /// omitted it is inferred from which other fields are present.
    pub source: Option<String>,

    /// static: the elements.
    pub elements: Vec<String>,

    /// url: where to fetch from.
    pub url: Option<String>,

    /// url: refresh interval in seconds.
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,

    /// url: refuse feeds larger than this.
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,

    /// dns: the domains to resolve.
    pub domains: Vec<String>,

    /// dns: refresh floor for very short TTLs.
    #[serde(default = "default_min_refresh_secs")]
    pub min_refresh_secs: u64,

    /// runtime: whether contents survive a daemon restart.
    #[serde(default = "default_true")]
    pub persist: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl IpsetSpec {
    /// The effective source kind, inferred when not declared.
    pub fn source_kind(&self) -> &str {
        if let Some(source) = &self.source {
            return source;
        }
        if self.url.is_some() {
            "url"
        } else if !self.domains.is_empty() {
            "dns"
        } else if !self.elements.is_empty() {
            "static"
        } else {
            "runtime"
        }
    }
}

//----------- RouteSpec --------------------------------------------------------

/// A `[[route]]` block.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct RouteSpec {
    /// The destination prefix, e.g. `"10.0.0.0/8"` or `"default"`.
    pub dest: String,

    pub via: Option<String>,
    pub device: Option<String>,
    pub metric: Option<u32>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

//----------- RouteGroupSpec ---------------------------------------------------

/// A `[[route_group]]` block.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct RouteGroupSpec {
    pub name: String,

    /// `"failover"` or `"balance"`.
    #[serde(default = "default_failover")]
    pub policy: String,

    pub uplink: Vec<UplinkSpec>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// An `[[route_group.uplink]]` block.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UplinkSpec {
    pub interface: String,
    pub gateway: String,

    /// The address probed to judge uplink health.
    pub probe: String,
}
