//! Version 1 of the configuration document.
//!
//! Differences from version 2:
//!
//! - zone management services were a list of names
//!   (`management = ["ssh", "api"]`) instead of a table of flags;
//! - rule ports were a single comma-separated string
//!   (`ports = "22,80-90"`) instead of an array;
//! - the policy default action was spelled `default_action`.
//!
//! Blocks that did not change shape reuse the version 2 types directly.

use serde::Deserialize;

use crate::doc::v2;

fn default_true() -> bool {
    true
}

//----------- Spec -------------------------------------------------------------

/// A version 1 configuration document.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Spec {
    pub schema_version: Option<u32>,

    pub zone: Vec<ZoneSpec>,
    pub interface: Vec<v2::InterfaceSpec>,
    pub policy: Vec<PolicySpec>,
    pub nat: Vec<v2::NatSpec>,
    pub ipset: Vec<v2::IpsetSpec>,
    pub route: Vec<v2::RouteSpec>,
    pub route_group: Vec<v2::RouteGroupSpec>,

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
    /// Migrate to the version 2 schema.
    pub fn migrate(self) -> v2::Spec {
        v2::Spec {
            schema_version: crate::doc::CURRENT_SCHEMA_VERSION,
            zone: self.zone.into_iter().map(ZoneSpec::migrate).collect(),
            interface: self.interface,
            policy: self.policy.into_iter().map(PolicySpec::migrate).collect(),
            nat: self.nat,
            ipset: self.ipset,
            route: self.route,
            route_group: self.route_group,
            dhcp: self.dhcp,
            dns: self.dns,
            vpn: self.vpn,
            wireguard: self.wireguard,
            qos: self.qos,
            notifications: self.notifications,
            api: self.api,
            rule_learning: self.rule_learning,
        }
    }
}

//----------- ZoneSpec ---------------------------------------------------------

/// A version 1 `[[zone]]` block.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ZoneSpec {
    pub name: String,
    pub description: Option<String>,

    /// Service names: `"ssh"`, `"web_ui"`, `"api"`, `"ping"`.
    pub management: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ZoneSpec {
    fn migrate(self) -> v2::ZoneSpec {
        let has = |name: &str| self.management.iter().any(|s| s == name);
        v2::ZoneSpec {
            name: self.name,
            description: self.description,
            management: v2::ManagementSpec {
                ssh: has("ssh"),
                web_ui: has("web_ui"),
                api: has("api"),
                ping: has("ping"),
            },
            enabled: self.enabled,
        }
    }
}

//----------- PolicySpec -------------------------------------------------------

/// A version 1 `[[policy]]` block.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PolicySpec {
    pub from: String,
    pub to: String,

    /// Renamed to `default` in version 2.
    pub default_action: Option<String>,

    pub rule: Vec<RuleSpec>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl PolicySpec {
    fn migrate(self) -> v2::PolicySpec {
        v2::PolicySpec {
            from: self.from,
            to: self.to,
            default: self.default_action.unwrap_or_else(|| "drop".into()),
            rule: self.rule.into_iter().map(RuleSpec::migrate).collect(),
            enabled: self.enabled,
        }
    }
}

//----------- RuleSpec ---------------------------------------------------------

/// A version 1 `[[policy.rule]]` block.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuleSpec {
    pub name: String,
    pub action: String,
    pub protocol: Option<String>,
    pub source: Option<v2::AddrSpec>,
    pub destination: Option<v2::AddrSpec>,

    /// A comma-separated list of ports and ranges.
    pub ports: Option<String>,

    pub time: Option<v2::TimeSpec>,
    pub limit: Option<v2::LimitSpec>,
    pub log: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl RuleSpec {
    fn migrate(self) -> v2::RuleSpec {
        let ports = self
            .ports
            .map(|text| {
                text.split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(|part| match part.parse::<u16>() {
                        Ok(port) => v2::PortSpec::Port(port),
                        // Ranges (and anything unparseable) stay textual for
                        // the validator to judge.
                        Err(_) => v2::PortSpec::Range(part.into()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        v2::RuleSpec {
            name: self.name,
            action: self.action,
            protocol: self.protocol,
            source: self.source,
            destination: self.destination,
            ports,
            time: self.time,
            limit: self.limit,
            log: self.log,
            enabled: self.enabled,
        }
    }
}
