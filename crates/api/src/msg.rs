//! The request/response envelope and operation taxonomy.
//!
//! Messages travel as length-prefixed JSON frames.  Each request carries a
//! client-chosen id; every response names the request it answers, which is
//! what lets streaming event deliveries share a connection with ordinary
//! request/response traffic.

use serde::{Deserialize, Serialize};

use zonewall_ruleset::{ChangeSet, Fingerprint};

use crate::error::ApiError;
use crate::event::Event;
use crate::token::{Permission, Resource, Verb};

//----------- Request ----------------------------------------------------------

/// One request from a client to the control plane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// The client-chosen correlation id.
    ///
    /// Responses and streamed events carry the same id.  Ids are scoped to
    /// the connection.
    pub id: u64,

    /// The capability token secret.
    ///
    /// Absent only for [`Op::Health`].
    pub token: Option<String>,

    /// The per-request deadline, in seconds.
    ///
    /// Work still running when the deadline passes is cancelled and the
    /// request fails with [`ApiError::Timeout`].
    pub deadline_secs: Option<u64>,

    /// The network address the requesting client reached the router from.
    ///
    /// Set by the API plane from its HTTP peer; local socket clients (the
    /// CLI) leave it empty.  This is what lockout protection judges: an
    /// apply that severs the zone this address lives in must be overridden
    /// explicitly.
    #[serde(default)]
    pub client_addr: Option<std::net::IpAddr>,

    /// What to do.
    pub op: Op,
}

//----------- Op ---------------------------------------------------------------

/// The closed set of control-channel operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    /// Return the live configuration document, sensitive fields masked.
    #[serde(rename = "config.get")]
    ConfigGet,

    /// Validate, compile and commit a new document.
    #[serde(rename = "config.apply")]
    ConfigApply {
        /// The new configuration document text.
        document: String,

        /// Proceed even if the apply severs the requesting client's own
        /// management path.
        #[serde(default)]
        override_lockout: bool,
    },

    /// As `config.apply`, but armed with a rollback deadline: unless the
    /// client confirms in time, the prior generation is restored.
    #[serde(rename = "config.safe_apply")]
    ConfigSafeApply {
        /// The new configuration document text.
        document: String,

        /// Seconds until automatic rollback.
        rollback_secs: u64,

        #[serde(default)]
        override_lockout: bool,
    },

    /// Confirm the pending apply, making it permanent.
    #[serde(rename = "config.confirm")]
    ConfigConfirm,

    /// Describe the difference between a candidate document and the running
    /// generation.
    #[serde(rename = "config.diff")]
    ConfigDiff {
        /// The candidate document text.
        document: String,
    },

    /// Return the live compiled ruleset.
    #[serde(rename = "firewall.show")]
    FirewallShow,

    /// Return the per-zone traffic counters.
    #[serde(rename = "firewall.counters")]
    FirewallCounters,

    /// List the declared address sets.
    #[serde(rename = "ipset.list")]
    IpsetList,

    /// Return the elements of one runtime set.
    #[serde(rename = "ipset.show")]
    IpsetShow { name: String },

    /// Add an element to a runtime set.
    #[serde(rename = "ipset.add")]
    IpsetAdd { name: String, element: String },

    /// Remove an element from a runtime set.
    #[serde(rename = "ipset.remove")]
    IpsetRemove { name: String, element: String },

    /// Drop all elements of a runtime set.
    #[serde(rename = "ipset.flush")]
    IpsetFlush { name: String },

    /// List retained generations.
    #[serde(rename = "backup.list")]
    BackupList,

    /// Retain the running generation as a named backup.
    #[serde(rename = "backup.create")]
    BackupCreate {
        /// An operator-chosen label.
        label: Option<String>,
    },

    /// Re-apply a retained generation.
    #[serde(rename = "backup.restore")]
    BackupRestore { id: u64 },

    /// Stage a new binary for a seamless upgrade.
    #[serde(rename = "upgrade.stage")]
    UpgradeStage {
        /// The path of the replacement binary.
        binary: String,
    },

    /// Hand the listeners to the staged binary.
    #[serde(rename = "upgrade.swap")]
    UpgradeSwap,

    /// Leave safe mode.
    #[serde(rename = "safe_mode.clear")]
    SafeModeClear,

    /// Subscribe to the event feed.  The response stream delivers
    /// [`ResponseBody::Event`] frames under this request's id until the
    /// connection closes or the queue overflows.
    #[serde(rename = "events.subscribe")]
    EventsSubscribe,

    /// Unauthenticated liveness probe.
    #[serde(rename = "health")]
    Health,
}

impl Op {
    /// The permission this operation requires, if any.
    pub fn required_permission(&self) -> Option<Permission> {
        use {Resource::*, Verb::*};
        let (resource, verb) = match self {
            Self::ConfigGet | Self::ConfigDiff { .. } => (Config, Read),
            Self::ConfigApply { .. } | Self::ConfigSafeApply { .. } | Self::ConfigConfirm => {
                (Config, Write)
            }
            Self::FirewallShow | Self::FirewallCounters => (Firewall, Read),
            Self::IpsetList | Self::IpsetShow { .. } => (Ipset, Read),
            Self::IpsetAdd { .. } | Self::IpsetRemove { .. } | Self::IpsetFlush { .. } => {
                (Ipset, Write)
            }
            Self::BackupList => (Backup, Read),
            Self::BackupCreate { .. } | Self::BackupRestore { .. } => (Backup, Write),
            Self::UpgradeStage { .. } | Self::UpgradeSwap | Self::SafeModeClear => (System, Write),
            Self::EventsSubscribe => (Events, Read),
            Self::Health => return None,
        };
        Some(Permission::new(resource, verb))
    }

    /// The operation's wire name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConfigGet => "config.get",
            Self::ConfigApply { .. } => "config.apply",
            Self::ConfigSafeApply { .. } => "config.safe_apply",
            Self::ConfigConfirm => "config.confirm",
            Self::ConfigDiff { .. } => "config.diff",
            Self::FirewallShow => "firewall.show",
            Self::FirewallCounters => "firewall.counters",
            Self::IpsetList => "ipset.list",
            Self::IpsetShow { .. } => "ipset.show",
            Self::IpsetAdd { .. } => "ipset.add",
            Self::IpsetRemove { .. } => "ipset.remove",
            Self::IpsetFlush { .. } => "ipset.flush",
            Self::BackupList => "backup.list",
            Self::BackupCreate { .. } => "backup.create",
            Self::BackupRestore { .. } => "backup.restore",
            Self::UpgradeStage { .. } => "upgrade.stage",
            Self::UpgradeSwap => "upgrade.swap",
            Self::SafeModeClear => "safe_mode.clear",
            Self::EventsSubscribe => "events.subscribe",
            Self::Health => "health",
        }
    }
}

//----------- Response ---------------------------------------------------------

/// One frame from the control plane to a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// The id of the request this answers.
    pub id: u64,

    /// The payload.
    pub body: ResponseBody,
}

/// The payload of a response frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseBody {
    /// The final answer to a request.
    Result(Result<OpResult, ApiError>),

    /// One streamed event on a subscription.
    Event(Event),
}

//----------- OpResult ---------------------------------------------------------

/// The successful result of an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpResult {
    /// `config.get`: the live document, masked.
    Config {
        /// The masked document text.
        document: String,

        /// The generation currently live.
        generation: u64,
    },

    /// `config.apply` / `backup.restore`: a generation was committed.
    Applied {
        generation: u64,
        fingerprint: Fingerprint,
    },

    /// `config.safe_apply`: a generation is live but pending confirmation.
    Pending {
        generation: u64,
        fingerprint: Fingerprint,

        /// Seconds until automatic rollback.
        rollback_secs: u64,
    },

    /// `config.confirm`: the pending generation is now permanent.
    Confirmed { generation: u64 },

    /// `config.diff`: the candidate-vs-running difference.
    Diff {
        /// The component-classified change set.
        changes: ChangeSet,

        /// A human-readable rendering of the change set.
        summary: String,
    },

    /// `firewall.show`: the live compiled ruleset.
    Ruleset {
        generation: u64,
        fingerprint: Fingerprint,
        text: String,
    },

    /// `firewall.counters`: per-zone, per-protocol packet/byte counts.
    Counters { counters: Vec<CounterReading> },

    /// `ipset.list`.
    Sets { sets: Vec<SetStatus> },

    /// `ipset.show`.
    SetElements { name: String, elements: Vec<String> },

    /// `backup.list`.
    Backups { backups: Vec<BackupInfo> },

    /// `backup.create`.
    BackupCreated { id: u64 },

    /// `upgrade.stage`.
    UpgradeStaged { version: String },

    /// `events.subscribe`: the subscription is live.
    Subscribed,

    /// `health`.
    Health(HealthStatus),

    /// An operation with nothing to report succeeded.
    Done,
}

/// One named counter's reading.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterReading {
    pub name: String,
    pub packets: u64,
    pub bytes: u64,
}

/// One address set's runtime status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetStatus {
    pub name: String,

    /// The set's source kind: `static`, `url`, `dns` or `runtime`.
    pub kind: String,

    /// How many elements the set currently holds.
    pub elements: usize,

    /// Whether contents survive a reload.
    pub persistent: bool,
}

/// One retained generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub id: u64,
    pub fingerprint: Fingerprint,
    pub created: jiff::Timestamp,
    pub label: Option<String>,
}

/// The liveness report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// The live generation, if any ruleset has been applied.
    pub generation: Option<u64>,

    /// Whether the daemon is in safe mode.
    pub safe_mode: bool,

    /// Seconds since the daemon started.
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_names_match_the_wire_tags() {
        let op = Op::ConfigApply {
            document: String::new(),
            override_lockout: false,
        };
        let json = serde_json::to_value(&op).unwrap();
        assert!(json.get("config.apply").is_some());
        assert_eq!(op.name(), "config.apply");

        let json = serde_json::to_value(Op::Health).unwrap();
        assert_eq!(json, serde_json::json!("health"));
    }

    #[test]
    fn every_op_but_health_requires_a_permission() {
        assert!(Op::Health.required_permission().is_none());
        assert_eq!(
            Op::ConfigGet.required_permission(),
            Some(Permission::new(Resource::Config, Verb::Read))
        );
        assert_eq!(
            Op::UpgradeSwap.required_permission(),
            Some(Permission::new(Resource::System, Verb::Write))
        );
        assert_eq!(
            Op::IpsetAdd {
                name: "blocked".into(),
                element: "1.2.3.4".into()
            }
            .required_permission(),
            Some(Permission::new(Resource::Ipset, Verb::Write))
        );
    }

    #[test]
    fn requests_round_trip_through_json() {
        let request = Request {
            id: 7,
            token: Some("secret".into()),
            deadline_secs: Some(30),
            client_addr: Some("192.168.1.50".parse().unwrap()),
            op: Op::ConfigSafeApply {
                document: "schema_version = 1".into(),
                rollback_secs: 10,
                override_lockout: false,
            },
        };
        let bytes = serde_json::to_vec(&request).unwrap();
        let back: Request = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(request, back);
    }
}
