//! Domain events delivered to subscribers.

use serde::{Deserialize, Serialize};

use zonewall_ruleset::Fingerprint;

//----------- Event ------------------------------------------------------------

/// Something that happened in the control plane.
///
/// Subscribers see events in the order the control plane generated them,
/// per subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Event {
    /// A generation was committed.
    Applied {
        generation: u64,
        fingerprint: Fingerprint,
    },

    /// A pending apply was confirmed.
    Confirmed { generation: u64 },

    /// A generation was rolled back.
    RolledBack {
        /// The generation that was removed.
        generation: u64,

        /// Why: a kernel failure, an expired pending apply, or tampering
        /// recovery.
        reason: String,
    },

    /// The integrity monitor observed an external ruleset mutation and
    /// restored the authoritative state.
    Tampering {
        /// Who mutated the ruleset, as far as the kernel reports it.
        actor: String,

        /// A terse description of the difference.
        summary: String,
    },

    /// The daemon entered safe mode.
    SafeModeEntered { reason: String },

    /// The daemon left safe mode.
    SafeModeCleared,

    /// A route group elected a different uplink.
    UplinkChanged {
        group: String,

        /// The now-active uplink interface, or `None` if all are down.
        active: Option<String>,
    },

    /// A dynamic set changed outside a reload.
    SetUpdated {
        name: String,

        /// The element count after the change.
        elements: usize,
    },

    /// A service subsystem reported a domain event (lease granted, peer
    /// connected, ...).
    Service {
        /// The subsystem name, e.g. `dhcp`.
        subsystem: String,

        /// The subsystem-specific payload.
        detail: String,
    },

    /// A seamless upgrade handed the listeners to a new generation of the
    /// daemon.
    UpgradeCompleted { version: String },
}
