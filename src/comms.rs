//! Communication between units.

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;

use zonewall_api::{ApiError, Event, OpResult};
use zonewall_ruleset::{ChangeSet, Graph};

//----------- Terminated -------------------------------------------------------

/// A unit stopped because the daemon is shutting down.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Terminated;

impl std::error::Error for Terminated {}

impl fmt::Display for Terminated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("terminated")
    }
}

//----------- ApplicationCommand -----------------------------------------------

/// A command sent to a unit.
#[derive(Clone, Debug)]
pub enum ApplicationCommand {
    /// Shut the unit down.
    Terminate,

    /// A new generation was committed.
    ///
    /// Carries the new graph and the classified diff against the previous
    /// generation, so each unit can decide whether it is affected.
    GenerationCommitted {
        /// The committed generation's id.
        generation: u64,

        /// The new object graph.
        graph: Arc<Graph>,

        /// The difference against the previous generation.
        changes: ChangeSet,
    },

    /// The integrity monitor should re-capture its reference listing.
    ///
    /// Sent after every kernel ruleset change the daemon itself performs,
    /// so that self-inflicted changes are not reported as tampering.
    RearmIntegrity,

    /// The daemon entered or left safe mode.
    SafeModeChanged {
        /// Whether safe mode is now active.
        active: bool,
    },
}

//----------- Update -----------------------------------------------------------

/// An update from a unit to the central command.
#[derive(Debug)]
pub enum Update {
    /// A domain event for control-channel subscribers.
    Event(Event),

    /// A generation was committed and units should be notified.
    GenerationCommitted {
        generation: u64,
        graph: Arc<Graph>,
        changes: ChangeSet,
    },

    /// Safe mode was entered or cleared.
    SafeModeChanged { active: bool },
}

//----------- Reply ------------------------------------------------------------

/// The reply slot carried inside request-shaped commands.
pub type Reply = oneshot::Sender<Result<OpResult, ApiError>>;
