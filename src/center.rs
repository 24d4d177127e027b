//! Zonewall's central command.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error};

use zonewall_api::Event;
use zonewall_ruleset::{CompiledRuleset, Graph};

use crate::apply::ApplyRequest;
use crate::comms::{ApplicationCommand, Update};
use crate::config::Config;
use crate::log::Logger;
use crate::metrics::Metrics;
use crate::state::tokens::TokenStore;

/// How long the state must stay quiet before the debounced save writes.
const SAVE_DEBOUNCE: Duration = Duration::from_secs(5);

//----------- Center -----------------------------------------------------------

/// Zonewall's central command.
///
/// One instance is shared by every unit.  The configuration and logger are
/// immutable; mutable state sits behind the mutex; the live generation is
/// published through an [`ArcSwapOption`] so readers never contend with the
/// applier.
#[derive(Debug)]
pub struct Center {
    /// Global state.
    pub state: Mutex<State>,

    /// The install environment and daemon settings.
    pub config: Config,

    /// The logger.
    pub logger: &'static Logger,

    /// The live generation, if any has been applied.
    pub live: ArcSwapOption<Generation>,

    /// Daemon-wide metrics.
    pub metrics: Metrics,

    /// When the daemon started, for uptime reporting.
    pub started_at: Instant,

    /// A channel to send units commands.
    pub app_cmd_tx: mpsc::UnboundedSender<(String, ApplicationCommand)>,

    /// A channel to send the central command updates.
    pub update_tx: mpsc::UnboundedSender<Update>,

    /// The serialized applier's request queue.
    pub apply_tx: mpsc::UnboundedSender<ApplyRequest>,

    /// The event fan-out to control-channel subscribers.
    ///
    /// The central command publishes here; each subscription gets its own
    /// bounded queue, and a subscriber that falls too far behind is dropped
    /// with a back-pressure error rather than stalling the publisher.
    pub events: tokio::sync::broadcast::Sender<Event>,
}

impl Center {
    /// Emit a domain event to control-channel subscribers.
    pub fn notify(&self, event: Event) {
        // The central command only disappears during shutdown, when losing
        // events is fine.
        let _ = self.update_tx.send(Update::Event(event));
    }

    /// The daemon's uptime in whole seconds.
    pub fn uptime_secs(&self) -> u64 {
        Instant::now()
            .checked_duration_since(self.started_at)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

//----------- Generation -------------------------------------------------------

/// One immutable configuration generation.
#[derive(Clone, Debug)]
pub struct Generation {
    /// The monotonically increasing generation id.
    pub id: u64,

    /// The source document text this generation was built from.
    pub source: String,

    /// The canonical object graph.
    pub graph: Arc<Graph>,

    /// The compiled kernel ruleset.
    pub compiled: CompiledRuleset,
}

//----------- State ------------------------------------------------------------

/// Global mutable state for Zonewall.
#[derive(Debug, Default)]
pub struct State {
    /// The next generation id to hand out.
    pub next_generation_id: u64,

    /// The live generation's id, mirrored from the published pointer.
    ///
    /// This is the "last-committed marker" that restart recovery reads.
    pub live_id: Option<u64>,

    /// The rollback target: the generation the live one replaced.
    pub prior: Option<Arc<Generation>>,

    /// The pending apply awaiting confirmation, if any.
    ///
    /// The rollback timer itself is armed inside the applier; this record
    /// exists for status reporting and conflict detection.
    pub pending: Option<PendingApply>,

    /// Why the daemon is in safe mode, if it is.
    pub safe_mode: Option<String>,

    /// External mutations restored since start.
    pub tamper_count: u64,

    /// Retained generation metadata; the artifacts live in the state dir.
    pub backups: Vec<BackupRecord>,

    /// The capability token store.
    pub tokens: TokenStore,

    /// Bumped on every change to this state.
    ///
    /// The debounced save task only writes once the epoch has stopped
    /// moving for a full debounce interval, so a burst of changes costs
    /// one disk write.
    pub dirty_epoch: u64,

    /// Whether a debounced save task is already in flight.
    pub save_scheduled: bool,
}

impl State {
    /// Attempt to load the global state file.
    pub fn init_from_file(&mut self, config: &Config) -> std::io::Result<()> {
        let path = config.state_file();
        let spec = crate::state::Spec::load(&path)?;
        spec.parse_into(self);
        Ok(())
    }

    /// Mark the global state as dirty.
    ///
    /// Schedules a debounced save.  The save task sleeps and re-checks the
    /// dirty epoch: as long as changes keep arriving it keeps waiting, and
    /// it writes once the state has been quiet for a whole interval.  At
    /// most one task is in flight; further changes just bump the epoch it
    /// is watching.
    pub fn mark_dirty(&mut self, center: &Arc<Center>) {
        self.dirty_epoch += 1;
        if self.save_scheduled {
            return;
        }
        self.save_scheduled = true;

        let center = center.clone();
        let mut seen = self.dirty_epoch;
        tokio::spawn(async move {
            let spec = loop {
                tokio::time::sleep(SAVE_DEBOUNCE).await;

                let mut state = center.state.lock().unwrap();
                if state.dirty_epoch != seen {
                    // Still changing; let it settle before writing.
                    seen = state.dirty_epoch;
                    continue;
                }
                state.save_scheduled = false;
                break crate::state::Spec::build(&state);
            };

            let path = center.config.state_file();
            match spec.save(&path) {
                Ok(()) => debug!("Persisted global state to '{path}'"),
                Err(err) => {
                    error!("Persisting global state to '{path}' failed: {err}");
                }
            }
        });
    }
}

//----------- PendingApply -----------------------------------------------------

/// A committed generation awaiting confirmation or rollback.
#[derive(Clone, Debug)]
pub struct PendingApply {
    /// The generation that is live but unconfirmed.
    pub generation: u64,

    /// What the apply touched.
    pub kind: ApplyScope,

    /// When the automatic rollback fires.
    pub deadline: Instant,
}

/// What an apply touched, for rollback planning.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ApplyScope {
    /// Only the kernel ruleset changed.
    RulesetOnly,

    /// Interfaces or routes changed too; rollback must restore the network
    /// snapshot as well.
    Network,
}

//----------- BackupRecord -----------------------------------------------------

/// Metadata for one retained generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupRecord {
    /// The retained generation's id.
    pub id: u64,

    /// The fingerprint of the retained compiled ruleset.
    pub fingerprint: zonewall_ruleset::Fingerprint,

    /// When the backup was taken.
    pub created: jiff::Timestamp,

    /// An operator-chosen label.
    pub label: Option<String>,
}
