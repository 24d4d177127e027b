//! The central command: the single router for updates.
//!
//! Units never talk to each other directly.  They send [`Update`]s here,
//! and the central command decides who needs to hear what: domain events go
//! to the subscriber fan-out, commits and safe-mode transitions are
//! re-broadcast to the units that care.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::center::Center;
use crate::comms::{ApplicationCommand, Terminated, Update};
use crate::manager::TargetCommand;

/// The units notified about commits and safe-mode transitions.
const NOTIFIED_UNITS: [&str; 2] = ["IM", "SL"];

pub struct CentralCommand {
    pub center: Arc<Center>,
}

impl CentralCommand {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<TargetCommand>,
        mut update_rx: mpsc::UnboundedReceiver<Update>,
    ) -> Result<(), Terminated> {
        loop {
            tokio::select! {
                // Disable tokio::select!() random branch selection.
                biased;

                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(TargetCommand::Terminate) => {
                            return Err(Terminated);
                        }
                    }
                }

                Some(update) = update_rx.recv() => {
                    self.direct_update(update);
                }
            }
        }
    }

    fn direct_update(&self, update: Update) {
        debug!("[CC]: Update received: {update:?}");
        match update {
            Update::Event(event) => {
                // Nobody subscribed is fine; events are best-effort.
                let _ = self.center.events.send(event);
            }

            Update::GenerationCommitted {
                generation,
                graph,
                changes,
            } => {
                let command = ApplicationCommand::GenerationCommitted {
                    generation,
                    graph,
                    changes,
                };
                for unit in NOTIFIED_UNITS {
                    let _ = self
                        .center
                        .app_cmd_tx
                        .send((unit.into(), command.clone()));
                }
            }

            Update::SafeModeChanged { active } => {
                for unit in NOTIFIED_UNITS {
                    let _ = self
                        .center
                        .app_cmd_tx
                        .send((unit.into(), ApplicationCommand::SafeModeChanged { active }));
                }
            }
        }
    }
}

impl std::fmt::Debug for CentralCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralCommand").finish()
    }
}
