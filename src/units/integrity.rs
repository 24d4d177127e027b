//! The ruleset integrity monitor.
//!
//! After every commit the monitor captures a stateless listing of the live
//! table as its reference.  On each tick it lists again and compares:
//! counter values are invisible in a stateless listing, so a difference
//! means rules, chains or set declarations were mutated by someone other
//! than this process.  Authoritative mutations are repaired by re-applying
//! the live generation (no recompile) and reported to subscribers; repeated
//! repair failures escalate to safe mode.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use zonewall_api::Event;

use crate::apply::ApplyRequest;
use crate::center::Center;
use crate::comms::ApplicationCommand;
use crate::nft::RulesetBackend;

/// How often the live table is compared against the reference.
const TICK: Duration = Duration::from_secs(10);

/// Repair failures within this window escalate to safe mode.
const FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// How many failed repairs the window tolerates.
const FAILURE_THRESHOLD: usize = 3;

//----------- IntegrityMonitor -------------------------------------------------

/// The integrity monitor unit.
pub struct IntegrityMonitor<B> {
    pub center: Arc<Center>,
    pub backend: Arc<B>,
}

impl<B: RulesetBackend> IntegrityMonitor<B> {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ApplicationCommand>,
        ready_tx: oneshot::Sender<()>,
    ) {
        let _ = ready_tx.send(());

        let mut reference: Option<String> = None;
        let mut failures: Vec<Instant> = Vec::new();
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        ApplicationCommand::Terminate => break,
                        ApplicationCommand::RearmIntegrity
                        | ApplicationCommand::GenerationCommitted { .. }
                        | ApplicationCommand::SafeModeChanged { .. } => {
                            reference = self.capture().await;
                        }
                    }
                }

                _ = tick.tick() => {
                    if !self.center.config.daemon.test_mode {
                        self.check(&mut reference, &mut failures).await;
                    }
                }
            }
        }
    }

    /// Capture the current stateless listing as the reference.
    pub(crate) async fn capture(&self) -> Option<String> {
        match self.backend.list_table(true).await {
            Ok(listing) => {
                debug!("Captured a {} byte ruleset reference", listing.len());
                Some(listing)
            }
            Err(err) => {
                warn!("Could not capture the ruleset reference: {err}");
                None
            }
        }
    }

    /// One comparison pass.
    pub(crate) async fn check(
        &self,
        reference: &mut Option<String>,
        failures: &mut Vec<Instant>,
    ) {
        let Some(expected) = reference.as_ref() else {
            return;
        };

        let current = match self.backend.list_table(true).await {
            Ok(listing) => listing,
            // A vanished table is the strongest form of tampering.
            Err(_) => String::new(),
        };

        if current == *expected {
            return;
        }

        let summary = first_difference(expected, &current);
        warn!("External ruleset mutation detected: {summary}");

        {
            let mut state = self.center.state.lock().unwrap();
            state.tamper_count += 1;
            state.mark_dirty(&self.center);
        }
        self.center.metrics.tamper_events.inc();
        self.center.notify(Event::Tampering {
            // The poll-based watcher cannot attribute the change; the
            // kernel does not retain the mutating process.
            actor: "unknown".into(),
            summary: summary.clone(),
        });

        // Restore the authoritative state through the applier, serialized
        // with any operator applies.
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .center
            .apply_tx
            .send(ApplyRequest::Reapply { reply: reply_tx });

        match reply_rx.await {
            Ok(Ok(())) => {
                info!("Restored the authoritative ruleset");
                *reference = self.capture().await;
            }
            other => {
                error!("Could not restore the authoritative ruleset: {other:?}");
                let now = Instant::now();
                failures.push(now);
                failures.retain(|at| now.duration_since(*at) <= FAILURE_WINDOW);
                if failures.len() >= FAILURE_THRESHOLD {
                    error!(
                        "{} restore failures within {:?}; engaging safe mode",
                        failures.len(),
                        FAILURE_WINDOW
                    );
                    failures.clear();
                    let _ = self.center.apply_tx.send(ApplyRequest::EnterSafeMode {
                        reason: "repeated integrity restore failures".into(),
                    });
                }
            }
        }
    }
}

/// A terse description of the first differing line.
fn first_difference(expected: &str, current: &str) -> String {
    let mut expected_lines = expected.lines();
    let mut current_lines = current.lines();
    loop {
        match (expected_lines.next(), current_lines.next()) {
            (Some(a), Some(b)) if a == b => continue,
            (Some(a), Some(b)) => {
                return format!("'{}' became '{}'", a.trim(), b.trim());
            }
            (Some(a), None) => return format!("'{}' was removed", a.trim()),
            (None, Some(b)) => return format!("'{}' was added", b.trim()),
            (None, None) => return "listing order changed".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    const DOCUMENT: &str = r#"
[[zone]]
name = "wan"

[[zone]]
name = "lan"
management = { api = true }

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
"#;

    #[tokio::test]
    async fn tampering_is_detected_and_restored() {
        let (center, backend, mut rig) = test_support::applier_rig().await;
        rig.apply(DOCUMENT).await.unwrap();

        let monitor = IntegrityMonitor {
            center: center.clone(),
            backend: backend.clone(),
        };
        let mut reference = monitor.capture().await;
        let mut failures = Vec::new();

        // Nothing happens while the kernel matches the reference.
        monitor.check(&mut reference, &mut failures).await;
        assert_eq!(center.state.lock().unwrap().tamper_count, 0);

        // Someone inserts a telnet accept behind our back.
        let mut tampered = backend.table().unwrap();
        tampered.push_str("\n# telnet accept inserted by hand\n");
        backend.tamper(&tampered);

        monitor.check(&mut reference, &mut failures).await;
        rig.drain().await;

        // The authoritative text is back and the event was counted.
        assert!(!backend.table().unwrap().contains("telnet"));
        assert_eq!(center.state.lock().unwrap().tamper_count, 1);
        let tampering_events = rig
            .events()
            .await
            .into_iter()
            .filter(|event| matches!(event, Event::Tampering { .. }))
            .count();
        assert_eq!(tampering_events, 1);
    }

    #[tokio::test]
    async fn counter_only_changes_are_benign() {
        let (center, backend, mut rig) = test_support::applier_rig().await;
        rig.apply(DOCUMENT).await.unwrap();

        let monitor = IntegrityMonitor {
            center: center.clone(),
            backend: backend.clone(),
        };
        let mut reference = monitor.capture().await;
        let mut failures = Vec::new();

        // The mock's stateless listing is the table text itself; unchanged
        // text means only counters could have moved, and no event fires.
        monitor.check(&mut reference, &mut failures).await;
        assert_eq!(center.state.lock().unwrap().tamper_count, 0);
        assert!(!rig
            .events()
            .await
            .into_iter()
            .any(|event| matches!(event, Event::Tampering { .. })));
    }

    #[tokio::test]
    async fn repeated_restore_failures_escalate_to_safe_mode() {
        let (center, backend, mut rig) = test_support::applier_rig().await;
        rig.apply(DOCUMENT).await.unwrap();

        let monitor = IntegrityMonitor {
            center: center.clone(),
            backend: backend.clone(),
        };
        let mut reference = monitor.capture().await;
        let mut failures = Vec::new();

        for _ in 0..FAILURE_THRESHOLD {
            backend.tamper("table inet zonewall { }\n");
            backend.state.lock().unwrap().fail_next_load = Some("I/O error".into());
            monitor.check(&mut reference, &mut failures).await;
        }
        rig.drain().await;

        assert!(center.state.lock().unwrap().safe_mode.is_some());
    }
}
