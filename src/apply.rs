//! The serialized atomic applier.
//!
//! Every mutation of the kernel ruleset flows through one task processing
//! one [`ApplyRequest`] at a time.  The single-writer discipline is what
//! makes the atomicity reasoning local: between two applies, the second
//! observes the first's effects, and nothing else ever writes.
//!
//! An apply is a transaction:
//!
//! 1. parse, validate and compile the candidate document;
//! 2. check lockout against the requesting client's management path;
//! 3. stage the artifacts on disk and check the program against the kernel
//!    (disk or check failures leave the live ruleset untouched);
//! 4. have the set manager snapshot runtime sets that survive the reload;
//! 5. reconcile interfaces and routes (snapshotting the pre-image);
//! 6. swap the ruleset in one kernel transaction;
//! 7. restore carried set contents, publish the new generation, retain the
//!    prior one as the rollback target, fan out notifications.
//!
//! A safe apply additionally arms a rollback deadline; unless the client
//! confirms in time, the prior generation comes back.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use zonewall_api::{ApiError, Event, OpResult};
use zonewall_ruleset::{compile, Capabilities, ChangeSet, CompiledRuleset, Graph};

use crate::center::{ApplyScope, Center, Generation, PendingApply};
use crate::comms::{Reply, Update};
use crate::nft::{replace_program, RulesetBackend};
use crate::state::generations;
use crate::units::netconf::NetConfCommand;
use crate::units::setmgr::SetMgrCommand;

//----------- ApplyRequest -----------------------------------------------------

/// Who is asking for an apply, for lockout judgement.
#[derive(Clone, Debug, Default)]
pub struct ClientInfo {
    /// The authenticated principal.
    pub principal: String,

    /// The network address the client reached the router from, if it came
    /// through the API plane.  Local socket clients have none and cannot
    /// lock themselves out.
    pub addr: Option<std::net::IpAddr>,
}

/// One unit of work for the applier.
#[derive(Debug)]
pub enum ApplyRequest {
    /// Validate, compile and commit a document.
    Apply {
        document: String,
        override_lockout: bool,
        client: ClientInfo,
        reply: Reply,
    },

    /// As [`Self::Apply`], armed with a rollback deadline.
    SafeApply {
        document: String,
        rollback_secs: u64,
        override_lockout: bool,
        client: ClientInfo,
        reply: Reply,
    },

    /// Confirm the pending apply.
    Confirm { reply: Reply },

    /// The pending apply's deadline fired.
    ExpirePending { generation: u64 },

    /// Re-apply the live generation without recompiling (integrity
    /// restore).
    Reapply {
        reply: oneshot::Sender<Result<(), ApiError>>,
    },

    /// Re-apply a retained generation.
    RestoreBackup {
        id: u64,
        client: ClientInfo,
        reply: Reply,
    },

    /// Reduce the ruleset to the minimal admin-only generation.
    EnterSafeMode { reason: String },

    /// Leave safe mode by re-applying the live generation.
    ClearSafeMode { reply: Reply },

    /// Shut the applier down.
    Terminate,
}

//----------- Applier ----------------------------------------------------------

/// The serialized applier task.
pub struct Applier<B> {
    pub center: Arc<Center>,

    /// The kernel writer.
    pub backend: Arc<B>,

    /// What the kernel supports, probed once at start.
    pub caps: Capabilities,

    /// The set manager, for smart flush.  Absent in ruleset-only tests.
    pub setmgr_tx: Option<mpsc::UnboundedSender<SetMgrCommand>>,

    /// The interface/route reconciler.  Absent in ruleset-only tests.
    pub netconf_tx: Option<mpsc::UnboundedSender<NetConfCommand>>,
}

/// How often a transient kernel-interface error is retried.
///
/// Only errors that look transient (the netlink socket was busy) are
/// retried, and only here: every other failure propagates immediately.
const LOAD_ATTEMPTS: usize = 3;

impl<B: RulesetBackend> Applier<B> {
    /// Process requests until termination.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ApplyRequest>) {
        while let Some(request) = rx.recv().await {
            match request {
                ApplyRequest::Apply {
                    document,
                    override_lockout,
                    client,
                    reply,
                } => {
                    let result = self
                        .apply(&document, override_lockout, &client, None)
                        .await;
                    let _ = reply.send(result);
                }
                ApplyRequest::SafeApply {
                    document,
                    rollback_secs,
                    override_lockout,
                    client,
                    reply,
                } => {
                    let result = self
                        .apply(&document, override_lockout, &client, Some(rollback_secs))
                        .await;
                    let _ = reply.send(result);
                }
                ApplyRequest::Confirm { reply } => {
                    let _ = reply.send(self.confirm());
                }
                ApplyRequest::ExpirePending { generation } => {
                    self.expire_pending(generation).await;
                }
                ApplyRequest::Reapply { reply } => {
                    let _ = reply.send(self.reapply().await);
                }
                ApplyRequest::RestoreBackup { id, client, reply } => {
                    let result = self.restore_backup(id, &client).await;
                    let _ = reply.send(result);
                }
                ApplyRequest::EnterSafeMode { reason } => {
                    self.enter_safe_mode(reason).await;
                }
                ApplyRequest::ClearSafeMode { reply } => {
                    let _ = reply.send(self.clear_safe_mode().await);
                }
                ApplyRequest::Terminate => break,
            }
        }
    }

    /// Apply a recovered generation at startup.
    ///
    /// The last-committed generation's artifacts are reloaded from disk and
    /// pushed into the kernel, so a crash between applier stages leaves no
    /// lasting mix of generations.
    pub async fn recover(&mut self) -> Result<(), String> {
        let live_id = self.center.state.lock().unwrap().live_id;
        let Some(id) = live_id else {
            info!("No committed generation to recover");
            return Ok(());
        };

        let (source, compiled) = generations::load(&self.center.config, id)
            .map_err(|err| format!("could not load generation {id}: {err}"))?;

        // Rebuild the graph from the stored document; compilation is
        // deterministic, so this must reproduce the stored fingerprint.
        let spec = crate::doc::parse(&source).map_err(|err| err.to_string())?;
        let validated = crate::validate::validate(&spec, false).map_err(|err| err.to_string())?;
        let rebuilt = compile(&validated.graph, &self.caps).map_err(|err| err.to_string())?;
        if rebuilt.fingerprint != compiled.fingerprint {
            warn!(
                "Generation {id} was compiled by a different build; applying the stored artifact"
            );
        }

        self.backend
            .load(&replace_program(&compiled))
            .await
            .map_err(|err| format!("could not re-apply generation {id}: {err}"))?;

        let generation = Arc::new(Generation {
            id,
            source,
            graph: Arc::new(validated.graph),
            compiled: rebuilt,
        });
        self.center.live.store(Some(generation));
        self.center.metrics.live_generation.set(id as i64);
        info!("Recovered committed generation {id}");
        Ok(())
    }

    //--- The transaction

    async fn apply(
        &mut self,
        document: &str,
        override_lockout: bool,
        client: &ClientInfo,
        rollback_secs: Option<u64>,
    ) -> Result<OpResult, ApiError> {
        self.check_conflict()?;

        // Parse, validate, compile: pure, nothing touched yet.
        let spec = crate::doc::parse(document)?;
        let validated = crate::validate::validate(&spec, false)?;
        for warning in &validated.warnings {
            warn!("Validation: {warning}");
        }
        let graph = Arc::new(validated.graph);
        let compiled = compile(&graph, &self.caps).map_err(map_compile_error)?;

        let live = self.center.live.load_full();
        let prev_graph = live
            .as_ref()
            .map(|generation| generation.graph.clone())
            .unwrap_or_default();
        let changes = Graph::diff(&prev_graph, &graph);

        if !override_lockout {
            check_lockout(client, &prev_graph, &graph)?;
        }

        let scope = if changes.interfaces || changes.routes {
            ApplyScope::Network
        } else {
            ApplyScope::RulesetOnly
        };

        // Allocate the generation id and stage the artifacts.
        let id = {
            let mut state = self.center.state.lock().unwrap();
            let id = state.next_generation_id;
            state.next_generation_id += 1;
            id
        };
        let generation = Arc::new(Generation {
            id,
            source: document.to_string(),
            graph: graph.clone(),
            compiled: compiled.clone(),
        });

        generations::save(&self.center.config, &generation).map_err(|err| {
            ApiError::Internal {
                reason: format!("could not stage generation {id}: {err}"),
            }
        })?;

        let program = replace_program(&compiled);
        self.backend
            .check(&program)
            .await
            .map_err(|err| ApiError::Apply {
                kernel_reason: err.message,
            })?;

        // Smart flush: snapshot runtime sets that survive this reload.
        self.setmgr_prepare(&compiled, &changes).await?;

        // Reconcile the network before the ruleset references it.
        if scope == ApplyScope::Network {
            if let Err(err) = self.netconf_reconcile(&graph).await {
                self.netconf_restore().await;
                self.setmgr_abort().await;
                return Err(err);
            }
        }

        // The swap: one kernel transaction.
        if let Err(err) = self.load_with_retry(&program).await {
            if scope == ApplyScope::Network {
                self.netconf_restore().await;
            }
            self.setmgr_abort().await;
            self.center.metrics.rollbacks.inc();
            return Err(ApiError::Apply {
                kernel_reason: err.message,
            });
        }

        // Post-image: carried set contents, publication, retention.
        self.setmgr_restore().await;
        self.publish(generation.clone(), &changes);

        let result = match rollback_secs {
            None => {
                info!("Committed generation {id}");
                OpResult::Applied {
                    generation: id,
                    fingerprint: compiled.fingerprint,
                }
            }
            Some(secs) => {
                self.arm_pending(id, scope, secs);
                info!("Generation {id} is live, awaiting confirmation within {secs}s");
                OpResult::Pending {
                    generation: id,
                    fingerprint: compiled.fingerprint,
                    rollback_secs: secs,
                }
            }
        };
        Ok(result)
    }

    /// Load a program, retrying transient kernel-interface errors.
    async fn load_with_retry(&self, program: &str) -> Result<(), crate::nft::BackendError> {
        let mut attempt = 1;
        loop {
            match self.backend.load(program).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < LOAD_ATTEMPTS && is_transient(&err) => {
                    warn!("Transient kernel error (attempt {attempt}): {err}");
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn check_conflict(&self) -> Result<(), ApiError> {
        let state = self.center.state.lock().unwrap();
        if let Some(pending) = &state.pending {
            return Err(ApiError::Conflict {
                reason: format!(
                    "generation {} awaits confirmation or rollback",
                    pending.generation
                ),
            });
        }
        Ok(())
    }

    /// Publish a committed generation and retain the pre-image.
    fn publish(&self, generation: Arc<Generation>, changes: &ChangeSet) {
        let prior = self.center.live.swap(Some(generation.clone()));

        {
            let mut state = self.center.state.lock().unwrap();
            state.live_id = Some(generation.id);
            state.prior = prior;

            // Keep live, prior and every backup; discard other artifacts.
            let mut keep: Vec<u64> = state.backups.iter().map(|record| record.id).collect();
            keep.push(generation.id);
            keep.extend(state.prior.as_ref().map(|p| p.id));
            generations::prune(&self.center.config, &keep);
        }
        crate::state::save_now(&self.center);

        self.center.metrics.applies.inc();
        self.center
            .metrics
            .live_generation
            .set(generation.id as i64);

        let _ = self.center.update_tx.send(Update::GenerationCommitted {
            generation: generation.id,
            graph: generation.graph.clone(),
            changes: changes.clone(),
        });
        self.center.notify(Event::Applied {
            generation: generation.id,
            fingerprint: generation.compiled.fingerprint,
        });
    }

    //--- Pending applies

    fn arm_pending(&self, generation: u64, kind: ApplyScope, secs: u64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
        {
            let mut state = self.center.state.lock().unwrap();
            state.pending = Some(PendingApply {
                generation,
                kind,
                deadline,
            });
        }

        let apply_tx = self.center.apply_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // The applier ignores this if the pending apply was confirmed
            // or superseded in the meantime.
            let _ = apply_tx.send(ApplyRequest::ExpirePending { generation });
        });
    }

    fn confirm(&self) -> Result<OpResult, ApiError> {
        let mut state = self.center.state.lock().unwrap();
        match state.pending.take() {
            Some(pending) => {
                drop(state);
                crate::state::save_now(&self.center);
                info!("Generation {} confirmed", pending.generation);
                self.center.notify(Event::Confirmed {
                    generation: pending.generation,
                });
                Ok(OpResult::Confirmed {
                    generation: pending.generation,
                })
            }
            None => Err(ApiError::Conflict {
                reason: "no apply is pending confirmation".into(),
            }),
        }
    }

    async fn expire_pending(&mut self, generation: u64) {
        let pending = {
            let mut state = self.center.state.lock().unwrap();
            if state
                .pending
                .as_ref()
                .is_none_or(|pending| pending.generation != generation)
            {
                // Confirmed or superseded; the timer is stale.
                return;
            }
            state.pending.take()
        };
        let Some(pending) = pending else { return };

        warn!("Generation {generation} was not confirmed in time, rolling back");
        match self.rollback_to_prior(pending.kind).await {
            Ok(()) => {
                self.center.notify(Event::RolledBack {
                    generation,
                    reason: "the confirmation deadline passed".into(),
                });
            }
            Err(err) => {
                error!("Rollback of generation {generation} failed: {err}");
            }
        }
    }

    /// Replace the live generation with the retained prior.
    async fn rollback_to_prior(&mut self, scope: ApplyScope) -> Result<(), String> {
        let prior = {
            let state = self.center.state.lock().unwrap();
            state.prior.clone()
        };
        let Some(prior) = prior else {
            return Err("no rollback target is retained".into());
        };

        // Runtime set contents survive a rollback like any other swap.
        let changes = {
            let live = self.center.live.load_full();
            let live_graph = live
                .as_ref()
                .map(|generation| generation.graph.clone())
                .unwrap_or_default();
            Graph::diff(&live_graph, &prior.graph)
        };
        let _ = self.setmgr_prepare(&prior.compiled, &changes).await;

        if scope == ApplyScope::Network {
            self.netconf_restore().await;
        }

        if let Err(err) = self.load_with_retry(&replace_program(&prior.compiled)).await {
            self.setmgr_abort().await;
            return Err(err.message);
        }

        self.setmgr_restore().await;
        self.center.metrics.rollbacks.inc();

        let id = prior.id;
        self.center.live.store(Some(prior));
        {
            let mut state = self.center.state.lock().unwrap();
            state.live_id = Some(id);
            state.prior = None;
        }
        crate::state::save_now(&self.center);
        self.center.metrics.live_generation.set(id as i64);
        info!("Rolled back to generation {id}");
        Ok(())
    }

    //--- Integrity restore and safe mode

    async fn reapply(&mut self) -> Result<(), ApiError> {
        let Some(live) = self.center.live.load_full() else {
            return Err(ApiError::Conflict {
                reason: "nothing has been applied yet".into(),
            });
        };

        // No recompile: the retained artifact is authoritative.
        self.load_with_retry(&replace_program(&live.compiled))
            .await
            .map_err(|err| ApiError::Apply {
                kernel_reason: err.message,
            })?;

        // External flushes may have emptied runtime sets; put the set
        // manager's authoritative contents back.
        self.setmgr_restore_all().await;
        Ok(())
    }

    async fn enter_safe_mode(&mut self, reason: String) {
        let admin_interfaces: Vec<String> = {
            let live = self.center.live.load_full();
            live.as_ref()
                .map(|generation| {
                    generation
                        .graph
                        .zones
                        .values()
                        .filter(|zone| zone.management.api || zone.management.ssh)
                        .flat_map(|zone| {
                            generation
                                .graph
                                .zone_members(&zone.name)
                                .map(|iface| iface.name.clone())
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let compiled = zonewall_ruleset::compile::compile_safe_mode(&admin_interfaces);
        if let Err(err) = self.backend.load(&replace_program(&compiled)).await {
            error!("Could not install the safe mode ruleset: {err}");
            return;
        }

        {
            let mut state = self.center.state.lock().unwrap();
            state.safe_mode = Some(reason.clone());
            state.pending = None;
        }
        crate::state::save_now(&self.center);
        self.center.metrics.safe_mode.set(1);
        let _ = self
            .center
            .update_tx
            .send(Update::SafeModeChanged { active: true });
        self.center.notify(Event::SafeModeEntered { reason });
        warn!("Safe mode engaged: only management traffic is admitted");
    }

    async fn clear_safe_mode(&mut self) -> Result<OpResult, ApiError> {
        {
            let state = self.center.state.lock().unwrap();
            if state.safe_mode.is_none() {
                return Err(ApiError::Conflict {
                    reason: "the daemon is not in safe mode".into(),
                });
            }
        }

        self.reapply().await?;

        {
            let mut state = self.center.state.lock().unwrap();
            state.safe_mode = None;
        }
        crate::state::save_now(&self.center);
        self.center.metrics.safe_mode.set(0);
        let _ = self
            .center
            .update_tx
            .send(Update::SafeModeChanged { active: false });
        self.center.notify(Event::SafeModeCleared);
        info!("Safe mode cleared");
        Ok(OpResult::Done)
    }

    //--- Backups

    async fn restore_backup(
        &mut self,
        id: u64,
        client: &ClientInfo,
    ) -> Result<OpResult, ApiError> {
        self.check_conflict()?;

        let known = {
            let state = self.center.state.lock().unwrap();
            state.backups.iter().any(|record| record.id == id)
        };
        if !known || !generations::exists(&self.center.config, id) {
            return Err(ApiError::Conflict {
                reason: format!("no backup with id {id} is retained"),
            });
        }

        let (source, _) = generations::load(&self.center.config, id).map_err(|err| {
            ApiError::Internal {
                reason: format!("could not load backup {id}: {err}"),
            }
        })?;

        // Restoring is an ordinary apply of the retained document, which
        // revalidates it against the current kernel and daemon version.
        self.apply(&source, false, client, None).await
    }

    //--- Collaborator calls

    async fn setmgr_prepare(
        &self,
        compiled: &CompiledRuleset,
        changes: &ChangeSet,
    ) -> Result<(), ApiError> {
        let Some(tx) = &self.setmgr_tx else {
            return Ok(());
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = tx.send(SetMgrCommand::PrepareReload {
            manifests: compiled.sets.clone(),
            changes: changes.sets.clone(),
            reply: reply_tx,
        });
        reply_rx.await.map_err(|_| ApiError::Internal {
            reason: "the set manager went away".into(),
        })
    }

    async fn setmgr_restore(&self) {
        let Some(tx) = &self.setmgr_tx else { return };
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = tx.send(SetMgrCommand::RestoreCarried { reply: reply_tx });
        if let Ok(Err(err)) = reply_rx.await {
            warn!("Could not restore carried set contents: {err}");
        }
    }

    async fn setmgr_abort(&self) {
        let Some(tx) = &self.setmgr_tx else { return };
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = tx.send(SetMgrCommand::AbortReload { reply: reply_tx });
        let _ = reply_rx.await;
    }

    async fn setmgr_restore_all(&self) {
        let Some(tx) = &self.setmgr_tx else { return };
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = tx.send(SetMgrCommand::RestoreAll { reply: reply_tx });
        let _ = reply_rx.await;
    }

    async fn netconf_reconcile(&self, graph: &Arc<Graph>) -> Result<(), ApiError> {
        let Some(tx) = &self.netconf_tx else {
            return Ok(());
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = tx.send(NetConfCommand::Reconcile {
            graph: graph.clone(),
            reply: reply_tx,
        });
        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ApiError::Apply { kernel_reason: err }),
            Err(_) => Err(ApiError::Internal {
                reason: "the network reconciler went away".into(),
            }),
        }
    }

    async fn netconf_restore(&self) {
        let Some(tx) = &self.netconf_tx else { return };
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = tx.send(NetConfCommand::RestoreSnapshot { reply: reply_tx });
        if let Ok(Err(err)) = reply_rx.await {
            error!("Could not restore the network snapshot: {err}");
        }
    }
}

/// Whether a kernel-interface error is worth retrying.
fn is_transient(err: &crate::nft::BackendError) -> bool {
    let message = err.message.to_ascii_lowercase();
    message.contains("temporarily unavailable")
        || message.contains("resource busy")
        || message.contains("device or resource busy")
        || message.contains("interrupted")
}

fn map_compile_error(err: zonewall_ruleset::CompileError) -> ApiError {
    match err {
        zonewall_ruleset::CompileError::Capability(feature) => ApiError::Capability {
            feature: feature.to_string(),
        },
        other => ApiError::Internal {
            reason: format!("the validator let an invalid graph through: {other}"),
        },
    }
}

//----------- Lockout protection -----------------------------------------------

/// Refuse an apply that would sever the requesting client's management
/// path.
///
/// The capability edge in question: the zone the client's address lives in
/// must keep its API management flag.  A client whose address cannot be
/// attributed to a zone (local socket, or an address outside every managed
/// subnet) cannot be locked out this way.
fn check_lockout(client: &ClientInfo, live: &Graph, next: &Graph) -> Result<(), ApiError> {
    let Some(addr) = client.addr else {
        return Ok(());
    };

    let Some(zone) = zone_of(live, addr) else {
        return Ok(());
    };

    let had_api = live
        .zones
        .get(&zone)
        .is_some_and(|z| z.management.api || z.management.web_ui);
    if !had_api {
        // The client is reaching us some other way; nothing to sever.
        return Ok(());
    }

    let keeps_api = next
        .zones
        .get(&zone)
        .is_some_and(|z| z.management.api || z.management.web_ui)
        && zone_of(next, addr).as_deref() == Some(zone.as_str());

    if keeps_api {
        Ok(())
    } else {
        Err(ApiError::Lockout {
            path: format!("zone '{zone}' management from {addr}"),
        })
    }
}

/// The zone whose interface subnets contain the address.
fn zone_of(graph: &Graph, addr: std::net::IpAddr) -> Option<String> {
    use zonewall_ruleset::model::Addressing;

    for iface in graph.interfaces.values() {
        let Addressing::Static { addrs } = &iface.addressing else {
            continue;
        };
        if addrs.iter().any(|net| net.contains(&addr)) {
            return iface.zone.clone();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nft::mock::MockBackend;
    use crate::test_support::{self, recv_result};
    use zonewall_api::msg::OpResult;

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

    /// A home-router document with the LAN's API access removed.
    const LOCKED_OUT: &str = r#"
[[zone]]
name = "wan"

[[zone]]
name = "lan"
management = { ssh = true, ping = true }

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
    async fn apply_commits_and_retains_the_prior() {
        let (center, backend, mut rig) = test_support::applier_rig().await;

        let result = rig.apply(HOME_ROUTER).await.unwrap();
        let OpResult::Applied { generation, .. } = result else {
            panic!("expected Applied, got {result:?}");
        };
        assert_eq!(generation, 0);
        assert!(backend.table().unwrap().contains("chain pol_lan_wan"));

        // A second apply retains the first as the rollback target.
        let text = HOME_ROUTER.replace("default = \"accept\"", "default = \"reject\"");
        rig.apply(&text).await.unwrap();
        let state = center.state.lock().unwrap();
        assert_eq!(state.live_id, Some(1));
        assert_eq!(state.prior.as_ref().map(|p| p.id), Some(0));
    }

    #[tokio::test]
    async fn kernel_rejection_rolls_back_automatically() {
        let (center, backend, mut rig) = test_support::applier_rig().await;
        rig.apply(HOME_ROUTER).await.unwrap();
        let before = backend.table().unwrap();

        backend.state.lock().unwrap().fail_next_load = Some("Operation not supported".into());
        let err = rig
            .apply(&HOME_ROUTER.replace("accept", "reject"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::Apply { kernel_reason } if kernel_reason.contains("not supported")
        ));

        // The pre-image is exactly what is live.
        assert_eq!(backend.table().unwrap(), before);
        assert_eq!(center.state.lock().unwrap().live_id, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_safe_apply_rolls_back_at_the_deadline() {
        let (center, backend, mut rig) = test_support::applier_rig().await;
        rig.apply(HOME_ROUTER).await.unwrap();
        let before = backend.table().unwrap();

        let text = HOME_ROUTER.replace("192.168.1.1/24", "10.99.0.1/24");
        let result = rig.safe_apply(&text, 10).await.unwrap();
        assert!(matches!(result, OpResult::Pending { rollback_secs: 10, .. }));
        assert_ne!(backend.table().unwrap(), before);

        // Nobody confirms; the deadline fires.
        tokio::time::sleep(Duration::from_secs(11)).await;
        rig.drain().await;

        assert_eq!(backend.table().unwrap(), before);
        let state = center.state.lock().unwrap();
        assert_eq!(state.live_id, Some(0));
        assert!(state.pending.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_cancels_the_rollback() {
        let (center, backend, mut rig) = test_support::applier_rig().await;
        rig.apply(HOME_ROUTER).await.unwrap();

        let text = HOME_ROUTER.replace("accept", "reject");
        rig.safe_apply(&text, 10).await.unwrap();
        let confirmed = rig.confirm().await.unwrap();
        assert!(matches!(confirmed, OpResult::Confirmed { generation: 1 }));

        let after = backend.table().unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        rig.drain().await;

        // The stale timer is ignored.
        assert_eq!(backend.table().unwrap(), after);
        assert_eq!(center.state.lock().unwrap().live_id, Some(1));
    }

    #[tokio::test]
    async fn a_pending_apply_conflicts_with_new_applies() {
        let (_center, _backend, mut rig) = test_support::applier_rig().await;
        rig.apply(HOME_ROUTER).await.unwrap();
        rig.safe_apply(&HOME_ROUTER.replace("accept", "reject"), 600)
            .await
            .unwrap();

        let err = rig.apply(HOME_ROUTER).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict { .. }));
    }

    #[tokio::test]
    async fn lockout_needs_an_explicit_override() {
        let (_center, _backend, mut rig) = test_support::applier_rig().await;
        rig.apply(HOME_ROUTER).await.unwrap();

        // A client on the LAN tries to drop the LAN's API access.
        let client = ClientInfo {
            principal: "web-ui".into(),
            addr: Some("192.168.1.50".parse().unwrap()),
        };
        let err = rig
            .apply_as(LOCKED_OUT, client.clone(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Lockout { .. }));

        // With the override it goes through.
        rig.apply_as(LOCKED_OUT, client, true).await.unwrap();
    }

    #[tokio::test]
    async fn parse_and_validate_failures_touch_nothing() {
        let (center, backend, mut rig) = test_support::applier_rig().await;
        rig.apply(HOME_ROUTER).await.unwrap();
        let before = backend.table().unwrap();

        assert!(matches!(
            rig.apply("[[zone]\n").await.unwrap_err(),
            ApiError::Parse { .. }
        ));
        assert!(matches!(
            rig.apply("[[interface]]\nname = \"x\"\nzone = \"nope\"\n")
                .await
                .unwrap_err(),
            ApiError::Validate { .. }
        ));

        assert_eq!(backend.table().unwrap(), before);
        assert_eq!(center.state.lock().unwrap().live_id, Some(0));
    }

    #[tokio::test]
    async fn reapply_restores_without_recompiling() {
        let (_center, backend, mut rig) = test_support::applier_rig().await;
        rig.apply(HOME_ROUTER).await.unwrap();
        let committed = backend.table().unwrap();

        backend.tamper("table inet zonewall {\n    chain input { accept }\n}\n");
        rig.reapply().await.unwrap();
        assert_eq!(backend.table().unwrap(), committed);
    }

    #[tokio::test]
    async fn safe_mode_swaps_in_the_admin_only_ruleset() {
        let (center, backend, mut rig) = test_support::applier_rig().await;
        rig.apply(HOME_ROUTER).await.unwrap();

        rig.enter_safe_mode("three crashes in the window").await;
        let table = backend.table().unwrap();
        assert!(table.contains("iifname \"eth1\" tcp dport { 22, 8443 } accept"));
        assert!(!table.contains("pol_lan_wan"));
        assert!(center.state.lock().unwrap().safe_mode.is_some());

        // Clearing re-applies the live generation.
        rig.clear_safe_mode().await.unwrap();
        assert!(backend.table().unwrap().contains("pol_lan_wan"));
        assert!(center.state.lock().unwrap().safe_mode.is_none());
    }

    #[tokio::test]
    async fn restore_rejects_unknown_backups() {
        let (_center, _backend, mut rig) = test_support::applier_rig().await;
        rig.apply(HOME_ROUTER).await.unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        rig.tx
            .send(ApplyRequest::RestoreBackup {
                id: 42,
                client: ClientInfo::default(),
                reply: reply_tx,
            })
            .unwrap();
        assert!(matches!(
            recv_result(reply_rx).await.unwrap_err(),
            ApiError::Conflict { .. }
        ));
    }
}
