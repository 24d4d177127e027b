//! Controlling the entire operation.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use zonewall_ruleset::Capabilities;

use crate::apply::{ApplyRequest, Applier};
use crate::center::Center;
use crate::comms::{ApplicationCommand, Terminated, Update};
use crate::nft::RulesetBackend;
use crate::supervisor::{Supervisor, SupervisorCommand};
use crate::targets::central_command::CentralCommand;
use crate::units::control::ControlServer;
use crate::units::integrity::IntegrityMonitor;
use crate::units::netconf::{NetConf, NetConfCommand};
use crate::units::setmgr::{SetManager, SetMgrCommand};
use crate::units::svc::{ServiceAdapter, ServiceManager};

pub enum TargetCommand {
    Terminate,
}

impl Display for TargetCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetCommand::Terminate => f.write_str("Terminate"),
        }
    }
}

/// The channels the main loop keeps after spawning.
pub struct UnitHandles {
    /// The central command.
    pub center_tx: mpsc::UnboundedSender<TargetCommand>,

    /// Units addressed by name for application commands.
    pub unit_txs: foldhash::HashMap<String, mpsc::UnboundedSender<ApplicationCommand>>,

    /// The set manager.
    pub setmgr_tx: mpsc::UnboundedSender<SetMgrCommand>,

    /// The interface/route reconciler.
    pub netconf_tx: mpsc::UnboundedSender<NetConfCommand>,

    /// The supervisor.
    pub supervisor_tx: mpsc::UnboundedSender<SupervisorCommand>,
}

/// Spawn every unit and target.
///
/// Returns once all units report ready and the recovered generation (if
/// any) has been re-applied.
pub async fn spawn<B: RulesetBackend>(
    center: &Arc<Center>,
    backend: Arc<B>,
    update_rx: mpsc::UnboundedReceiver<Update>,
    apply_rx: mpsc::UnboundedReceiver<ApplyRequest>,
    listener: tokio::net::UnixListener,
    control_fd: OwnedFd,
    adapters: BTreeMap<String, Box<dyn ServiceAdapter>>,
) -> Result<UnitHandles, Terminated> {
    let mut unit_txs = foldhash::HashMap::default();

    // Spawn the central command.
    info!("Starting target 'CC'");
    let target = CentralCommand {
        center: center.clone(),
    };
    let (center_tx, center_rx) = mpsc::unbounded_channel();
    tokio::spawn(target.run(center_rx, update_rx));

    // Probe the kernel once; the result is part of every compilation.
    let caps = backend.probe().await;
    if caps != Capabilities::FULL {
        info!("Kernel capability probe: {caps:?}");
    }

    // Spawn the set manager.
    info!("Starting unit 'DS'");
    let (setmgr_tx, setmgr_rx) = mpsc::unbounded_channel();
    let unit = SetManager {
        center: center.clone(),
        backend: backend.clone(),
        cmd_tx: setmgr_tx.clone(),
    };
    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(unit.run(setmgr_rx, ready_tx));
    ready_rx.await.map_err(|_| Terminated)?;

    // Spawn the interface/route reconciler.
    info!("Starting unit 'NC'");
    let (netconf_tx, netconf_rx) = mpsc::unbounded_channel();
    let unit = NetConf {
        center: center.clone(),
    };
    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(unit.run(netconf_rx, ready_tx));
    ready_rx.await.map_err(|_| Terminated)?;

    // The applier: recover the last-committed generation, then serve.
    info!("Starting the applier");
    let mut applier = Applier {
        center: center.clone(),
        backend: backend.clone(),
        caps,
        setmgr_tx: Some(setmgr_tx.clone()),
        netconf_tx: Some(netconf_tx.clone()),
    };
    match applier.recover().await {
        Ok(()) => {
            if let Some(live) = center.live.load_full() {
                let _ = setmgr_tx.send(SetMgrCommand::Bootstrap {
                    manifests: live.compiled.sets.clone(),
                });
            }
        }
        Err(err) => {
            // A kernel that rejects the recovered generation is exactly the
            // failure safe mode exists for.
            error!("Could not recover the committed generation: {err}");
            let _ = center.apply_tx.send(ApplyRequest::EnterSafeMode {
                reason: format!("startup recovery failed: {err}"),
            });
        }
    }
    tokio::spawn(applier.run(apply_rx));

    // Spawn the integrity monitor.
    info!("Starting unit 'IM'");
    let unit = IntegrityMonitor {
        center: center.clone(),
        backend: backend.clone(),
    };
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(unit.run(cmd_rx, ready_tx));
    ready_rx.await.map_err(|_| Terminated)?;
    let _ = cmd_tx.send(ApplicationCommand::RearmIntegrity);
    unit_txs.insert("IM".into(), cmd_tx);

    // Spawn the service lifecycle manager.
    info!("Starting unit 'SL'");
    let unit = ServiceManager {
        center: center.clone(),
        adapters,
    };
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(unit.run(cmd_rx, ready_tx));
    ready_rx.await.map_err(|_| Terminated)?;
    unit_txs.insert("SL".into(), cmd_tx);

    // Spawn the supervisor.
    info!("Starting the supervisor");
    let (supervisor_tx, supervisor_rx) = mpsc::unbounded_channel();
    let unit = Supervisor {
        center: center.clone(),
        control_fd,
    };
    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(unit.run(supervisor_rx, ready_tx));
    ready_rx.await.map_err(|_| Terminated)?;

    // Spawn the control server last: nobody gets in before the daemon is
    // whole.
    info!("Starting unit 'CT'");
    let unit = ControlServer {
        center: center.clone(),
        backend,
        setmgr_tx: setmgr_tx.clone(),
        supervisor_tx: supervisor_tx.clone(),
    };
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(unit.run(listener, cmd_rx, ready_tx));
    ready_rx.await.map_err(|_| Terminated)?;
    unit_txs.insert("CT".into(), cmd_tx);

    info!("All units report ready.");

    Ok(UnitHandles {
        center_tx,
        unit_txs,
        setmgr_tx,
        netconf_tx,
        supervisor_tx,
    })
}

/// Forward application commands to the named units.
pub async fn forward_app_cmds(
    rx: &mut mpsc::UnboundedReceiver<(String, ApplicationCommand)>,
    unit_txs: &foldhash::HashMap<String, mpsc::UnboundedSender<ApplicationCommand>>,
) {
    while let Some((unit_name, data)) = rx.recv().await {
        if let Some(tx) = unit_txs.get(&*unit_name) {
            debug!("Forwarding application command to unit '{unit_name}'");
            let _ = tx.send(data);
        } else {
            debug!("Unrecognized unit: {unit_name}");
        }
    }
}
