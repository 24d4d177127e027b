//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot};

use zonewall_api::msg::OpResult;
use zonewall_api::{ApiError, Event};
use zonewall_ruleset::Capabilities;

use crate::apply::{Applier, ApplyRequest, ClientInfo};
use crate::center::Center;
use crate::config::Config;
use crate::log::Logger;
use crate::metrics::Metrics;
use crate::nft::mock::MockBackend;
use crate::targets::central_command::CentralCommand;

/// A logger for tests: installed once, ignored if something else won.
fn test_logger() -> &'static Logger {
    static LOGGER: Mutex<Option<&'static Logger>> = Mutex::new(None);
    let mut slot = LOGGER.lock().unwrap();
    if let Some(logger) = *slot {
        return logger;
    }
    let config = crate::config::LoggingConfig::default();
    let logger = Logger::launch(&config, camino::Utf8Path::new("/tmp"))
        .expect("the test logger launches once");
    *slot = Some(logger);
    logger
}

/// A center wired to temp directories, with the central command running.
///
/// Returns the apply queue's receiving end (for an applier, if the test
/// wants one) and the tempdir guard.
pub async fn test_center() -> (
    Arc<Center>,
    mpsc::UnboundedReceiver<ApplyRequest>,
    tempfile::TempDir,
) {
    let dir = tempfile::tempdir().unwrap();
    let base = camino::Utf8Path::from_path(dir.path()).unwrap();

    let cmd = Config::setup_cli(clap::Command::new("test"));
    let matches = cmd.get_matches_from(["test"]);
    let mut config = Config::init(&matches).unwrap();
    config.config_dir = base.join("etc");
    config.state_dir = base.join("state");
    config.run_dir = base.join("run");
    config.log_dir = base.join("log");
    config.daemon.test_mode = true;

    let (app_cmd_tx, app_cmd_rx) = mpsc::unbounded_channel();
    let (update_tx, update_rx) = mpsc::unbounded_channel();
    let (apply_tx, apply_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(256);

    let center = Arc::new(Center {
        state: Mutex::new(Default::default()),
        config,
        logger: test_logger(),
        live: Default::default(),
        metrics: Metrics::new(),
        started_at: tokio::time::Instant::now(),
        app_cmd_tx,
        update_tx,
        apply_tx,
        events,
    });

    // The real central command routes updates into the event broadcast.
    let target = CentralCommand {
        center: center.clone(),
    };
    let (center_tx, center_rx) = mpsc::unbounded_channel();
    tokio::spawn(target.run(center_rx, update_rx));
    std::mem::forget(center_tx);

    // Nobody consumes per-unit commands in tests.
    std::mem::forget(app_cmd_rx);

    (center, apply_rx, dir)
}

/// A running applier over a mock backend, plus calling conveniences.
pub struct ApplierRig {
    pub tx: mpsc::UnboundedSender<ApplyRequest>,
    events_rx: broadcast::Receiver<Event>,
    _dir: tempfile::TempDir,
}

/// Build a center, a mock backend and a running applier.
pub async fn applier_rig() -> (Arc<Center>, Arc<MockBackend>, ApplierRig) {
    let (center, apply_rx, dir) = test_center().await;
    let backend = Arc::new(MockBackend::new());

    let applier = Applier {
        center: center.clone(),
        backend: backend.clone(),
        caps: Capabilities::FULL,
        setmgr_tx: None,
        netconf_tx: None,
    };
    tokio::spawn(applier.run(apply_rx));

    let rig = ApplierRig {
        tx: center.apply_tx.clone(),
        events_rx: center.events.subscribe(),
        _dir: dir,
    };
    (center, backend, rig)
}

pub async fn recv_result(
    rx: oneshot::Receiver<Result<OpResult, ApiError>>,
) -> Result<OpResult, ApiError> {
    rx.await.expect("the unit answered")
}

impl ApplierRig {
    pub async fn apply(&mut self, document: &str) -> Result<OpResult, ApiError> {
        self.apply_as(document, ClientInfo::default(), false).await
    }

    pub async fn apply_as(
        &mut self,
        document: &str,
        client: ClientInfo,
        override_lockout: bool,
    ) -> Result<OpResult, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ApplyRequest::Apply {
                document: document.into(),
                override_lockout,
                client,
                reply,
            })
            .unwrap();
        recv_result(rx).await
    }

    pub async fn safe_apply(
        &mut self,
        document: &str,
        rollback_secs: u64,
    ) -> Result<OpResult, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ApplyRequest::SafeApply {
                document: document.into(),
                rollback_secs,
                override_lockout: false,
                client: ClientInfo::default(),
                reply,
            })
            .unwrap();
        recv_result(rx).await
    }

    pub async fn confirm(&mut self) -> Result<OpResult, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ApplyRequest::Confirm { reply }).unwrap();
        recv_result(rx).await
    }

    pub async fn reapply(&mut self) -> Result<(), ApiError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ApplyRequest::Reapply { reply }).unwrap();
        rx.await.expect("the applier answered")
    }

    pub async fn enter_safe_mode(&mut self, reason: &str) {
        self.tx
            .send(ApplyRequest::EnterSafeMode {
                reason: reason.into(),
            })
            .unwrap();
        self.drain().await;
    }

    pub async fn clear_safe_mode(&mut self) -> Result<OpResult, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ApplyRequest::ClearSafeMode { reply }).unwrap();
        recv_result(rx).await
    }

    /// Wait until the applier has worked through its queue.
    ///
    /// Implemented as a confirm round-trip: with no pending apply it is a
    /// pure no-op that still proves everything queued before it ran.
    pub async fn drain(&mut self) {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ApplyRequest::Confirm { reply }).unwrap();
        let _ = rx.await;
    }

    /// The events broadcast so far.
    pub async fn events(&mut self) -> Vec<Event> {
        // Give the central command a chance to route queued updates.
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        events
    }
}
