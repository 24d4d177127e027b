//! The control-channel server.
//!
//! The control plane's only door: a unix stream socket under the run
//! directory, speaking length-prefixed JSON frames.  Clients are the
//! operator CLI (local root) and the unprivileged API plane; both carry
//! capability tokens, and every operation is checked against the token's
//! `verb:resource` grants before it touches anything.
//!
//! Requests on one connection are handled concurrently and correlated by
//! the client-chosen request id.  Event subscriptions are long-lived
//! responses multiplexed onto the same connection: each subscriber gets a
//! bounded queue, and one that cannot keep up is cut off with a
//! back-pressure error instead of stalling the publisher.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use zonewall_api::codec::{Decoder, Encoder};
use zonewall_api::msg::{BackupInfo, HealthStatus, OpResult};
use zonewall_api::{ApiError, Op, Request, Response, ResponseBody};

use crate::apply::{ApplyRequest, ClientInfo};
use crate::center::{BackupRecord, Center};
use crate::comms::ApplicationCommand;
use crate::nft::RulesetBackend;
use crate::supervisor::SupervisorCommand;
use crate::units::setmgr::SetMgrCommand;

/// Outbound frames queued per connection before the writer blocks.
const OUTBOUND_QUEUE: usize = 64;

//----------- ControlServer ----------------------------------------------------

/// The control-channel server unit.
pub struct ControlServer<B> {
    pub center: Arc<Center>,
    pub backend: Arc<B>,
    pub setmgr_tx: mpsc::UnboundedSender<SetMgrCommand>,
    pub supervisor_tx: mpsc::UnboundedSender<SupervisorCommand>,
}

impl<B: RulesetBackend> ControlServer<B> {
    pub async fn run(
        self,
        listener: UnixListener,
        mut cmd_rx: mpsc::UnboundedReceiver<ApplicationCommand>,
        ready_tx: oneshot::Sender<()>,
    ) {
        let _ = ready_tx.send(());
        let this = Arc::new(self);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(ApplicationCommand::Terminate) => break,
                        Some(_) => {}
                    }
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            tokio::spawn(Self::connection(this.clone(), stream));
                        }
                        Err(err) => {
                            warn!("Control socket accept failed: {err}");
                        }
                    }
                }
            }
        }
    }

    async fn connection(this: Arc<Self>, stream: UnixStream) {
        match stream.peer_cred() {
            Ok(cred) => {
                info!(
                    uid = cred.uid(),
                    pid = cred.pid(),
                    "Accepted a control connection"
                );
            }
            Err(err) => {
                warn!("Could not read peer credentials: {err}");
            }
        }

        let (read, write) = tokio::io::split(stream);
        let mut reader = tokio_util::codec::FramedRead::new(read, Decoder::<Request>::default());
        let mut writer = tokio_util::codec::FramedWrite::new(write, Encoder::<Response>::default());

        let (out_tx, mut out_rx) = mpsc::channel::<Response>(OUTBOUND_QUEUE);
        let writer_task = tokio::spawn(async move {
            while let Some(response) = out_rx.recv().await {
                if writer.send(&response).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = reader.next().await {
            match frame {
                Ok(request) => {
                    tokio::spawn(Self::handle_request(this.clone(), request, out_tx.clone()));
                }
                Err(err) => {
                    debug!("Control connection closed: {err}");
                    break;
                }
            }
        }

        drop(out_tx);
        let _ = writer_task.await;
    }

    async fn handle_request(this: Arc<Self>, request: Request, out_tx: mpsc::Sender<Response>) {
        let id = request.id;
        let deadline = request.deadline_secs.map(Duration::from_secs);

        let work = this.dispatch(request, id, out_tx.clone());
        let result = match deadline {
            // A deadline cancels the server-side work when it drops the
            // future.
            Some(deadline) => timeout(deadline, work)
                .await
                .unwrap_or(Err(ApiError::Timeout)),
            None => work.await,
        };

        let _ = out_tx
            .send(Response {
                id,
                body: ResponseBody::Result(result),
            })
            .await;
    }

    //--- Authorization

    fn authorize(&self, request: &Request) -> Result<ClientInfo, ApiError> {
        let Some(required) = request.op.required_permission() else {
            return Ok(ClientInfo::default());
        };

        let forbidden = || ApiError::Forbidden {
            verb: required.verb,
            resource: required.resource,
        };

        let Some(secret) = &request.token else {
            return Err(forbidden());
        };

        let mut state = self.center.state.lock().unwrap();
        if state.tokens.resolve(secret).is_none() {
            // The operator may have edited the store file since start;
            // re-read it before rejecting.
            if let Ok(spec) =
                crate::state::tokens::Spec::load(&self.center.config.token_store_path())
            {
                state.tokens.reload_from(spec);
            }
        }

        let token = state.tokens.resolve(secret).ok_or_else(forbidden)?;
        if token.is_expired(jiff::Timestamp::now()) {
            return Err(forbidden());
        }
        if !token.allows(required) {
            return Err(forbidden());
        }

        Ok(ClientInfo {
            principal: token.principal.clone(),
            addr: request.client_addr,
        })
    }

    //--- Dispatch

    async fn dispatch(
        &self,
        request: Request,
        id: u64,
        out_tx: mpsc::Sender<Response>,
    ) -> Result<OpResult, ApiError> {
        let client = self.authorize(&request)?;
        debug!(op = request.op.name(), principal = %client.principal, "Handling request");

        match request.op {
            Op::ConfigGet => self.config_get(),
            Op::ConfigApply {
                document,
                override_lockout,
            } => {
                self.to_applier(|reply| ApplyRequest::Apply {
                    document,
                    override_lockout,
                    client,
                    reply,
                })
                .await
            }
            Op::ConfigSafeApply {
                document,
                rollback_secs,
                override_lockout,
            } => {
                self.to_applier(|reply| ApplyRequest::SafeApply {
                    document,
                    rollback_secs,
                    override_lockout,
                    client,
                    reply,
                })
                .await
            }
            Op::ConfigConfirm => {
                self.to_applier(|reply| ApplyRequest::Confirm { reply }).await
            }
            Op::ConfigDiff { document } => self.config_diff(&document),
            Op::FirewallShow => self.firewall_show(),
            Op::FirewallCounters => {
                let counters =
                    self.backend
                        .read_counters()
                        .await
                        .map_err(|err| ApiError::Apply {
                            kernel_reason: err.message,
                        })?;
                Ok(OpResult::Counters { counters })
            }
            Op::IpsetList => self.to_setmgr(|reply| SetMgrCommand::List { reply }).await,
            Op::IpsetShow { name } => {
                self.to_setmgr(|reply| SetMgrCommand::Show { name, reply })
                    .await
            }
            Op::IpsetAdd { name, element } => {
                self.to_setmgr(|reply| SetMgrCommand::Add {
                    name,
                    element,
                    reply,
                })
                .await
            }
            Op::IpsetRemove { name, element } => {
                self.to_setmgr(|reply| SetMgrCommand::Remove {
                    name,
                    element,
                    reply,
                })
                .await
            }
            Op::IpsetFlush { name } => {
                self.to_setmgr(|reply| SetMgrCommand::Flush { name, reply })
                    .await
            }
            Op::BackupList => self.backup_list(),
            Op::BackupCreate { label } => self.backup_create(label),
            Op::BackupRestore { id } => {
                self.to_applier(|reply| ApplyRequest::RestoreBackup { id, client, reply })
                    .await
            }
            Op::UpgradeStage { binary } => {
                self.to_supervisor(|reply| SupervisorCommand::StageUpgrade { binary, reply })
                    .await
            }
            Op::UpgradeSwap => {
                self.to_supervisor(|reply| SupervisorCommand::SwapUpgrade { reply })
                    .await
            }
            Op::SafeModeClear => {
                self.to_applier(|reply| ApplyRequest::ClearSafeMode { reply })
                    .await
            }
            Op::EventsSubscribe => {
                self.subscribe(id, out_tx);
                Ok(OpResult::Subscribed)
            }
            Op::Health => Ok(OpResult::Health(self.health())),
        }
    }

    //--- Simple reads

    fn config_get(&self) -> Result<OpResult, ApiError> {
        let live = self.center.live.load_full().ok_or(ApiError::Conflict {
            reason: "no configuration has been applied yet".into(),
        })?;

        let spec = crate::doc::parse(&live.source)?;
        let document = crate::doc::masked_document(&spec)?;
        Ok(OpResult::Config {
            document,
            generation: live.id,
        })
    }

    fn config_diff(&self, document: &str) -> Result<OpResult, ApiError> {
        let spec = crate::doc::parse(document)?;
        let validated = crate::validate::validate(&spec, false)?;

        let live = self.center.live.load_full();
        let prev = live
            .as_ref()
            .map(|generation| generation.graph.clone())
            .unwrap_or_default();

        let changes = zonewall_ruleset::Graph::diff(&prev, &validated.graph);
        let summary = render_changes(&changes);
        Ok(OpResult::Diff { changes, summary })
    }

    fn firewall_show(&self) -> Result<OpResult, ApiError> {
        let live = self.center.live.load_full().ok_or(ApiError::Conflict {
            reason: "no ruleset has been applied yet".into(),
        })?;
        Ok(OpResult::Ruleset {
            generation: live.id,
            fingerprint: live.compiled.fingerprint,
            text: live.compiled.text.clone(),
        })
    }

    fn backup_list(&self) -> Result<OpResult, ApiError> {
        let state = self.center.state.lock().unwrap();
        let backups = state
            .backups
            .iter()
            .map(|record| BackupInfo {
                id: record.id,
                fingerprint: record.fingerprint,
                created: record.created,
                label: record.label.clone(),
            })
            .collect();
        Ok(OpResult::Backups { backups })
    }

    fn backup_create(&self, label: Option<String>) -> Result<OpResult, ApiError> {
        let live = self.center.live.load_full().ok_or(ApiError::Conflict {
            reason: "no configuration has been applied yet".into(),
        })?;

        {
            let mut state = self.center.state.lock().unwrap();
            state.backups.retain(|record| record.id != live.id);
            state.backups.push(BackupRecord {
                id: live.id,
                fingerprint: live.compiled.fingerprint,
                created: jiff::Timestamp::now(),
                label,
            });
        }
        crate::state::save_now(&self.center);

        info!("Retained generation {} as a backup", live.id);
        Ok(OpResult::BackupCreated { id: live.id })
    }

    fn health(&self) -> HealthStatus {
        let state = self.center.state.lock().unwrap();
        HealthStatus {
            generation: state.live_id,
            safe_mode: state.safe_mode.is_some(),
            uptime_secs: self.center.uptime_secs(),
        }
    }

    //--- Subscriptions

    fn subscribe(&self, id: u64, out_tx: mpsc::Sender<Response>) {
        let mut events = self.center.events.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let response = Response {
                            id,
                            body: ResponseBody::Event(event),
                        };
                        if out_tx.send(response).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Subscriber lagged by {missed} events; dropping it");
                        let _ = out_tx
                            .send(Response {
                                id,
                                body: ResponseBody::Result(Err(ApiError::Backpressure)),
                            })
                            .await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    //--- Unit forwarding

    async fn to_applier(
        &self,
        make: impl FnOnce(crate::comms::Reply) -> ApplyRequest,
    ) -> Result<OpResult, ApiError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.center
            .apply_tx
            .send(make(reply_tx))
            .map_err(|_| applier_gone())?;
        reply_rx.await.map_err(|_| applier_gone())?
    }

    async fn to_setmgr(
        &self,
        make: impl FnOnce(crate::comms::Reply) -> SetMgrCommand,
    ) -> Result<OpResult, ApiError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.setmgr_tx.send(make(reply_tx)).map_err(|_| ApiError::Internal {
            reason: "the set manager went away".into(),
        })?;
        reply_rx.await.map_err(|_| ApiError::Internal {
            reason: "the set manager went away".into(),
        })?
    }

    async fn to_supervisor(
        &self,
        make: impl FnOnce(crate::comms::Reply) -> SupervisorCommand,
    ) -> Result<OpResult, ApiError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.supervisor_tx
            .send(make(reply_tx))
            .map_err(|_| ApiError::Internal {
                reason: "the supervisor went away".into(),
            })?;
        reply_rx.await.map_err(|_| ApiError::Internal {
            reason: "the supervisor went away".into(),
        })?
    }
}

fn applier_gone() -> ApiError {
    ApiError::Internal {
        reason: "the applier went away".into(),
    }
}

/// Render a change set for operators.
fn render_changes(changes: &zonewall_ruleset::ChangeSet) -> String {
    if changes.is_empty() {
        return "no effective changes".into();
    }

    let mut out = String::new();
    if changes.ruleset {
        out.push_str("firewall: ruleset will be recompiled and swapped\n");
    }
    if changes.interfaces {
        out.push_str("network: interface definitions change\n");
    }
    if changes.routes {
        out.push_str("network: routes change\n");
    }
    for name in &changes.sets.fresh {
        out.push_str(&format!("ipset: '{name}' will be created\n"));
    }
    for name in &changes.sets.discarded {
        out.push_str(&format!("ipset: '{name}' will be removed\n"));
    }
    for name in &changes.sets.carried {
        out.push_str(&format!("ipset: '{name}' keeps its contents\n"));
    }
    for (name, change) in &changes.services {
        let verb = match change {
            zonewall_ruleset::ServiceChange::Start => "starts",
            zonewall_ruleset::ServiceChange::Stop => "stops",
            zonewall_ruleset::ServiceChange::Reload => "reloads",
        };
        out.push_str(&format!("service: {name} {verb}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use std::collections::BTreeSet;
    use zonewall_api::{Permission, Resource, Verb};

    /// A framed client over a real unix socket.
    struct Client {
        reader: tokio_util::codec::FramedRead<
            tokio::io::ReadHalf<UnixStream>,
            Decoder<Response>,
        >,
        writer: tokio_util::codec::FramedWrite<
            tokio::io::WriteHalf<UnixStream>,
            Encoder<Request>,
        >,
        next_id: u64,
    }

    impl Client {
        async fn connect(path: &camino::Utf8Path) -> Self {
            let stream = UnixStream::connect(path.as_std_path()).await.unwrap();
            let (read, write) = tokio::io::split(stream);
            Self {
                reader: tokio_util::codec::FramedRead::new(read, Decoder::default()),
                writer: tokio_util::codec::FramedWrite::new(write, Encoder::default()),
                next_id: 1,
            }
        }

        async fn request(&mut self, token: Option<&str>, op: Op) -> Result<OpResult, ApiError> {
            let id = self.next_id;
            self.next_id += 1;
            self.writer
                .send(&Request {
                    id,
                    token: token.map(Into::into),
                    deadline_secs: Some(30),
                    client_addr: None,
                    op,
                })
                .await
                .unwrap();

            loop {
                let response = self.reader.next().await.unwrap().unwrap();
                if response.id != id {
                    continue;
                }
                match response.body {
                    ResponseBody::Result(result) => return result,
                    ResponseBody::Event(_) => continue,
                }
            }
        }

        async fn next_event(&mut self) -> zonewall_api::Event {
            loop {
                let response = self.reader.next().await.unwrap().unwrap();
                if let ResponseBody::Event(event) = response.body {
                    return event;
                }
            }
        }
    }

    async fn server_rig() -> (Arc<Center>, camino::Utf8PathBuf, String, test_support::ApplierRig)
    {
        let (center, backend, rig) = test_support::applier_rig().await;

        // A token holding everything a test needs.
        let secret = {
            let mut state = center.state.lock().unwrap();
            let perms: BTreeSet<Permission> = [
                Permission::new(Resource::Config, Verb::Read),
                Permission::new(Resource::Config, Verb::Write),
                Permission::new(Resource::Firewall, Verb::Read),
                Permission::new(Resource::Events, Verb::Read),
            ]
            .into();
            state.tokens.issue("test".into(), perms, None)
        };

        let socket_path = center.config.run_dir.join("control-test.sock");
        std::fs::create_dir_all(center.config.run_dir.as_std_path()).unwrap();
        let listener = UnixListener::bind(socket_path.as_std_path()).unwrap();

        let (setmgr_tx, mut setmgr_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // A stub set manager: every list is empty.
            while let Some(cmd) = setmgr_rx.recv().await {
                if let SetMgrCommand::List { reply } = cmd {
                    let _ = reply.send(Ok(OpResult::Sets { sets: Vec::new() }));
                }
            }
        });
        let (supervisor_tx, _supervisor_rx) = mpsc::unbounded_channel();

        let server = ControlServer {
            center: center.clone(),
            backend,
            setmgr_tx,
            supervisor_tx,
        };
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<ApplicationCommand>();
        std::mem::forget(cmd_tx);
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(server.run(listener, cmd_rx, ready_tx));
        let _ = ready_rx.await;

        (center, socket_path, secret, rig)
    }

    const DOCUMENT: &str = r#"
[[zone]]
name = "lan"
management = { api = true }

[[interface]]
name = "eth1"
zone = "lan"
ipv4 = ["192.168.1.1/24"]

[wireguard]
listen_port = 51820
private_key = "hunter2"
"#;

    #[tokio::test]
    async fn health_needs_no_token() {
        let (_center, path, _secret, _rig) = server_rig().await;
        let mut client = Client::connect(&path).await;

        let result = client.request(None, Op::Health).await.unwrap();
        assert!(matches!(result, OpResult::Health(_)));
    }

    #[tokio::test]
    async fn missing_or_wrong_tokens_are_forbidden() {
        let (_center, path, _secret, _rig) = server_rig().await;
        let mut client = Client::connect(&path).await;

        let err = client.request(None, Op::ConfigGet).await.unwrap_err();
        assert!(matches!(
            err,
            ApiError::Forbidden {
                verb: Verb::Read,
                resource: Resource::Config
            }
        ));

        let err = client
            .request(Some("no-such-token"), Op::ConfigGet)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden { .. }));
    }

    #[tokio::test]
    async fn tokens_gate_writes_separately_from_reads() {
        let (center, path, _secret, _rig) = server_rig().await;
        let read_only = {
            let mut state = center.state.lock().unwrap();
            let perms: BTreeSet<Permission> =
                [Permission::new(Resource::Config, Verb::Read)].into();
            state.tokens.issue("viewer".into(), perms, None)
        };

        let mut client = Client::connect(&path).await;
        let err = client
            .request(
                Some(&read_only),
                Op::ConfigApply {
                    document: DOCUMENT.into(),
                    override_lockout: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::Forbidden {
                verb: Verb::Write,
                resource: Resource::Config
            }
        ));
    }

    #[tokio::test]
    async fn apply_then_get_masks_credentials() {
        let (_center, path, secret, _rig) = server_rig().await;
        let mut client = Client::connect(&path).await;

        let applied = client
            .request(
                Some(&secret),
                Op::ConfigApply {
                    document: DOCUMENT.into(),
                    override_lockout: false,
                },
            )
            .await
            .unwrap();
        assert!(matches!(applied, OpResult::Applied { generation: 0, .. }));

        let got = client.request(Some(&secret), Op::ConfigGet).await.unwrap();
        let OpResult::Config { document, .. } = got else {
            panic!("expected the configuration");
        };
        assert!(!document.contains("hunter2"));
        assert!(document.contains(zonewall_api::REDACTED));
    }

    #[tokio::test]
    async fn subscriptions_stream_events_by_request_id() {
        let (_center, path, secret, _rig) = server_rig().await;
        let mut subscriber = Client::connect(&path).await;
        let result = subscriber
            .request(Some(&secret), Op::EventsSubscribe)
            .await
            .unwrap();
        assert!(matches!(result, OpResult::Subscribed));

        // A second connection applies; the subscriber sees the event.
        let mut operator = Client::connect(&path).await;
        operator
            .request(
                Some(&secret),
                Op::ConfigApply {
                    document: DOCUMENT.into(),
                    override_lockout: false,
                },
            )
            .await
            .unwrap();

        let event = subscriber.next_event().await;
        assert!(matches!(
            event,
            zonewall_api::Event::Applied { generation: 0, .. }
        ));
    }

    #[tokio::test]
    async fn diff_reports_component_classification() {
        let (_center, path, secret, _rig) = server_rig().await;
        let mut client = Client::connect(&path).await;

        let result = client
            .request(
                Some(&secret),
                Op::ConfigDiff {
                    document: DOCUMENT.into(),
                },
            )
            .await
            .unwrap();
        let OpResult::Diff { changes, summary } = result else {
            panic!("expected a diff");
        };
        assert!(changes.ruleset);
        assert!(changes.interfaces);
        assert!(summary.contains("wireguard starts"));
    }
}
