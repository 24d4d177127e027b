//! Service subsystem lifecycle.
//!
//! The core does not know what a DHCP server or a WireGuard tunnel looks
//! like inside; it only orchestrates subsystems through the adapter
//! contract below, driven by the per-subsystem entries of each commit's
//! change set.  Safe mode holds every subsystem stopped until it is
//! cleared.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zonewall_api::Event;

use crate::center::Center;
use crate::comms::ApplicationCommand;

/// How long one adapter call may take before it is cancelled.
const APPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// How often adapters are health-checked.
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

//----------- ServiceAdapter ---------------------------------------------------

/// A subsystem's readiness and liveness.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Health {
    /// Running and serving.
    Healthy,

    /// Running but impaired.
    Degraded(String),

    /// Not running.
    Stopped,
}

/// What the core requires of every service subsystem.
///
/// `apply` is idempotent: calling it with an unchanged subconfiguration
/// must be safe, and `None` means stop.  Long reloads must honor the
/// cancellation token.
pub trait ServiceAdapter: Send + Sync {
    /// The subsystem name, matching its document block.
    fn name(&self) -> &str;

    /// Bring the subsystem to the given subconfiguration, or stop it.
    fn apply<'a>(
        &'a self,
        subconfig: Option<&'a str>,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<(), String>>;

    /// Probe readiness and liveness.
    fn healthcheck(&self) -> BoxFuture<'_, Health>;

    /// The subsystem's domain events (lease granted, peer connected, ...).
    ///
    /// The stream is drained for as long as the lifecycle unit lives, and
    /// every event is forwarded to control-channel subscribers.  A
    /// subsystem with nothing to report returns an empty stream.
    fn events(&self) -> BoxStream<'static, Event>;
}

//----------- HookAdapter ------------------------------------------------------

/// An adapter that delegates to an external hook executable.
///
/// The hook is called as `<hook> apply` with the subconfiguration on
/// stdin, `<hook> stop`, or `<hook> health` (exit 0 means healthy); a
/// long-running `<hook> events` emits one domain event per stdout line.
/// This is the stock way to attach packaged daemons without linking them
/// in.
pub struct HookAdapter {
    name: String,
    hook: Utf8PathBuf,
}

/// A running `<hook> events` subprocess being read line by line.
struct HookEvents {
    subsystem: String,
    _child: tokio::process::Child,
    lines: tokio::io::Lines<tokio::io::BufReader<tokio::process::ChildStdout>>,
}

impl HookAdapter {
    pub fn new(name: impl Into<String>, hook: Utf8PathBuf) -> Self {
        Self {
            name: name.into(),
            hook,
        }
    }

    async fn run_hook(&self, verb: &str, stdin: Option<&str>) -> Result<(), String> {
        let mut command = tokio::process::Command::new(self.hook.as_std_path());
        command
            .arg(verb)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|err| format!("could not run {}: {err}", self.hook))?;

        if let Some(text) = stdin {
            use tokio::io::AsyncWriteExt;
            let mut handle = child.stdin.take().expect("stdin was piped");
            handle
                .write_all(text.as_bytes())
                .await
                .map_err(|err| err.to_string())?;
        } else {
            drop(child.stdin.take());
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| err.to_string())?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

impl ServiceAdapter for HookAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply<'a>(
        &'a self,
        subconfig: Option<&'a str>,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<(), String>> {
        async move {
            let verb = if subconfig.is_some() { "apply" } else { "stop" };
            tokio::select! {
                result = self.run_hook(verb, subconfig) => result,
                _ = cancel.cancelled() => Err("cancelled".into()),
            }
        }
        .boxed()
    }

    fn healthcheck(&self) -> BoxFuture<'_, Health> {
        async move {
            match self.run_hook("health", None).await {
                Ok(()) => Health::Healthy,
                Err(detail) => Health::Degraded(detail),
            }
        }
        .boxed()
    }

    fn events(&self) -> BoxStream<'static, Event> {
        let subsystem = self.name.clone();
        let hook = self.hook.clone();

        // The subprocess is spawned lazily on the first poll; a hook
        // without an `events` verb exits immediately and ends the stream.
        let stream = futures::stream::unfold(None, move |running: Option<HookEvents>| {
            let subsystem = subsystem.clone();
            let hook = hook.clone();
            async move {
                let mut running = match running {
                    Some(running) => running,
                    None => {
                        let mut child = tokio::process::Command::new(hook.as_std_path())
                            .arg("events")
                            .stdin(Stdio::null())
                            .stdout(Stdio::piped())
                            .stderr(Stdio::null())
                            .kill_on_drop(true)
                            .spawn()
                            .ok()?;
                        let stdout = child.stdout.take()?;
                        HookEvents {
                            subsystem,
                            _child: child,
                            lines: tokio::io::BufReader::new(stdout).lines(),
                        }
                    }
                };

                let detail = running.lines.next_line().await.ok().flatten()?;
                let event = Event::Service {
                    subsystem: running.subsystem.clone(),
                    detail,
                };
                Some((event, Some(running)))
            }
        });
        Box::pin(stream)
    }
}

//----------- ServiceManager ---------------------------------------------------

/// The lifecycle orchestration unit.
pub struct ServiceManager {
    pub center: Arc<Center>,
    pub adapters: BTreeMap<String, Box<dyn ServiceAdapter>>,
}

impl ServiceManager {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ApplicationCommand>,
        ready_tx: oneshot::Sender<()>,
    ) {
        let _ = ready_tx.send(());

        // Drain every adapter's domain event stream into the subscriber
        // fan-out for as long as this unit lives.
        let mut event_forwarders = Vec::new();
        for adapter in self.adapters.values() {
            let mut events = adapter.events();
            let center = self.center.clone();
            event_forwarders.push(tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    center.notify(event);
                }
            }));
        }

        // The subconfigurations currently applied, per subsystem.
        let mut running: BTreeMap<String, String> = BTreeMap::new();
        let cancel = CancellationToken::new();
        let mut health_tick = tokio::time::interval(HEALTH_INTERVAL);
        health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        ApplicationCommand::Terminate => {
                            cancel.cancel();
                            break;
                        }
                        ApplicationCommand::GenerationCommitted { graph, changes, .. } => {
                            self.transition(&mut running, &graph.services, &changes.services, &cancel)
                                .await;
                        }
                        ApplicationCommand::SafeModeChanged { active } => {
                            if active {
                                self.stop_all(&mut running, &cancel).await;
                            } else if let Some(live) = self.center.live.load_full() {
                                // Restart everything the live generation
                                // declares.
                                let changes = live
                                    .graph
                                    .services
                                    .keys()
                                    .map(|name| {
                                        (name.clone(), zonewall_ruleset::ServiceChange::Start)
                                    })
                                    .collect();
                                self.transition(
                                    &mut running,
                                    &live.graph.services,
                                    &changes,
                                    &cancel,
                                )
                                .await;
                            }
                        }
                        ApplicationCommand::RearmIntegrity => {}
                    }
                }

                _ = health_tick.tick() => {
                    if !self.center.config.daemon.test_mode {
                        self.check_health(&running).await;
                    }
                }
            }
        }

        for forwarder in event_forwarders {
            forwarder.abort();
        }
    }

    /// Drive the per-subsystem transitions of one commit.
    async fn transition(
        &self,
        running: &mut BTreeMap<String, String>,
        services: &BTreeMap<String, String>,
        changes: &BTreeMap<String, zonewall_ruleset::ServiceChange>,
        cancel: &CancellationToken,
    ) {
        for (name, change) in changes {
            let Some(adapter) = self.adapters.get(name) else {
                debug!("No adapter for subsystem '{name}'; skipping");
                continue;
            };

            let subconfig = match change {
                zonewall_ruleset::ServiceChange::Stop => None,
                _ => services.get(name).map(String::as_str),
            };

            let applied = tokio::time::timeout(
                APPLY_TIMEOUT,
                adapter.apply(subconfig, cancel.child_token()),
            )
            .await
            .unwrap_or_else(|_| Err("timed out".into()));

            match applied {
                Ok(()) => {
                    info!("Subsystem '{name}': {change:?} done");
                    match subconfig {
                        Some(conf) => {
                            running.insert(name.clone(), conf.to_string());
                        }
                        None => {
                            running.remove(name);
                        }
                    }
                }
                Err(err) => {
                    warn!("Subsystem '{name}' failed to {change:?}: {err}");
                    self.center.notify(Event::Service {
                        subsystem: name.clone(),
                        detail: format!("{change:?} failed: {err}"),
                    });
                }
            }
        }
    }

    async fn stop_all(&self, running: &mut BTreeMap<String, String>, cancel: &CancellationToken) {
        for name in running.keys().cloned().collect::<Vec<_>>() {
            if let Some(adapter) = self.adapters.get(&name) {
                if let Err(err) = adapter.apply(None, cancel.child_token()).await {
                    warn!("Could not stop subsystem '{name}': {err}");
                }
            }
        }
        running.clear();
        info!("All service subsystems held stopped");
    }

    async fn check_health(&self, running: &BTreeMap<String, String>) {
        for name in running.keys() {
            let Some(adapter) = self.adapters.get(name) else {
                continue;
            };
            match adapter.healthcheck().await {
                Health::Healthy => {}
                Health::Degraded(detail) => {
                    warn!("Subsystem '{name}' is degraded: {detail}");
                    self.center.notify(Event::Service {
                        subsystem: name.clone(),
                        detail,
                    });
                }
                Health::Stopped => {
                    warn!("Subsystem '{name}' stopped unexpectedly");
                    self.center.notify(Event::Service {
                        subsystem: name.clone(),
                        detail: "stopped unexpectedly".into(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use std::sync::Mutex;
    use zonewall_ruleset::ServiceChange;

    /// Records every apply call.
    struct RecordingAdapter {
        name: String,
        calls: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl ServiceAdapter for RecordingAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        fn apply<'a>(
            &'a self,
            subconfig: Option<&'a str>,
            _cancel: CancellationToken,
        ) -> BoxFuture<'a, Result<(), String>> {
            let calls = self.calls.clone();
            let subconfig = subconfig.map(str::to_string);
            async move {
                calls.lock().unwrap().push(subconfig);
                Ok(())
            }
            .boxed()
        }

        fn healthcheck(&self) -> BoxFuture<'_, Health> {
            async move { Health::Healthy }.boxed()
        }

        fn events(&self) -> BoxStream<'static, Event> {
            futures::stream::empty().boxed()
        }
    }

    /// Emits a canned domain event stream.
    struct ChattyAdapter;

    impl ServiceAdapter for ChattyAdapter {
        fn name(&self) -> &str {
            "dhcp"
        }

        fn apply<'a>(
            &'a self,
            _subconfig: Option<&'a str>,
            _cancel: CancellationToken,
        ) -> BoxFuture<'a, Result<(), String>> {
            async move { Ok(()) }.boxed()
        }

        fn healthcheck(&self) -> BoxFuture<'_, Health> {
            async move { Health::Healthy }.boxed()
        }

        fn events(&self) -> BoxStream<'static, Event> {
            futures::stream::iter(vec![Event::Service {
                subsystem: "dhcp".into(),
                detail: "lease granted to aa:bb:cc:dd:ee:ff".into(),
            }])
            .boxed()
        }
    }

    async fn rig() -> (
        mpsc::UnboundedSender<ApplicationCommand>,
        Arc<Mutex<Vec<Option<String>>>>,
        tempfile::TempDir,
    ) {
        let (center, _apply_rx, dir) = test_support::test_center().await;
        let calls = Arc::new(Mutex::new(Vec::new()));
        let adapter = RecordingAdapter {
            name: "dhcp".into(),
            calls: calls.clone(),
        };

        let mut adapters: BTreeMap<String, Box<dyn ServiceAdapter>> = BTreeMap::new();
        adapters.insert("dhcp".into(), Box::new(adapter));

        let unit = ServiceManager { center, adapters };
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(unit.run(cmd_rx, ready_tx));
        let _ = ready_rx.await;
        (cmd_tx, calls, dir)
    }

    fn committed(
        services: &[(&str, &str)],
        changes: &[(&str, ServiceChange)],
    ) -> ApplicationCommand {
        let mut graph = zonewall_ruleset::Graph::default();
        for (name, conf) in services {
            graph
                .services
                .insert(name.to_string(), conf.to_string());
        }
        let mut change_set = zonewall_ruleset::ChangeSet::default();
        for (name, change) in changes {
            change_set.services.insert(name.to_string(), change.clone());
        }
        ApplicationCommand::GenerationCommitted {
            generation: 1,
            graph: Arc::new(graph),
            changes: change_set,
        }
    }

    #[tokio::test]
    async fn start_reload_stop_follow_the_diff() {
        let (cmd_tx, calls, _dir) = rig().await;

        cmd_tx
            .send(committed(
                &[("dhcp", "range=10")],
                &[("dhcp", ServiceChange::Start)],
            ))
            .unwrap();
        cmd_tx
            .send(committed(
                &[("dhcp", "range=20")],
                &[("dhcp", ServiceChange::Reload)],
            ))
            .unwrap();
        cmd_tx
            .send(committed(&[], &[("dhcp", ServiceChange::Stop)]))
            .unwrap();

        // Terminate flushes the queue before we inspect.
        cmd_tx.send(ApplicationCommand::Terminate).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                Some("range=10".to_string()),
                Some("range=20".to_string()),
                None
            ]
        );
    }

    #[tokio::test]
    async fn adapter_domain_events_reach_subscribers() {
        let (center, _apply_rx, _dir) = test_support::test_center().await;
        let mut events_rx = center.events.subscribe();

        let mut adapters: BTreeMap<String, Box<dyn ServiceAdapter>> = BTreeMap::new();
        adapters.insert("dhcp".into(), Box::new(ChattyAdapter));

        let unit = ServiceManager { center, adapters };
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(unit.run(cmd_rx, ready_tx));
        let _ = ready_rx.await;

        // Let the forwarder and the central command route the event.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut seen_lease = false;
        while let Ok(event) = events_rx.try_recv() {
            if let Event::Service { subsystem, detail } = event {
                assert_eq!(subsystem, "dhcp");
                assert!(detail.contains("lease granted"));
                seen_lease = true;
            }
        }
        assert!(seen_lease);
    }

    #[tokio::test]
    async fn subsystems_without_adapters_are_skipped() {
        let (cmd_tx, calls, _dir) = rig().await;

        cmd_tx
            .send(committed(
                &[("qos", "shape=1")],
                &[("qos", ServiceChange::Start)],
            ))
            .unwrap();
        cmd_tx.send(ApplicationCommand::Terminate).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(calls.lock().unwrap().is_empty());
    }
}
