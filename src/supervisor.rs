//! The supervisor: crash classification, safe mode promotion, and the
//! seamless upgrade handoff.
//!
//! The control plane spawns and watches the unprivileged API plane.  Child
//! exits are classified as clean, crash, or timeout, and only crashes count
//! against the rolling window; enough of them inside the window and the
//! whole system is promoted to safe mode.  The crash history is persisted
//! so a restart cannot launder a crash loop.
//!
//! Supervision is disabled on interactive terminals and in test mode, so
//! developer workflows cannot promote a laptop to safe mode.
//!
//! A seamless upgrade exec-spawns the staged binary with the control
//! listener passed by file descriptor; the new process validates its
//! configuration, signals readiness over an inherited pipe, and takes over
//! the socket.  If it misses its deadline the old process keeps running and
//! the upgrade is reported failed.

use std::io::{IsTerminal, Read};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use zonewall_api::msg::OpResult;
use zonewall_api::{ApiError, Event};

use crate::apply::ApplyRequest;
use crate::center::Center;
use crate::comms::Reply;

/// The environment variable carrying the inherited control listener fd.
pub const CONTROL_FD_VAR: &str = "ZONEWALL_CONTROL_FD";

/// The environment variable carrying the readiness pipe fd.
pub const READY_FD_VAR: &str = "ZONEWALL_READY_FD";

/// How long a staged binary has to signal readiness after the swap.
const UPGRADE_DEADLINE: Duration = Duration::from_secs(30);

/// Back-off between child restarts.
const RESTART_DELAY: Duration = Duration::from_secs(1);

//----------- Crash classification ---------------------------------------------

/// How a child exit is judged.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrashKind {
    /// Exit 0, or a shutdown signal (TERM, INT, HUP).
    Clean,

    /// A non-zero exit, a fatal signal (KILL, SEGV, BUS, ABRT), or a
    /// recovered panic.
    Crash,

    /// The child missed an externally imposed deadline.
    Timeout,
}

/// Classify a child's exit status.
pub fn classify(status: ExitStatus) -> CrashKind {
    if let Some(code) = status.code() {
        return if code == 0 {
            CrashKind::Clean
        } else {
            CrashKind::Crash
        };
    }

    match status.signal() {
        Some(libc::SIGTERM) | Some(libc::SIGINT) | Some(libc::SIGHUP) => CrashKind::Clean,
        // SIGKILL, SIGSEGV, SIGBUS, SIGABRT and anything else fatal.
        _ => CrashKind::Crash,
    }
}

//----------- CrashWindow ------------------------------------------------------

/// The rolling crash counter.
///
/// Only [`CrashKind::Crash`] entries count.  The history is persisted with
/// wall-clock stamps so that promotion logic survives a daemon restart.
#[derive(Clone, Debug)]
pub struct CrashWindow {
    window: Duration,
    threshold: usize,
    crashes: Vec<jiff::Timestamp>,
}

impl CrashWindow {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            crashes: Vec::new(),
        }
    }

    /// Record an exit.  Returns `true` when the threshold is reached and
    /// the system should promote to safe mode.
    pub fn record(&mut self, kind: CrashKind, now: jiff::Timestamp) -> bool {
        if kind != CrashKind::Crash {
            return false;
        }
        self.crashes.push(now);
        self.retain(now);
        self.crashes.len() >= self.threshold
    }

    /// Whether the window has been quiet since `since`.
    pub fn quiet_since(&self, now: jiff::Timestamp) -> bool {
        self.crashes
            .last()
            .is_none_or(|last| is_older_than(*last, now, self.window))
    }

    fn retain(&mut self, now: jiff::Timestamp) {
        let window = self.window;
        self.crashes
            .retain(|at| !is_older_than(*at, now, window));
    }
}

fn is_older_than(at: jiff::Timestamp, now: jiff::Timestamp, window: Duration) -> bool {
    let window = jiff::SignedDuration::try_from(window).unwrap_or(jiff::SignedDuration::MAX);
    now.duration_since(at) > window
}

//--- Persistence

/// The crash history file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct HistorySpec {
    crash: Vec<jiff::Timestamp>,
}

impl HistorySpec {
    pub fn load(path: &camino::Utf8Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|text| toml::from_str(&text).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &camino::Utf8Path) {
        if let Ok(text) = toml::to_string_pretty(self) {
            let _ = crate::util::write_file(path, text.as_bytes());
        }
    }

    pub fn parse_into(self, window: &mut CrashWindow) {
        window.crashes = self.crash;
    }

    pub fn build(window: &CrashWindow) -> Self {
        Self {
            crash: window.crashes.clone(),
        }
    }
}

//----------- SupervisorCommand ------------------------------------------------

/// A command for the supervisor.
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Validate and stage a replacement binary.
    StageUpgrade { binary: String, reply: Reply },

    /// Hand the listeners to the staged binary.
    SwapUpgrade { reply: Reply },

    /// Shut the supervisor down.
    Terminate,
}

//----------- Supervisor -------------------------------------------------------

/// The supervisor unit.
pub struct Supervisor {
    pub center: Arc<Center>,

    /// A duplicate of the control listener's fd, inherited by the next
    /// generation during an upgrade.
    pub control_fd: OwnedFd,
}

impl Supervisor {
    /// Whether child supervision should run at all.
    fn supervision_enabled(&self) -> bool {
        if self.center.config.daemon.test_mode {
            return false;
        }
        if std::io::stdin().is_terminal() {
            // An interactive session; spurious promotion would only
            // punish a developer.
            return false;
        }
        self.center.config.api_plane.enabled
    }

    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<SupervisorCommand>,
        ready_tx: oneshot::Sender<()>,
    ) {
        let _ = ready_tx.send(());

        let crash_window = self.center.config.daemon.crash_window();
        let crash_threshold = self.center.config.daemon.crash_threshold;
        let mut window = CrashWindow::new(crash_window, crash_threshold);
        HistorySpec::load(&self.center.config.crash_history_path()).parse_into(&mut window);

        let supervise = self.supervision_enabled();
        let mut child: Option<tokio::process::Child> = None;
        let mut staged: Option<Utf8PathBuf> = None;
        if supervise {
            child = self.spawn_api_plane();
        }

        let mut quiet_tick = tokio::time::interval(Duration::from_secs(30));
        quiet_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        SupervisorCommand::StageUpgrade { binary, reply } => {
                            let result = self.stage(&binary, &mut staged).await;
                            let _ = reply.send(result);
                        }
                        SupervisorCommand::SwapUpgrade { reply } => {
                            let result = self.swap(&mut staged).await;
                            let _ = reply.send(result);
                        }
                        SupervisorCommand::Terminate => break,
                    }
                }

                status = wait_child(&mut child), if child.is_some() => {
                    let kind = match status {
                        Ok(status) => classify(status),
                        Err(err) => {
                            warn!("Could not wait for the API plane: {err}");
                            CrashKind::Crash
                        }
                    };
                    info!("API plane exited: {kind:?}");

                    if window.record(kind, jiff::Timestamp::now()) {
                        self.center.metrics.child_crashes.inc();
                        error!(
                            "{crash_threshold} crashes within the window; promoting to safe mode"
                        );
                        let _ = self.center.apply_tx.send(ApplyRequest::EnterSafeMode {
                            reason: "repeated API plane crashes".into(),
                        });
                    } else if kind == CrashKind::Crash {
                        self.center.metrics.child_crashes.inc();
                    }
                    HistorySpec::build(&window).save(&self.center.config.crash_history_path());

                    tokio::time::sleep(RESTART_DELAY).await;
                    child = self.spawn_api_plane();
                }

                _ = quiet_tick.tick() => {
                    // A stable window of uptime clears safe mode on its own.
                    let in_safe_mode =
                        self.center.state.lock().unwrap().safe_mode.is_some();
                    if in_safe_mode && window.quiet_since(jiff::Timestamp::now()) {
                        info!("The crash window has been quiet; clearing safe mode");
                        let (reply_tx, _reply_rx) = oneshot::channel();
                        let _ = self
                            .center
                            .apply_tx
                            .send(ApplyRequest::ClearSafeMode { reply: reply_tx });
                    }
                }
            }
        }

        if let Some(mut child) = child {
            let _ = child.start_kill();
        }
    }

    /// Spawn the API plane child.
    fn spawn_api_plane(&self) -> Option<tokio::process::Child> {
        let config = &self.center.config;
        let binary = config.api_plane.binary.clone().unwrap_or_else(|| {
            // Beside our own binary by default.
            std::env::current_exe()
                .ok()
                .and_then(|path| {
                    let dir = path.parent()?;
                    Utf8PathBuf::from_path_buf(dir.join("zonewall-apid")).ok()
                })
                .unwrap_or_else(|| Utf8PathBuf::from("zonewall-apid"))
        });

        // The API plane's own capability token: process-local, never
        // written to the store file it cannot read anyway.
        let token = {
            let mut state = self.center.state.lock().unwrap();
            state.tokens.revoke("api-plane");
            state.tokens.issue_ephemeral(
                "api-plane".into(),
                [
                    zonewall_api::Permission::new(
                        zonewall_api::Resource::Config,
                        zonewall_api::Verb::Read,
                    ),
                    zonewall_api::Permission::new(
                        zonewall_api::Resource::Config,
                        zonewall_api::Verb::Write,
                    ),
                    zonewall_api::Permission::new(
                        zonewall_api::Resource::Firewall,
                        zonewall_api::Verb::Read,
                    ),
                    zonewall_api::Permission::new(
                        zonewall_api::Resource::Ipset,
                        zonewall_api::Verb::Read,
                    ),
                    zonewall_api::Permission::new(
                        zonewall_api::Resource::Ipset,
                        zonewall_api::Verb::Write,
                    ),
                    zonewall_api::Permission::new(
                        zonewall_api::Resource::Events,
                        zonewall_api::Verb::Read,
                    ),
                ]
                .into(),
            )
        };

        let mut command = tokio::process::Command::new(binary.as_std_path());
        command
            .env("ZONEWALL_CONTROL_SOCKET", config.control_socket_path())
            .env("ZONEWALL_API_LISTEN", config.api_plane.listen.to_string())
            .env("ZONEWALL_API_TOKEN", token)
            .kill_on_drop(true);

        match command.spawn() {
            Ok(child) => {
                info!("Spawned the API plane from '{binary}'");
                Some(child)
            }
            Err(err) => {
                warn!("Could not spawn the API plane from '{binary}': {err}");
                None
            }
        }
    }

    //--- Seamless upgrade

    async fn stage(
        &self,
        binary: &str,
        staged: &mut Option<Utf8PathBuf>,
    ) -> Result<OpResult, ApiError> {
        let path = Utf8PathBuf::from(binary);
        if !path.is_file() {
            return Err(ApiError::Validate {
                path: "upgrade.binary".into(),
                reason: format!("'{path}' is not a file"),
            });
        }

        // The replacement validates its own configuration before we let it
        // anywhere near the sockets.
        let check = tokio::process::Command::new(path.as_std_path())
            .arg("--check-config")
            .output()
            .await
            .map_err(|err| ApiError::Validate {
                path: "upgrade.binary".into(),
                reason: format!("could not run '{path}': {err}"),
            })?;
        if !check.status.success() {
            return Err(ApiError::Validate {
                path: "upgrade.binary".into(),
                reason: format!(
                    "'{path}' rejected the configuration: {}",
                    String::from_utf8_lossy(&check.stderr).trim()
                ),
            });
        }

        let version = tokio::process::Command::new(path.as_std_path())
            .arg("--version")
            .output()
            .await
            .ok()
            .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
            .unwrap_or_default();

        info!("Staged '{path}' ({version}) for upgrade");
        *staged = Some(path);
        Ok(OpResult::UpgradeStaged { version })
    }

    async fn swap(&self, staged: &mut Option<Utf8PathBuf>) -> Result<OpResult, ApiError> {
        let Some(binary) = staged.clone() else {
            return Err(ApiError::Conflict {
                reason: "no binary has been staged".into(),
            });
        };

        // The readiness pipe: the child writes one byte when its units are
        // up and it has assumed the listeners.
        let (ready_rx, ready_tx) = std::io::pipe().map_err(|err| ApiError::Internal {
            reason: format!("could not create the readiness pipe: {err}"),
        })?;

        clear_cloexec(self.control_fd.as_raw_fd());
        clear_cloexec(ready_tx.as_raw_fd());

        let mut command = std::process::Command::new(binary.as_std_path());
        command
            .env(CONTROL_FD_VAR, self.control_fd.as_raw_fd().to_string())
            .env(READY_FD_VAR, ready_tx.as_raw_fd().to_string());

        let mut child = command.spawn().map_err(|err| ApiError::Internal {
            reason: format!("could not spawn '{binary}': {err}"),
        })?;
        drop(ready_tx);

        // Wait for readiness on a blocking thread.
        let readiness = tokio::task::spawn_blocking(move || {
            let mut byte = [0u8; 1];
            let mut reader = ready_rx;
            reader.read_exact(&mut byte).is_ok()
        });

        let ready = tokio::time::timeout(UPGRADE_DEADLINE, readiness)
            .await
            .ok()
            .and_then(|joined| joined.ok())
            .unwrap_or(false);

        if !ready {
            warn!("The staged binary did not become ready; keeping this generation");
            let _ = child.kill();
            return Err(ApiError::Timeout);
        }

        info!("The next generation is ready; draining and exiting");
        self.center.notify(Event::UpgradeCompleted {
            version: env!("ZONEWALL_BUILD_VERSION").into(),
        });
        *staged = None;

        // Ask the main loop for an orderly shutdown; in-flight requests
        // drain before the process exits.
        unsafe {
            libc::raise(libc::SIGTERM);
        }
        Ok(OpResult::Done)
    }
}

async fn wait_child(child: &mut Option<tokio::process::Child>) -> std::io::Result<ExitStatus> {
    match child {
        Some(running) => {
            let status = running.wait().await;
            *child = None;
            status
        }
        None => std::future::pending().await,
    }
}

/// Let an fd survive exec.
fn clear_cloexec(fd: i32) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn signalled(signal: i32) -> ExitStatus {
        ExitStatus::from_raw(signal)
    }

    #[test]
    fn clean_exits_and_shutdown_signals_are_clean() {
        assert_eq!(classify(exit(0)), CrashKind::Clean);
        assert_eq!(classify(signalled(libc::SIGTERM)), CrashKind::Clean);
        assert_eq!(classify(signalled(libc::SIGINT)), CrashKind::Clean);
        assert_eq!(classify(signalled(libc::SIGHUP)), CrashKind::Clean);
    }

    #[test]
    fn fatal_signals_and_nonzero_exits_are_crashes() {
        assert_eq!(classify(exit(1)), CrashKind::Crash);
        assert_eq!(classify(exit(101)), CrashKind::Crash);
        assert_eq!(classify(signalled(libc::SIGKILL)), CrashKind::Crash);
        assert_eq!(classify(signalled(libc::SIGSEGV)), CrashKind::Crash);
        assert_eq!(classify(signalled(libc::SIGBUS)), CrashKind::Crash);
        assert_eq!(classify(signalled(libc::SIGABRT)), CrashKind::Crash);
    }

    #[test]
    fn the_window_promotes_at_the_threshold() {
        let mut window = CrashWindow::new(Duration::from_secs(300), 3);
        let base = jiff::Timestamp::UNIX_EPOCH;

        // Clean exits never count.
        for _ in 0..10 {
            assert!(!window.record(CrashKind::Clean, base));
        }

        assert!(!window.record(CrashKind::Crash, base));
        assert!(!window.record(
            CrashKind::Crash,
            base.checked_add(jiff::Span::new().seconds(60)).unwrap()
        ));
        assert!(window.record(
            CrashKind::Crash,
            base.checked_add(jiff::Span::new().seconds(120)).unwrap()
        ));
    }

    #[test]
    fn old_crashes_age_out_of_the_window() {
        let mut window = CrashWindow::new(Duration::from_secs(300), 3);
        let base = jiff::Timestamp::UNIX_EPOCH;

        assert!(!window.record(CrashKind::Crash, base));
        assert!(!window.record(
            CrashKind::Crash,
            base.checked_add(jiff::Span::new().seconds(10)).unwrap()
        ));
        // The third crash lands after the first two expired.
        assert!(!window.record(
            CrashKind::Crash,
            base.checked_add(jiff::Span::new().seconds(400)).unwrap()
        ));
    }

    #[test]
    fn history_round_trips_through_toml() {
        let mut window = CrashWindow::new(Duration::from_secs(300), 3);
        window.record(CrashKind::Crash, jiff::Timestamp::UNIX_EPOCH);

        let text = toml::to_string_pretty(&HistorySpec::build(&window)).unwrap();
        let spec: HistorySpec = toml::from_str(&text).unwrap();

        let mut restored = CrashWindow::new(Duration::from_secs(300), 3);
        spec.parse_into(&mut restored);
        assert_eq!(restored.crashes.len(), 1);
    }
}
