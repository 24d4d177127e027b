//! The install environment and daemon configuration.
//!
//! Everything here is resolved once at process start and immutable after:
//! the install prefix and directory overrides from the environment, the
//! command line, and the daemon settings file.  Units receive it by
//! reference through the [`Center`]; nothing mutates it after init.
//!
//! The *firewall document* (zones, policies, NAT, ...) is not part of this
//! module; it lives at [`Config::document_path`] and is parsed by
//! [`crate::doc`].
//!
//! [`Center`]: crate::center::Center

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// The environment variable relocating the entire install.
const PREFIX_VAR: &str = "ZONEWALL_PREFIX";

/// Per-directory overrides; each takes precedence over the prefix.
const CONFIG_DIR_VAR: &str = "ZONEWALL_CONFIG_DIR";
const STATE_DIR_VAR: &str = "ZONEWALL_STATE_DIR";
const RUN_DIR_VAR: &str = "ZONEWALL_RUN_DIR";
const LOG_DIR_VAR: &str = "ZONEWALL_LOG_DIR";

//----------- Config -----------------------------------------------------------

/// The resolved install environment and daemon settings.
#[derive(Clone, Debug)]
pub struct Config {
    /// Where configuration lives (the document, the settings file).
    pub config_dir: Utf8PathBuf,

    /// Where persistent state lives (generations, caches, token store).
    pub state_dir: Utf8PathBuf,

    /// Where runtime artifacts live (control socket, pid file).
    pub run_dir: Utf8PathBuf,

    /// Where file logs go, if file logging is selected.
    pub log_dir: Utf8PathBuf,

    /// Daemon behavior.
    pub daemon: DaemonConfig,

    /// The API plane child process.
    pub api_plane: ApiPlaneConfig,
}

impl Config {
    /// Register the command-line arguments this module consumes.
    pub fn setup_cli(cmd: clap::Command) -> clap::Command {
        cmd.arg(
            clap::Arg::new("config_dir")
                .long("config-dir")
                .value_name("DIR")
                .help("Read configuration from this directory"),
        )
    }

    /// Resolve the install environment.
    ///
    /// Resolution order for each directory: the explicit environment
    /// override, then the prefix, then the stock FHS location.
    pub fn init(matches: &clap::ArgMatches) -> Result<Self, String> {
        let prefix = std::env::var(PREFIX_VAR).ok().map(Utf8PathBuf::from);

        let dir = |override_var: &str, prefixed: &str, stock: &str| -> Utf8PathBuf {
            if let Ok(path) = std::env::var(override_var) {
                return Utf8PathBuf::from(path);
            }
            match &prefix {
                Some(prefix) => prefix.join(prefixed),
                None => Utf8PathBuf::from(stock),
            }
        };

        let mut config_dir = dir(CONFIG_DIR_VAR, "etc/zonewall", "/etc/zonewall");
        if let Some(arg) = matches.get_one::<String>("config_dir") {
            config_dir = Utf8PathBuf::from(arg);
        }

        Ok(Self {
            config_dir,
            state_dir: dir(STATE_DIR_VAR, "var/lib/zonewall", "/var/lib/zonewall"),
            run_dir: dir(RUN_DIR_VAR, "run/zonewall", "/run/zonewall"),
            log_dir: dir(LOG_DIR_VAR, "var/log/zonewall", "/var/log/zonewall"),
            daemon: DaemonConfig::default(),
            api_plane: ApiPlaneConfig::default(),
        })
    }

    /// Load the daemon settings file, if present.
    pub fn init_from_file(&mut self) -> Result<(), String> {
        let path = self.settings_path();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(format!("could not read '{path}': {err}")),
        };

        let spec: SettingsSpec =
            toml::from_str(&text).map_err(|err| format!("could not parse '{path}': {err}"))?;
        if let Some(daemon) = spec.daemon {
            self.daemon = daemon;
        }
        if let Some(api_plane) = spec.api_plane {
            self.api_plane = api_plane;
        }
        Ok(())
    }

    /// The daemon settings file.
    pub fn settings_path(&self) -> Utf8PathBuf {
        self.config_dir.join("config.toml")
    }

    /// The firewall configuration document.
    pub fn document_path(&self) -> Utf8PathBuf {
        self.config_dir.join("zonewall.conf")
    }

    /// The control socket.
    pub fn control_socket_path(&self) -> Utf8PathBuf {
        self.run_dir.join(zonewall_api::CONTROL_SOCKET_NAME)
    }

    /// The daemon state file.
    pub fn state_file(&self) -> Utf8PathBuf {
        self.state_dir.join("state.toml")
    }

    /// Where retained generations are kept.
    pub fn generations_dir(&self) -> Utf8PathBuf {
        self.state_dir.join("generations")
    }

    /// Where dynamic-set caches are kept.
    pub fn set_cache_dir(&self) -> Utf8PathBuf {
        self.state_dir.join("sets")
    }

    /// The crash history file.
    pub fn crash_history_path(&self) -> Utf8PathBuf {
        self.state_dir.join("crash_history.toml")
    }

    /// The capability token store.
    pub fn token_store_path(&self) -> Utf8PathBuf {
        self.state_dir.join("tokens.toml")
    }
}

/// The shape of the settings file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct SettingsSpec {
    daemon: Option<DaemonConfig>,
    api_plane: Option<ApiPlaneConfig>,
}

//----------- DaemonConfig -----------------------------------------------------

/// Daemon behavior settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct DaemonConfig {
    /// Whether to fork into the background.
    pub daemonize: bool,

    /// The pid file, written after daemonizing.
    pub pid_file: Option<Utf8PathBuf>,

    /// The user and group to drop privileges to.
    ///
    /// The control plane keeps CAP_NET_ADMIN either way; this only affects
    /// file ownership and the API plane's credentials.
    pub identity: Option<(String, String)>,

    /// Logging setup.
    pub logging: LoggingConfig,

    /// How many crashes within the window promote to safe mode.
    pub crash_threshold: usize,

    /// The crash counting window, in seconds.
    pub crash_window_secs: u64,

    /// Disable the supervisor and timers that interfere with tests.
    pub test_mode: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemonize: false,
            pid_file: None,
            identity: None,
            logging: LoggingConfig::default(),
            crash_threshold: 3,
            crash_window_secs: 300,
            test_mode: false,
        }
    }
}

impl DaemonConfig {
    /// The crash counting window.
    pub fn crash_window(&self) -> Duration {
        Duration::from_secs(self.crash_window_secs)
    }
}

//----------- ApiPlaneConfig ---------------------------------------------------

/// Settings for the unprivileged API plane child.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ApiPlaneConfig {
    /// Whether to run the API plane at all.
    pub enabled: bool,

    /// The HTTP listen address inside the API plane's namespace.
    pub listen: SocketAddr,

    /// The binary to spawn; defaults to `zonewall-apid` beside the daemon.
    pub binary: Option<Utf8PathBuf>,
}

impl Default for ApiPlaneConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:8443".parse().expect("a valid literal"),
            binary: None,
        }
    }
}

//----------- LoggingConfig ----------------------------------------------------

/// Logging setup.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// The minimum severity of messages to log.
    pub level: LogLevel,

    /// Where log output goes.
    pub target: LogTarget,

    /// Additional per-module filter directives.
    pub trace_targets: Vec<String>,
}

/// A severity level for logging.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            _ => Err(format!("unknown log level '{s}'")),
        }
    }
}

/// Where log output goes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogTarget {
    /// A file under the log directory.
    File(Utf8PathBuf),

    /// The system log.
    Syslog,

    Stdout,

    #[default]
    Stderr,
}

impl LogTarget {
    /// Resolve a relative file target against the log directory.
    pub fn resolved(&self, log_dir: &Utf8Path) -> Self {
        match self {
            Self::File(path) if path.is_relative() => Self::File(log_dir.join(path)),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_with_env(vars: &[(&str, &str)]) -> Config {
        for (key, value) in vars {
            // SAFETY: env-mutating tests share one test function, so there
            // is no concurrent access.
            unsafe { std::env::set_var(key, value) };
        }
        let cmd = Config::setup_cli(clap::Command::new("test"));
        let matches = cmd.get_matches_from(["test"]);
        let config = Config::init(&matches).unwrap();
        for (key, _) in vars {
            unsafe { std::env::remove_var(key) };
        }
        config
    }

    #[test]
    fn prefix_and_overrides_relocate_directories() {
        let config = init_with_env(&[(PREFIX_VAR, "/opt/zw")]);
        assert_eq!(config.config_dir, "/opt/zw/etc/zonewall");
        assert_eq!(config.state_dir, "/opt/zw/var/lib/zonewall");
        assert_eq!(config.run_dir, "/opt/zw/run/zonewall");

        // An explicit per-directory override beats the prefix.
        let config = init_with_env(&[(PREFIX_VAR, "/opt/zw"), (STATE_DIR_VAR, "/srv/state")]);
        assert_eq!(config.state_dir, "/srv/state");
        assert_eq!(config.config_dir, "/opt/zw/etc/zonewall");
    }

    #[test]
    fn crash_defaults_are_three_in_five_minutes() {
        let daemon = DaemonConfig::default();
        assert_eq!(daemon.crash_threshold, 3);
        assert_eq!(daemon.crash_window(), Duration::from_secs(300));
    }
}
