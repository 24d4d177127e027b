//! Logging from Zonewall.

use std::fmt;
use std::os::unix::net::UnixDatagram;

use tracing::field::{self, Field};
use tracing::{Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::Layer as FmtLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload::Handle;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

use camino::Utf8Path;

use crate::config::{LogLevel, LogTarget, LoggingConfig};

//----------- Logger -----------------------------------------------------------

/// The state of the Zonewall logger.
///
/// The output target is fixed at launch; the filter can be swapped at
/// runtime when the configuration is reloaded.
pub struct Logger {
    filter: Handle<EnvFilter, Registry>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("filter", &self.filter)
            .finish()
    }
}

impl Logger {
    /// Launch the Zonewall logger.
    ///
    /// ## Panics
    ///
    /// Panics if a global [`tracing`] logger has been set already.
    pub fn launch(config: &LoggingConfig, log_dir: &Utf8Path) -> Result<&'static Logger, String> {
        let filter = make_env_filter(config)?;

        // A reload layer is tracing's way of making it possible to change
        // values at runtime. It gives us a handle we can use to update the
        // EnvFilter when the config changes.
        let (filter, filter_handle) = reload::Layer::new(filter);

        match config.target.resolved(log_dir) {
            LogTarget::File(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path.as_std_path())
                    .map_err(|err| format!("could not open log file '{path}': {err}"))?;

                // Files never get ANSI colors.
                let layer = FmtLayer::new().with_ansi(false).with_writer(file);
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .init()
            }
            LogTarget::Syslog => {
                let layer = Syslog::connect().map_err(|err| err.to_string())?;
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .init()
            }
            LogTarget::Stdout => {
                // We try to determine whether to use colors in a bit more
                // fancy way than tracing does automatically (it only does
                // `NO_COLOR`).
                let layer = FmtLayer::new()
                    .with_ansi(supports_color::on(supports_color::Stream::Stdout).is_some())
                    .with_writer(std::io::stdout);
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .init()
            }
            LogTarget::Stderr => {
                let layer = FmtLayer::new()
                    .with_ansi(supports_color::on(supports_color::Stream::Stderr).is_some())
                    .with_writer(std::io::stderr);
                tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .init()
            }
        };

        Ok(Box::leak(Box::new(Self {
            filter: filter_handle,
        })))
    }

    /// Apply a reloaded logging configuration.
    ///
    /// Only the filter changes at runtime; a changed target takes effect on
    /// the next daemon start.
    pub fn apply(&self, config: &LoggingConfig) -> Result<(), String> {
        self.filter
            .reload(make_env_filter(config)?)
            .map_err(|_| "could not reload filter".into())
    }
}

/// Make a new [`EnvFilter`] based on the config.
///
/// Every time we load the config, we have to create a new [`EnvFilter`]
/// based on the new config settings.
fn make_env_filter(config: &LoggingConfig) -> Result<EnvFilter, String> {
    // Create an EnvFilter which won't read any env vars, then override its
    // default level with the configured one.
    let mut filter = EnvFilter::default();
    filter = filter.add_directive(LevelFilter::from(config.level).into());

    // Add all of our trace targets to the filter.
    for target in &config.trace_targets {
        filter = filter.add_directive(
            target
                .parse()
                .map_err(|_| format!("invalid trace target: '{target}'"))?,
        );
    }

    Ok(filter)
}

impl From<LogLevel> for LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

//----------- Syslog -----------------------------------------------------------

/// Where Linux syslog daemons listen for the local datagram protocol.
const SYSLOG_SOCKETS: [&str; 2] = ["/dev/log", "/var/run/syslog"];

/// RFC 3164 facility 3: system daemons.
const FACILITY_DAEMON: u8 = 3;

/// A minimal [RFC 3164] syslog layer.
///
/// Zonewall only runs on Linux routers, so the local datagram socket is
/// the only transport: every Linux syslog daemon provides it, and it
/// cannot block the way a stream transport can.
///
/// [RFC 3164]: https://www.rfc-editor.org/rfc/rfc3164
struct Syslog {
    socket: UnixDatagram,
    hostname: String,

    /// The RFC 3164 TAG: `name[pid]`.
    ident: String,
}

impl Syslog {
    /// Connect to the local syslog daemon.
    fn connect() -> std::io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        let mut connect_err = std::io::Error::from(std::io::ErrorKind::NotFound);
        let connected = SYSLOG_SOCKETS.iter().any(|path| {
            match socket.connect(path) {
                Ok(()) => true,
                Err(err) => {
                    connect_err = err;
                    false
                }
            }
        });
        if !connected {
            return Err(connect_err);
        }

        let name = std::env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "zonewalld".into());

        Ok(Self {
            socket,
            hostname: hostname::get()
                .map(|host| host.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ident: format!("{name}[{}]", std::process::id()),
        })
    }
}

// A Layer rather than a subscriber: only `on_event` matters here.
impl<S: Subscriber> Layer<S> for Syslog {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // RFC 3164 priority: facility * 8 + severity, with the severity
        // taken from the tracing level.
        let severity = match *event.metadata().level() {
            Level::ERROR => 3,
            Level::WARN => 4,
            Level::INFO => 6,
            Level::DEBUG | Level::TRACE => 7,
        };
        let prival = FACILITY_DAEMON << 3 | severity;

        // The RFC 3164 timestamp: "Mmm dd hh:mm:ss" in local time, the
        // day padded to two characters with a space.
        let stamp = jiff::Zoned::now().strftime("%b %e %T");

        let mut line = format!("<{prival}>{stamp} {} {}: ", self.hostname, self.ident);
        event.record(&mut MessageVisitor(&mut line));

        // A firewall must not die because the log socket hiccuped; a
        // dropped line is the lesser harm.
        let _ = self.socket.send(line.as_bytes());
    }
}

/// Extracts the `message` field, which tracing (being fully structured)
/// hides in the structured data.
struct MessageVisitor<'a>(&'a mut String);

impl field::Visit for MessageVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0.push_str(value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        use std::fmt::Write;

        if field.name() == "message" {
            let _ = write!(self.0, "{value:?}");
        }
    }
}
