use camino::Utf8PathBuf;
use clap::builder::PossibleValue;
use clap::Parser;
use tracing::level_filters::LevelFilter;

use crate::client::ControlClient;
use crate::commands::Command;
use crate::CliError;

#[derive(Clone, Debug, Parser)]
#[command(version = env!("ZONEWALL_BUILD_VERSION"), disable_help_subcommand = true)]
pub struct Args {
    /// The control socket of the zonewalld instance to talk to
    #[arg(
        short = 's',
        long = "socket",
        value_name = "PATH",
        env = "ZONEWALL_SOCKET",
        default_value = "/run/zonewall/control.sock",
        global = true
    )]
    pub socket: Utf8PathBuf,

    /// The capability token authenticating this invocation
    #[arg(
        short = 't',
        long = "token",
        value_name = "TOKEN",
        env = "ZONEWALL_TOKEN",
        global = true
    )]
    pub token: Option<String>,

    /// The minimum severity of messages to log
    #[arg(
        long = "log-level",
        value_name = "LEVEL",
        default_value = "warning",
        global = true
    )]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    pub async fn execute(self) -> Result<(), CliError> {
        let client = ControlClient::new(self.socket, self.token);
        self.command.execute(client).await
    }
}

//----------- LogLevel ---------------------------------------------------------

/// A severity level for logging.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// A function or variable was interacted with, for debugging.
    Trace,

    /// Something occurred that may be relevant to debugging.
    Debug,

    /// Things are proceeding as expected.
    Info,

    /// Something does not appear to be correct.
    Warning,

    /// Something is definitely wrong.
    Error,
}

impl clap::ValueEnum for LogLevel {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            Self::Trace,
            Self::Debug,
            Self::Info,
            Self::Warning,
            Self::Error,
        ]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        Some(match self {
            Self::Trace => PossibleValue::new("trace"),
            Self::Debug => PossibleValue::new("debug"),
            Self::Info => PossibleValue::new("info"),
            Self::Warning => PossibleValue::new("warning"),
            Self::Error => PossibleValue::new("error"),
        })
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}
