use crate::client::ControlClient;
use crate::CliError;

mod backup;
mod config;
mod events;
mod firewall;
mod ipset;
mod status;
mod token;
mod upgrade;

#[derive(Clone, Debug, clap::Subcommand)]
pub enum Command {
    /// Inspect and change the configuration
    #[command(subcommand)]
    Config(config::Config),

    /// Inspect the live firewall ruleset
    #[command(subcommand)]
    Firewall(firewall::Firewall),

    /// Inspect and mutate runtime address sets
    #[command(subcommand)]
    Ipset(ipset::Ipset),

    /// Manage retained configuration generations
    #[command(subcommand)]
    Backup(backup::Backup),

    /// Seamlessly upgrade the running daemon
    #[command(subcommand)]
    Upgrade(upgrade::Upgrade),

    /// Manage capability tokens (edits the token store as root)
    #[command(subcommand)]
    Token(token::Token),

    /// Show daemon status
    Status(status::Status),

    /// Follow the daemon's event feed
    Events(events::Events),
}

impl Command {
    pub async fn execute(self, client: ControlClient) -> Result<(), CliError> {
        match self {
            Self::Config(cmd) => cmd.execute(client).await,
            Self::Firewall(cmd) => cmd.execute(client).await,
            Self::Ipset(cmd) => cmd.execute(client).await,
            Self::Backup(cmd) => cmd.execute(client).await,
            Self::Upgrade(cmd) => cmd.execute(client).await,
            Self::Token(cmd) => cmd.execute().await,
            Self::Status(cmd) => cmd.execute(client).await,
            Self::Events(cmd) => cmd.execute(client).await,
        }
    }
}

/// An operation answered with a result the command did not expect.
pub(crate) fn unexpected(result: crate::api::msg::OpResult) -> CliError {
    crate::api::ApiError::Internal {
        reason: format!("unexpected answer from zonewalld: {result:?}"),
    }
}
