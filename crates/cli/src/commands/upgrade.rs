use camino::Utf8PathBuf;

use crate::api::msg::OpResult;
use crate::api::Op;
use crate::client::ControlClient;
use crate::commands::unexpected;
use crate::{ansi, println, CliError};

#[derive(Clone, Debug, clap::Subcommand)]
pub enum Upgrade {
    /// Validate and stage a replacement binary
    Stage { binary: Utf8PathBuf },

    /// Hand the listeners to the staged binary
    Swap,
}

impl Upgrade {
    pub async fn execute(self, mut client: ControlClient) -> Result<(), CliError> {
        match self {
            Self::Stage { binary } => {
                let result = client
                    .call(Op::UpgradeStage {
                        binary: binary.into_string(),
                    })
                    .await?;
                let OpResult::UpgradeStaged { version } = result else {
                    return Err(unexpected(result));
                };
                println!("Staged {version}; run 'zonewall upgrade swap' to hand over");
            }

            Self::Swap => {
                client.call(Op::UpgradeSwap).await?;
                println!(
                    "{}Swapped{}: the new generation owns the listeners",
                    ansi::GREEN,
                    ansi::RESET
                );
            }
        }
        Ok(())
    }
}
