use camino::Utf8PathBuf;

use crate::api::msg::OpResult;
use crate::api::{ApiError, Op};
use crate::client::ControlClient;
use crate::commands::unexpected;
use crate::{ansi, println, CliError};

#[derive(Clone, Debug, clap::Subcommand)]
pub enum Config {
    /// Print the live configuration (sensitive fields masked)
    Get,

    /// Validate, compile and commit a configuration document
    Apply {
        /// The document to apply; '-' reads standard input
        file: Utf8PathBuf,

        /// Commit even if this severs your own management path
        #[arg(long)]
        override_lockout: bool,

        /// Roll back automatically unless confirmed within SECS
        #[arg(long, value_name = "SECS")]
        safe: Option<u64>,
    },

    /// Confirm a pending safe apply
    Confirm,

    /// Show what applying a document would change
    Diff {
        /// The candidate document; '-' reads standard input
        file: Utf8PathBuf,
    },
}

fn read_document(file: &Utf8PathBuf) -> Result<String, CliError> {
    let result = if file == "-" {
        use std::io::Read;
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .map(|_| text)
    } else {
        std::fs::read_to_string(file.as_std_path())
    };
    result.map_err(|err| ApiError::Internal {
        reason: format!("could not read '{file}': {err}"),
    })
}

impl Config {
    pub async fn execute(self, mut client: ControlClient) -> Result<(), CliError> {
        match self {
            Self::Get => {
                let result = client.call(Op::ConfigGet).await?;
                let OpResult::Config {
                    document,
                    generation,
                } = result
                else {
                    return Err(unexpected(result));
                };
                println!("# generation {generation}");
                println!("{document}");
            }

            Self::Apply {
                file,
                override_lockout,
                safe,
            } => {
                let document = read_document(&file)?;
                let op = match safe {
                    Some(rollback_secs) => Op::ConfigSafeApply {
                        document,
                        rollback_secs,
                        override_lockout,
                    },
                    None => Op::ConfigApply {
                        document,
                        override_lockout,
                    },
                };

                match client.call(op).await? {
                    OpResult::Applied {
                        generation,
                        fingerprint,
                    } => {
                        println!(
                            "{}Committed{} generation {generation} ({fingerprint})",
                            ansi::GREEN,
                            ansi::RESET
                        );
                    }
                    OpResult::Pending {
                        generation,
                        rollback_secs,
                        ..
                    } => {
                        println!(
                            "{}Live{} generation {generation}; confirm within {rollback_secs}s \
                             with 'zonewall config confirm' or it rolls back",
                            ansi::YELLOW,
                            ansi::RESET
                        );
                    }
                    other => return Err(unexpected(other)),
                }
            }

            Self::Confirm => {
                let result = client.call(Op::ConfigConfirm).await?;
                let OpResult::Confirmed { generation } = result else {
                    return Err(unexpected(result));
                };
                println!(
                    "{}Confirmed{} generation {generation}",
                    ansi::GREEN,
                    ansi::RESET
                );
            }

            Self::Diff { file } => {
                let document = read_document(&file)?;
                let result = client.call(Op::ConfigDiff { document }).await?;
                let OpResult::Diff { summary, .. } = result else {
                    return Err(unexpected(result));
                };
                println!("{}", summary.trim_end());
            }
        }
        Ok(())
    }
}
