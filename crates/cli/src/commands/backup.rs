use crate::api::msg::OpResult;
use crate::api::Op;
use crate::client::ControlClient;
use crate::commands::unexpected;
use crate::{ansi, println, CliError};

#[derive(Clone, Debug, clap::Subcommand)]
pub enum Backup {
    /// List retained generations
    List,

    /// Retain the running generation as a backup
    Create {
        /// A label to remember it by
        #[arg(long)]
        label: Option<String>,
    },

    /// Re-apply a retained generation
    Restore { id: u64 },
}

impl Backup {
    pub async fn execute(self, mut client: ControlClient) -> Result<(), CliError> {
        match self {
            Self::List => {
                let result = client.call(Op::BackupList).await?;
                let OpResult::Backups { backups } = result else {
                    return Err(unexpected(result));
                };
                if backups.is_empty() {
                    println!("No retained generations.");
                    return Ok(());
                }
                for backup in backups {
                    let label = backup.label.as_deref().unwrap_or("-");
                    println!(
                        "{:>4}  {}  {}  {label}",
                        backup.id,
                        backup.created.strftime("%Y-%m-%d %H:%M:%S"),
                        backup.fingerprint,
                    );
                }
            }

            Self::Create { label } => {
                let result = client.call(Op::BackupCreate { label }).await?;
                let OpResult::BackupCreated { id } = result else {
                    return Err(unexpected(result));
                };
                println!("Retained generation {id}");
            }

            Self::Restore { id } => {
                let result = client.call(Op::BackupRestore { id }).await?;
                let OpResult::Applied { generation, .. } = result else {
                    return Err(unexpected(result));
                };
                println!(
                    "{}Restored{}: live as generation {generation}",
                    ansi::GREEN,
                    ansi::RESET
                );
            }
        }
        Ok(())
    }
}
