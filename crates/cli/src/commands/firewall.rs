use crate::api::msg::OpResult;
use crate::api::Op;
use crate::client::ControlClient;
use crate::commands::unexpected;
use crate::{println, CliError};

#[derive(Clone, Debug, clap::Subcommand)]
pub enum Firewall {
    /// Print the live compiled ruleset
    Show,

    /// Print the per-zone traffic counters
    Counters,
}

impl Firewall {
    pub async fn execute(self, mut client: ControlClient) -> Result<(), CliError> {
        match self {
            Self::Show => {
                let result = client.call(Op::FirewallShow).await?;
                let OpResult::Ruleset {
                    generation,
                    fingerprint,
                    text,
                } = result
                else {
                    return Err(unexpected(result));
                };
                println!("# generation {generation}, fingerprint {fingerprint}");
                println!("{}", text.trim_end());
            }

            Self::Counters => {
                let result = client.call(Op::FirewallCounters).await?;
                let OpResult::Counters { counters } = result else {
                    return Err(unexpected(result));
                };
                if counters.is_empty() {
                    println!("No counters (is a ruleset applied?)");
                    return Ok(());
                }
                println!("{:<32} {:>12} {:>14}", "counter", "packets", "bytes");
                for counter in counters {
                    println!(
                        "{:<32} {:>12} {:>14}",
                        counter.name, counter.packets, counter.bytes
                    );
                }
            }
        }
        Ok(())
    }
}
