use crate::api::msg::OpResult;
use crate::api::Op;
use crate::client::ControlClient;
use crate::commands::unexpected;
use crate::{ansi, println, CliError};

#[derive(Clone, Debug, clap::Args)]
pub struct Status {}

impl Status {
    pub async fn execute(self, mut client: ControlClient) -> Result<(), CliError> {
        let result = client.call(Op::Health).await?;
        let OpResult::Health(health) = result else {
            return Err(unexpected(result));
        };

        match health.generation {
            Some(generation) => println!("Live generation:  {generation}"),
            None => println!("Live generation:  none (nothing applied yet)"),
        }

        if health.safe_mode {
            println!(
                "Mode:             {}SAFE MODE{} (admin traffic only)",
                ansi::RED,
                ansi::RESET
            );
        } else {
            println!("Mode:             {}normal{}", ansi::GREEN, ansi::RESET);
        }

        let uptime = jiff::SignedDuration::from_secs(health.uptime_secs as i64);
        println!("Uptime:           {uptime:#}");
        Ok(())
    }
}
