use crate::api::Event;
use crate::client::ControlClient;
use crate::{ansi, println, CliError};

#[derive(Clone, Debug, clap::Args)]
pub struct Events {}

impl Events {
    pub async fn execute(self, mut client: ControlClient) -> Result<(), CliError> {
        client
            .subscribe(|event| {
                let now = jiff::Zoned::now().strftime("%H:%M:%S");
                match event {
                    Event::Applied {
                        generation,
                        fingerprint,
                    } => {
                        println!("{now}  applied generation {generation} ({fingerprint})");
                    }
                    Event::Confirmed { generation } => {
                        println!("{now}  confirmed generation {generation}");
                    }
                    Event::RolledBack { generation, reason } => {
                        println!(
                            "{now}  {}rolled back{} generation {generation}: {reason}",
                            ansi::YELLOW,
                            ansi::RESET
                        );
                    }
                    Event::Tampering { actor, summary } => {
                        println!(
                            "{now}  {}tampering{} by {actor}: {summary}",
                            ansi::RED,
                            ansi::RESET
                        );
                    }
                    Event::SafeModeEntered { reason } => {
                        println!("{now}  {}safe mode{}: {reason}", ansi::RED, ansi::RESET);
                    }
                    Event::SafeModeCleared => {
                        println!("{now}  {}safe mode cleared{}", ansi::GREEN, ansi::RESET);
                    }
                    Event::UplinkChanged { group, active } => {
                        println!(
                            "{now}  uplink group '{group}' active: {}",
                            active.as_deref().unwrap_or("<none>")
                        );
                    }
                    Event::SetUpdated { name, elements } => {
                        println!("{now}  set '{name}' now holds {elements} elements");
                    }
                    Event::Service { subsystem, detail } => {
                        println!("{now}  {subsystem}: {detail}");
                    }
                    Event::UpgradeCompleted { version } => {
                        println!("{now}  upgraded to {version}");
                    }
                }
            })
            .await
    }
}
