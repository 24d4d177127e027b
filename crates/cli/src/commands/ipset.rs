use crate::api::msg::OpResult;
use crate::api::Op;
use crate::client::ControlClient;
use crate::commands::unexpected;
use crate::{println, CliError};

#[derive(Clone, Debug, clap::Subcommand)]
pub enum Ipset {
    /// List the managed address sets
    List,

    /// Print the elements of a set
    Show { name: String },

    /// Add an element to a runtime set
    Add { name: String, element: String },

    /// Remove an element from a runtime set
    Remove { name: String, element: String },

    /// Drop all elements of a runtime set
    Flush { name: String },
}

impl Ipset {
    pub async fn execute(self, mut client: ControlClient) -> Result<(), CliError> {
        match self {
            Self::List => {
                let result = client.call(Op::IpsetList).await?;
                let OpResult::Sets { sets } = result else {
                    return Err(unexpected(result));
                };
                if sets.is_empty() {
                    println!("No managed sets.");
                    return Ok(());
                }
                println!("{:<24} {:<8} {:>9}  persistent", "name", "kind", "elements");
                for set in sets {
                    println!(
                        "{:<24} {:<8} {:>9}  {}",
                        set.name,
                        set.kind,
                        set.elements,
                        if set.persistent { "yes" } else { "no" }
                    );
                }
            }

            Self::Show { name } => {
                let result = client.call(Op::IpsetShow { name }).await?;
                let OpResult::SetElements { elements, .. } = result else {
                    return Err(unexpected(result));
                };
                for element in elements {
                    println!("{element}");
                }
            }

            Self::Add { name, element } => {
                client.call(Op::IpsetAdd { name, element }).await?;
            }

            Self::Remove { name, element } => {
                client.call(Op::IpsetRemove { name, element }).await?;
            }

            Self::Flush { name } => {
                client.call(Op::IpsetFlush { name }).await?;
            }
        }
        Ok(())
    }
}
