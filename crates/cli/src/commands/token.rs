//! Capability token management.
//!
//! Tokens live in the daemon's token store file, which only root can read;
//! this command edits that file in place, so it works even when the daemon
//! is down.  The daemon re-reads the store when it sees an unknown secret,
//! so freshly issued tokens work without a restart.

use std::collections::BTreeSet;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::api::{ApiError, CapabilityToken, Permission};
use crate::{println, CliError};

#[derive(Clone, Debug, clap::Subcommand)]
pub enum Token {
    /// Issue a new token and print its secret once
    Create {
        /// Who the token is for
        #[arg(long)]
        principal: String,

        /// Granted permissions, e.g. 'config:read' (repeatable)
        #[arg(long = "permission", value_name = "RESOURCE:VERB", required = true)]
        permissions: Vec<String>,

        /// Expiry as an RFC 3339 timestamp
        #[arg(long)]
        expires: Option<String>,

        /// The token store file
        #[arg(long, default_value = "/var/lib/zonewall/tokens.toml")]
        store: Utf8PathBuf,
    },

    /// Revoke every token issued to a principal
    Revoke {
        principal: String,

        /// The token store file
        #[arg(long, default_value = "/var/lib/zonewall/tokens.toml")]
        store: Utf8PathBuf,
    },

    /// List issued tokens (secrets are never shown)
    List {
        /// The token store file
        #[arg(long, default_value = "/var/lib/zonewall/tokens.toml")]
        store: Utf8PathBuf,
    },
}

//--- The store file (the daemon's on-disk format)

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
struct StoreSpec {
    token: Vec<TokenSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct TokenSpec {
    secret: String,
    principal: String,
    permissions: BTreeSet<Permission>,
    expiry: Option<jiff::Timestamp>,
}

fn load(store: &Utf8PathBuf) -> Result<StoreSpec, CliError> {
    match std::fs::read_to_string(store.as_std_path()) {
        Ok(text) => toml::from_str(&text).map_err(|err| ApiError::Internal {
            reason: format!("'{store}' is not a valid token store: {err}"),
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(StoreSpec::default()),
        Err(err) => Err(ApiError::Internal {
            reason: format!("could not read '{store}': {err}"),
        }),
    }
}

fn save(store: &Utf8PathBuf, spec: &StoreSpec) -> Result<(), CliError> {
    let text = toml::to_string_pretty(spec).map_err(|err| ApiError::Internal {
        reason: format!("could not render the token store: {err}"),
    })?;
    std::fs::write(store.as_std_path(), text).map_err(|err| ApiError::Internal {
        reason: format!("could not write '{store}': {err}"),
    })
}

fn fresh_secret() -> String {
    use ring::rand::{SecureRandom, SystemRandom};

    let mut bytes = [0u8; 32];
    SystemRandom::new()
        .fill(&mut bytes)
        .expect("the OS entropy source works");
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl Token {
    pub async fn execute(self) -> Result<(), CliError> {
        match self {
            Self::Create {
                principal,
                permissions,
                expires,
                store,
            } => {
                let permissions = permissions
                    .iter()
                    .map(|text| text.parse::<Permission>())
                    .collect::<Result<BTreeSet<_>, _>>()
                    .map_err(|err| ApiError::Validate {
                        path: "permission".into(),
                        reason: err.to_string(),
                    })?;

                let expiry = expires
                    .map(|text| {
                        text.parse::<jiff::Timestamp>()
                            .map_err(|err| ApiError::Validate {
                                path: "expires".into(),
                                reason: err.to_string(),
                            })
                    })
                    .transpose()?;

                let mut spec = load(&store)?;
                let secret = fresh_secret();
                spec.token.push(TokenSpec {
                    secret: secret.clone(),
                    principal: principal.clone(),
                    permissions,
                    expiry,
                });
                save(&store, &spec)?;

                println!("Issued a token for '{principal}'.");
                println!("The secret is shown exactly once:");
                println!("{secret}");
            }

            Self::Revoke { principal, store } => {
                let mut spec = load(&store)?;
                let before = spec.token.len();
                spec.token.retain(|token| token.principal != principal);
                let removed = before - spec.token.len();
                save(&store, &spec)?;
                println!("Revoked {removed} token(s) for '{principal}'");
            }

            Self::List { store } => {
                let spec = load(&store)?;
                if spec.token.is_empty() {
                    println!("No tokens issued.");
                    return Ok(());
                }
                for token in &spec.token {
                    let info = CapabilityToken {
                        principal: token.principal.clone(),
                        permissions: token.permissions.clone(),
                        expiry: token.expiry,
                    };
                    let perms: Vec<String> = info
                        .permissions
                        .iter()
                        .map(|perm| perm.to_string())
                        .collect();
                    let expiry = info
                        .expiry
                        .map(|at| at.to_string())
                        .unwrap_or_else(|| "never".into());
                    println!(
                        "{:<16} expires {:<24} {}",
                        info.principal,
                        expiry,
                        perms.join(", ")
                    );
                }
            }
        }
        Ok(())
    }
}
