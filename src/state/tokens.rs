//! The capability token store.
//!
//! Tokens are issued by the operator (via `zonewall token create`, which
//! edits the store file as root) and validated by the control plane on every
//! request.  The API plane never sees this file; its own token is passed in
//! its environment at spawn.

use std::collections::BTreeSet;
use std::io;

use camino::Utf8Path;
use foldhash::HashMap;
use serde::{Deserialize, Serialize};

use zonewall_api::{CapabilityToken, Permission};

//----------- TokenStore -------------------------------------------------------

/// The set of issued capability tokens, keyed by secret.
#[derive(Clone, Debug, Default)]
pub struct TokenStore {
    tokens: HashMap<String, CapabilityToken>,

    /// Secrets that exist only in this process (the API plane's spawn
    /// token).  They survive a reload from disk and are never written out.
    ephemeral: foldhash::HashSet<String>,
}

impl TokenStore {
    /// Look a secret up.
    pub fn resolve(&self, secret: &str) -> Option<&CapabilityToken> {
        self.tokens.get(secret)
    }

    /// Issue a new token.  Returns the generated secret.
    pub fn issue(
        &mut self,
        principal: String,
        permissions: BTreeSet<Permission>,
        expiry: Option<jiff::Timestamp>,
    ) -> String {
        let secret = crate::util::random_secret();
        self.tokens.insert(
            secret.clone(),
            CapabilityToken {
                principal,
                permissions,
                expiry,
            },
        );
        secret
    }

    /// Issue a token that lives only in this process.
    pub fn issue_ephemeral(
        &mut self,
        principal: String,
        permissions: BTreeSet<Permission>,
    ) -> String {
        let secret = self.issue(principal, permissions, None);
        self.ephemeral.insert(secret.clone());
        secret
    }

    /// Revoke every token issued to a principal.  Returns how many fell.
    pub fn revoke(&mut self, principal: &str) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, token| token.principal != principal);
        before - self.tokens.len()
    }

    /// Replace the file-backed tokens with a freshly loaded store.
    ///
    /// Ephemeral tokens are kept: they were never in the file, so a reload
    /// must not revoke them.
    pub fn reload_from(&mut self, spec: Spec) {
        let ephemeral = std::mem::take(&mut self.ephemeral);
        let mut kept: Vec<(String, CapabilityToken)> = self
            .tokens
            .drain()
            .filter(|(secret, _)| ephemeral.contains(secret))
            .collect();

        *self = spec.parse();
        self.ephemeral = ephemeral;
        for (secret, token) in kept.drain(..) {
            self.tokens.insert(secret, token);
        }
    }

    /// The issued tokens, for listing (secrets are not exposed).
    pub fn principals(&self) -> Vec<&CapabilityToken> {
        let mut tokens: Vec<_> = self.tokens.values().collect();
        tokens.sort_by(|a, b| a.principal.cmp(&b.principal));
        tokens
    }
}

//--- Loading / Saving

/// The token store file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Spec {
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

impl Spec {
    /// Load and parse this specification from a file.
    pub fn load(path: &Utf8Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    /// Build and save this specification to a file.
    pub fn save(&self, path: &Utf8Path) -> io::Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        crate::util::write_file(path, text.as_bytes())
    }

    /// Parse into a live store.
    pub fn parse(self) -> TokenStore {
        let mut tokens = HashMap::default();
        for entry in self.token {
            tokens.insert(
                entry.secret,
                CapabilityToken {
                    principal: entry.principal,
                    permissions: entry.permissions,
                    expiry: entry.expiry,
                },
            );
        }
        TokenStore {
            tokens,
            ephemeral: Default::default(),
        }
    }

    /// Build from a live store.  Ephemeral tokens are not persisted.
    pub fn build(store: &TokenStore) -> Self {
        let mut token: Vec<_> = store
            .tokens
            .iter()
            .filter(|(secret, _)| !store.ephemeral.contains(*secret))
            .map(|(secret, t)| TokenSpec {
                secret: secret.clone(),
                principal: t.principal.clone(),
                permissions: t.permissions.clone(),
                expiry: t.expiry,
            })
            .collect();
        token.sort_by(|a, b| a.secret.cmp(&b.secret));
        Self { token }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zonewall_api::{Resource, Verb};

    #[test]
    fn issue_resolve_revoke() {
        let mut store = TokenStore::default();
        let perms: BTreeSet<_> = [Permission::new(Resource::Config, Verb::Read)].into();
        let secret = store.issue("ops".into(), perms.clone(), None);

        let token = store.resolve(&secret).unwrap();
        assert_eq!(token.principal, "ops");
        assert!(token.allows(Permission::new(Resource::Config, Verb::Read)));
        assert!(!token.allows(Permission::new(Resource::Config, Verb::Write)));

        assert_eq!(store.revoke("ops"), 1);
        assert!(store.resolve(&secret).is_none());
    }

    #[test]
    fn store_round_trips_through_toml() {
        let mut store = TokenStore::default();
        let perms: BTreeSet<_> = [
            Permission::new(Resource::Config, Verb::Write),
            Permission::new(Resource::Events, Verb::Read),
        ]
        .into();
        let secret = store.issue("web-ui".into(), perms, None);

        let text = toml::to_string_pretty(&Spec::build(&store)).unwrap();
        let back: Spec = toml::from_str(&text).unwrap();
        let back = back.parse();
        assert!(back.resolve(&secret).is_some());
    }

    #[test]
    fn ephemeral_tokens_survive_reloads_and_are_never_persisted() {
        let mut store = TokenStore::default();
        let perms: BTreeSet<_> = [Permission::new(Resource::Config, Verb::Read)].into();
        let file_secret = store.issue("ops".into(), perms.clone(), None);
        let spawn_secret = store.issue_ephemeral("api-plane".into(), perms);

        // Persisting skips the spawn token.
        let spec = Spec::build(&store);
        assert_eq!(spec.token.len(), 1);

        // Reloading from the file keeps the spawn token alive.
        store.reload_from(spec);
        assert!(store.resolve(&file_secret).is_some());
        assert!(store.resolve(&spawn_secret).is_some());
    }
}
