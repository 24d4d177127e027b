//! Capability tokens.
//!
//! Every control-channel request carries a token secret; the control plane
//! resolves it to a [`CapabilityToken`] and checks the operation's required
//! permission against the token's grant.  Verbs and resources form a closed
//! taxonomy; permissions are written `verb:resource` on the wire and in the
//! token store.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

//----------- Verb -------------------------------------------------------------

/// What a permission allows doing to its resource.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verb {
    Read,
    Write,
    Apply,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Apply => "apply",
        })
    }
}

impl FromStr for Verb {
    type Err = PermissionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "apply" => Ok(Self::Apply),
            _ => Err(PermissionParseError),
        }
    }
}

//----------- Resource ---------------------------------------------------------

/// What a permission applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resource {
    Config,
    Firewall,
    Ipset,
    Backup,
    Vpn,
    Events,
    System,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Config => "config",
            Self::Firewall => "firewall",
            Self::Ipset => "ipset",
            Self::Backup => "backup",
            Self::Vpn => "vpn",
            Self::Events => "events",
            Self::System => "system",
        })
    }
}

impl FromStr for Resource {
    type Err = PermissionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config" => Ok(Self::Config),
            "firewall" => Ok(Self::Firewall),
            "ipset" => Ok(Self::Ipset),
            "backup" => Ok(Self::Backup),
            "vpn" => Ok(Self::Vpn),
            "events" => Ok(Self::Events),
            "system" => Ok(Self::System),
            _ => Err(PermissionParseError),
        }
    }
}

//----------- Permission -------------------------------------------------------

/// One `verb:resource` grant.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Permission {
    pub resource: Resource,
    pub verb: Verb,
}

impl Permission {
    pub const fn new(resource: Resource, verb: Verb) -> Self {
        Self { resource, verb }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.verb)
    }
}

/// A permission string did not match the closed taxonomy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionParseError;

impl std::error::Error for PermissionParseError {}

impl fmt::Display for PermissionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("permissions are written 'resource:verb', e.g. 'config:read'")
    }
}

impl FromStr for Permission {
    type Err = PermissionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (resource, verb) = s.split_once(':').ok_or(PermissionParseError)?;
        Ok(Self {
            resource: resource.parse()?,
            verb: verb.parse()?,
        })
    }
}

// Permissions are written as 'resource:verb' strings on the wire and in the
// token store.
impl Serialize for Permission {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

//----------- CapabilityToken --------------------------------------------------

/// The credential behind a control-channel request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityToken {
    /// Who this token was issued to.
    pub principal: String,

    /// The granted permissions.
    pub permissions: BTreeSet<Permission>,

    /// When the token stops working, if it expires at all.
    pub expiry: Option<jiff::Timestamp>,
}

impl CapabilityToken {
    /// Whether the token grants the given permission.
    pub fn allows(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Whether the token has expired as of `now`.
    pub fn is_expired(&self, now: jiff::Timestamp) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissions_parse_the_documented_forms() {
        for (text, resource, verb) in [
            ("config:read", Resource::Config, Verb::Read),
            ("config:write", Resource::Config, Verb::Write),
            ("firewall:apply", Resource::Firewall, Verb::Apply),
            ("vpn:write", Resource::Vpn, Verb::Write),
            ("backup:read", Resource::Backup, Verb::Read),
        ] {
            let parsed: Permission = text.parse().unwrap();
            assert_eq!(parsed, Permission::new(resource, verb));
            assert_eq!(parsed.to_string(), text);
        }

        assert!("config".parse::<Permission>().is_err());
        assert!("config:delete".parse::<Permission>().is_err());
        assert!("plugin:read".parse::<Permission>().is_err());
    }

    #[test]
    fn expiry_is_checked_against_now() {
        let token = CapabilityToken {
            principal: "ops".into(),
            permissions: BTreeSet::new(),
            expiry: Some(jiff::Timestamp::UNIX_EPOCH),
        };
        assert!(token.is_expired(jiff::Timestamp::now()));

        let token = CapabilityToken {
            expiry: None,
            ..token
        };
        assert!(!token.is_expired(jiff::Timestamp::now()));
    }
}
