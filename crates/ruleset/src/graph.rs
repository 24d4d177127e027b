//! The canonical object graph.
//!
//! A [`Graph`] is the only input to compilation.  It is built from a
//! validated configuration document and holds every entity in label-keyed,
//! ordered arenas, so that iteration order (and therefore compiled output)
//! is independent of declaration order in the document.
//!
//! Graphs are immutable once published: a reload builds a complete new graph
//! and installs it atomically.  Cross-generation references are forbidden by
//! construction; entities refer to each other by label, and labels are only
//! resolved against the generation they belong to.

use std::collections::BTreeMap;
use std::fmt;

use ring::digest;
use serde::{Deserialize, Serialize};

use crate::model::{AddrSet, Endpoint, Interface, Nat, Policy, Route, RouteGroup, Zone};

//----------- Graph ------------------------------------------------------------

/// The canonical in-memory representation of one configuration generation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    /// Declared zones, by name.
    pub zones: BTreeMap<String, Zone>,

    /// Declared interfaces, by name.
    pub interfaces: BTreeMap<String, Interface>,

    /// Declared policies, by (from, to) endpoint pair.
    pub policies: BTreeMap<(Endpoint, Endpoint), Policy>,

    /// NAT rules, in document order.
    ///
    /// Order is semantic for DNAT: the first matching rule wins.
    pub nat: Vec<Nat>,

    /// Address sets, by name.
    pub sets: BTreeMap<String, AddrSet>,

    /// Static routes, in document order.
    pub routes: Vec<Route>,

    /// Route groups, by name.
    pub route_groups: BTreeMap<String, RouteGroup>,

    /// Canonicalized service subconfigurations, by subsystem name.
    ///
    /// The core does not interpret these; they are diffed and fingerprinted
    /// as opaque canonical text and handed to the matching service adapter.
    pub services: BTreeMap<String, String>,
}

impl Graph {
    /// The interfaces assigned to the given zone, in name order.
    pub fn zone_members(&self, zone: &str) -> impl Iterator<Item = &Interface> {
        self.interfaces
            .values()
            .filter(move |iface| iface.zone.as_deref() == Some(zone))
    }

    /// A stable, order-independent fingerprint of this graph.
    ///
    /// Two graphs with equal fingerprints compile to byte-identical output.
    /// The digest runs over a canonical JSON rendering: map keys are sorted
    /// by the arena types, and sequence order is kept only where it is
    /// semantic (rules, NAT, routes, static set elements).
    pub fn fingerprint(&self) -> Fingerprint {
        let bytes = serde_json::to_vec(self).expect("graphs always serialize");
        Fingerprint::of(&bytes)
    }
}

//----------- Fingerprint ------------------------------------------------------

/// A SHA-256 digest identifying a graph or a compiled artifact.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Digest the given bytes.
    pub fn of(bytes: &[u8]) -> Self {
        let digest = digest::digest(&digest::SHA256, bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(digest.as_ref());
        Self(out)
    }

    /// Parse from the hex form produced by [`fmt::Display`].
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            out[i] = (hi as u8) << 4 | lo as u8;
        }
        Some(Self(out))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).ok_or_else(|| serde::de::Error::custom("not a SHA-256 hex digest"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, Management};

    fn zone(name: &str) -> Zone {
        Zone {
            name: name.into(),
            description: None,
            management: Management::default(),
        }
    }

    #[test]
    fn fingerprint_ignores_declaration_order() {
        let mut a = Graph::default();
        a.zones.insert("lan".into(), zone("lan"));
        a.zones.insert("wan".into(), zone("wan"));

        let mut b = Graph::default();
        b.zones.insert("wan".into(), zone("wan"));
        b.zones.insert("lan".into(), zone("lan"));

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_sees_rule_order() {
        let rule = |name: &str| crate::model::Rule {
            name: name.into(),
            action: Action::Accept,
            protocol: None,
            source: crate::model::AddrMatch::Any,
            destination: crate::model::AddrMatch::Any,
            ports: Vec::new(),
            time: None,
            limit: None,
            log: None,
        };

        let policy = |rules: Vec<crate::model::Rule>| Policy {
            from: Endpoint::Zone("lan".into()),
            to: Endpoint::Zone("wan".into()),
            default_action: Action::Drop,
            rules,
        };

        let key = (Endpoint::Zone("lan".into()), Endpoint::Zone("wan".into()));

        let mut a = Graph::default();
        a.policies
            .insert(key.clone(), policy(vec![rule("one"), rule("two")]));

        let mut b = Graph::default();
        b.policies.insert(key, policy(vec![rule("two"), rule("one")]));

        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_round_trips_as_hex() {
        let fp = Graph::default().fingerprint();
        let parsed = Fingerprint::parse(&fp.to_string()).unwrap();
        assert_eq!(fp, parsed);
    }
}
