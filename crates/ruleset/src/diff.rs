//! Differences between generations.
//!
//! A [`ChangeSet`] classifies the difference between two graphs per
//! subsystem, so that a reload only touches the subsystems whose inputs
//! actually changed: an edit to a DHCP range must not tear down the
//! firewall, and an added rule must not restart the DHCP server.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::graph::Graph;

//----------- ChangeSet --------------------------------------------------------

/// A component-classified difference between two generations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// The firewall inputs (zones, policies, NAT, set declarations) changed;
    /// the ruleset must be recompiled and applied.
    pub ruleset: bool,

    /// Interface definitions changed; the interface reconciler must run.
    pub interfaces: bool,

    /// Routes or route groups changed; the route reconciler must run.
    pub routes: bool,

    /// How the set population differs between the generations.
    pub sets: SetChanges,

    /// Per-subsystem service lifecycle transitions.
    pub services: BTreeMap<String, ServiceChange>,
}

impl ChangeSet {
    /// Whether the two generations are equivalent.
    pub fn is_empty(&self) -> bool {
        !self.ruleset
            && !self.interfaces
            && !self.routes
            && self.sets.is_empty()
            && self.services.is_empty()
    }
}

//----------- SetChanges -------------------------------------------------------

/// How the address-set population changes across a reload.
///
/// This drives the "smart flush": runtime-mutable sets present in both
/// generations carry their contents across the swap, sets that disappear are
/// discarded, and new sets start empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetChanges {
    /// Runtime-mutable sets present in both generations; contents are
    /// snapshotted before the swap and restored after it.
    pub carried: Vec<String>,

    /// Sets that exist only in the prior generation; their contents (and any
    /// on-disk cache) are dropped.
    pub discarded: Vec<String>,

    /// Sets that exist only in the new generation; they start empty.
    pub fresh: Vec<String>,
}

impl SetChanges {
    /// Whether the set population is unchanged.
    ///
    /// Carried sets do not count: carrying is the steady state.
    pub fn is_empty(&self) -> bool {
        self.discarded.is_empty() && self.fresh.is_empty()
    }
}

//----------- ServiceChange ----------------------------------------------------

/// A lifecycle transition for one service subsystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceChange {
    /// The subsystem appears in the new generation only.
    Start,

    /// The subsystem appears in the prior generation only.
    Stop,

    /// The subsystem appears in both with a different subconfiguration.
    Reload,
}

//--- Computing diffs

impl Graph {
    /// Classify the difference between two generations.
    pub fn diff(prev: &Graph, next: &Graph) -> ChangeSet {
        let ruleset = prev.zones != next.zones
            || prev.policies != next.policies
            || prev.nat != next.nat
            || prev.sets != next.sets
            || zone_assignment(prev) != zone_assignment(next);

        let interfaces = prev.interfaces != next.interfaces;
        let routes = prev.routes != next.routes || prev.route_groups != next.route_groups;

        let mut sets = SetChanges::default();
        for (name, set) in &prev.sets {
            match next.sets.get(name) {
                Some(new) if set.is_runtime() && new.is_runtime() => {
                    sets.carried.push(name.clone());
                }
                Some(_) => {}
                None => sets.discarded.push(name.clone()),
            }
        }
        for name in next.sets.keys() {
            if !prev.sets.contains_key(name) {
                sets.fresh.push(name.clone());
            }
        }

        let mut services = BTreeMap::new();
        for (name, conf) in &prev.services {
            match next.services.get(name) {
                Some(new) if new == conf => {}
                Some(_) => {
                    services.insert(name.clone(), ServiceChange::Reload);
                }
                None => {
                    services.insert(name.clone(), ServiceChange::Stop);
                }
            }
        }
        for name in next.services.keys() {
            if !prev.services.contains_key(name) {
                services.insert(name.clone(), ServiceChange::Start);
            }
        }

        ChangeSet {
            ruleset,
            interfaces,
            routes,
            sets,
            services,
        }
    }
}

/// The interface-to-zone assignment, separated from other interface fields.
///
/// Moving an interface between zones changes the compiled ruleset even when
/// the interface definition itself is otherwise untouched.
fn zone_assignment(graph: &Graph) -> BTreeMap<&str, Option<&str>> {
    graph
        .interfaces
        .values()
        .map(|iface| (iface.name.as_str(), iface.zone.as_deref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AddrSet, Addressing, ElemKind, Interface, InterfaceKind, SetSource};

    fn iface(name: &str, zone: Option<&str>) -> Interface {
        Interface {
            name: name.into(),
            kind: InterfaceKind::Physical,
            zone: zone.map(Into::into),
            addressing: Addressing::DhcpClient,
            mtu: None,
        }
    }

    fn runtime_set(name: &str) -> AddrSet {
        AddrSet {
            name: name.into(),
            elem: ElemKind::Ipv4,
            source: SetSource::Runtime { persist: false },
        }
    }

    #[test]
    fn identical_graphs_diff_empty() {
        let mut graph = Graph::default();
        graph
            .interfaces
            .insert("eth0".into(), iface("eth0", Some("wan")));

        let diff = Graph::diff(&graph, &graph.clone());
        assert!(diff.is_empty());
    }

    #[test]
    fn rezoning_an_interface_touches_the_ruleset() {
        let mut prev = Graph::default();
        prev.interfaces
            .insert("eth0".into(), iface("eth0", Some("wan")));

        let mut next = Graph::default();
        next.interfaces
            .insert("eth0".into(), iface("eth0", Some("lan")));

        let diff = Graph::diff(&prev, &next);
        assert!(diff.ruleset);
        assert!(diff.interfaces);
    }

    #[test]
    fn runtime_sets_in_both_generations_are_carried() {
        let mut prev = Graph::default();
        prev.sets.insert("blocked".into(), runtime_set("blocked"));
        prev.sets.insert("old".into(), runtime_set("old"));

        let mut next = Graph::default();
        next.sets.insert("blocked".into(), runtime_set("blocked"));
        next.sets.insert("new".into(), runtime_set("new"));

        let diff = Graph::diff(&prev, &next);
        assert_eq!(diff.sets.carried, vec!["blocked".to_string()]);
        assert_eq!(diff.sets.discarded, vec!["old".to_string()]);
        assert_eq!(diff.sets.fresh, vec!["new".to_string()]);
    }

    #[test]
    fn service_transitions_are_classified() {
        let mut prev = Graph::default();
        prev.services.insert("dhcp".into(), "range=10".into());
        prev.services.insert("dns".into(), "fwd=1.1.1.1".into());

        let mut next = Graph::default();
        next.services.insert("dhcp".into(), "range=20".into());
        next.services.insert("wireguard".into(), "peers=2".into());

        let diff = Graph::diff(&prev, &next);
        assert_eq!(diff.services["dhcp"], ServiceChange::Reload);
        assert_eq!(diff.services["dns"], ServiceChange::Stop);
        assert_eq!(diff.services["wireguard"], ServiceChange::Start);
        assert!(!diff.services.contains_key("qos"));
    }
}
