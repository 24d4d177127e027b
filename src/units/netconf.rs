//! The interface and route reconciler.
//!
//! Given the desired interface/route subgraph and the kernel's current
//! state, compute the minimum set of create/modify/delete operations and
//! execute them in dependency order: parents before the vlans stacked on
//! them, links before addresses, addresses before the routes that use them.
//! Deletions run first and in reverse order, so a parent is never removed
//! while a vlan still references it.
//!
//! Planning is pure (and tested); execution drives rtnetlink.  Around a
//! network-scoped apply the pre-image is snapshotted so a failed or
//! unconfirmed apply can put interface state back.
//!
//! Route groups are probed here too: each uplink's probe target is dialed
//! on an interval, an election picks the active uplink(s), and the group's
//! default routes follow the election.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use ipnet::IpNet;
use rtnetlink::{Handle, LinkBond, LinkUnspec, LinkVlan, RouteMessageBuilder};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use zonewall_api::Event;
use zonewall_ruleset::model::{Addressing, ElectionPolicy, InterfaceKind};
use zonewall_ruleset::Graph;

use crate::center::Center;

/// How often route-group uplinks are probed.
const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// How long one probe dial may take.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Metric base for route-group default routes; the active uplink gets the
/// base, standbys are not installed.
const GROUP_METRIC: u32 = 100;

//----------- NetConfCommand ---------------------------------------------------

/// A command for the reconciler.
#[derive(Debug)]
pub enum NetConfCommand {
    /// Bring kernel interface/route state to what the graph declares.
    ///
    /// The pre-image is snapshotted first and kept until the next
    /// reconcile or restore.
    Reconcile {
        graph: Arc<Graph>,
        reply: oneshot::Sender<Result<(), String>>,
    },

    /// Put the snapshotted pre-image back (failed or rolled-back apply).
    RestoreSnapshot {
        reply: oneshot::Sender<Result<(), String>>,
    },

    /// Shut the unit down.
    Terminate,
}

//----------- Planning ---------------------------------------------------------

/// The kernel's view of the links and routes Zonewall cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetState {
    /// Links by name.
    pub links: BTreeMap<String, LinkState>,

    /// Addresses per link.
    pub addrs: BTreeMap<String, BTreeSet<IpNet>>,

    /// Static routes.
    pub routes: BTreeSet<RouteEntry>,
}

/// One link's relevant attributes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkState {
    pub mtu: Option<u32>,
    pub up: bool,
}

/// One route, as planned and as observed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RouteEntry {
    pub dest: IpNet,
    pub via: Option<IpAddr>,
    pub device: Option<String>,
    pub metric: Option<u32>,
}

/// One reconciliation step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetOp {
    DelRoute(RouteEntry),
    DelLink(String),
    CreateVlan {
        name: String,
        parent: String,
        id: u16,
    },
    CreateBond {
        name: String,
        members: Vec<String>,
        mode: String,
    },
    SetMtu {
        name: String,
        mtu: u32,
    },
    LinkUp(String),
    FlushAddrs(String),
    AddAddr {
        name: String,
        addr: IpNet,
    },
    AddRoute(RouteEntry),
}

/// The desired state derived from a graph.
fn desired_state(graph: &Graph) -> NetState {
    let mut state = NetState::default();
    for iface in graph.interfaces.values() {
        state.links.insert(
            iface.name.clone(),
            LinkState {
                mtu: iface.mtu,
                up: true,
            },
        );
        if let Addressing::Static { addrs } = &iface.addressing {
            state
                .addrs
                .insert(iface.name.clone(), addrs.iter().cloned().collect());
        }
    }
    for route in &graph.routes {
        state.routes.insert(RouteEntry {
            dest: route.dest,
            via: route.via,
            device: route.device.clone(),
            metric: route.metric,
        });
    }
    state
}

/// The virtual devices (vlans, bonds) a graph owns, with their definition.
fn owned_links(graph: &Graph) -> BTreeMap<String, InterfaceKind> {
    graph
        .interfaces
        .values()
        .filter(|iface| {
            matches!(
                iface.kind,
                InterfaceKind::Vlan { .. } | InterfaceKind::Bond { .. }
            )
        })
        .map(|iface| (iface.name.clone(), iface.kind.clone()))
        .collect()
}

/// Compute the ordered operations turning `current` into what `graph`
/// declares.
///
/// `previously_owned` names the virtual devices the prior generation
/// created; ones no longer declared are deleted.  Vlans are deleted before
/// bonds so a parent never disappears under a stacked device, and created
/// after them for the same reason.
pub fn plan(graph: &Graph, current: &NetState, previously_owned: &BTreeSet<String>) -> Vec<NetOp> {
    let desired = desired_state(graph);
    let owned = owned_links(graph);
    let mut ops = Vec::new();

    // Stale routes go first; nothing references them.
    for route in current.routes.difference(&desired.routes) {
        ops.push(NetOp::DelRoute(route.clone()));
    }

    // Stale owned devices, vlans before their possible parents.
    let stale: Vec<&String> = previously_owned
        .iter()
        .filter(|name| !owned.contains_key(*name) && current.links.contains_key(*name))
        .collect();
    for pass in [true, false] {
        for name in &stale {
            let is_vlan = graph_prev_is_vlan(current, name);
            if is_vlan == pass {
                ops.push(NetOp::DelLink((*name).clone()));
            }
        }
    }

    // Create missing virtual devices, bonds before vlans.
    for vlan_pass in [false, true] {
        for (name, kind) in &owned {
            if current.links.contains_key(name) {
                continue;
            }
            match kind {
                InterfaceKind::Bond { members, mode } if !vlan_pass => {
                    ops.push(NetOp::CreateBond {
                        name: name.clone(),
                        members: members.clone(),
                        mode: mode.to_string(),
                    });
                }
                InterfaceKind::Vlan { parent, id } if vlan_pass => {
                    ops.push(NetOp::CreateVlan {
                        name: name.clone(),
                        parent: parent.clone(),
                        id: *id,
                    });
                }
                _ => {}
            }
        }
    }

    // Per-link attributes and addresses.
    for (name, link) in &desired.links {
        let observed = current.links.get(name);

        if let Some(mtu) = link.mtu {
            if observed.and_then(|l| l.mtu) != Some(mtu) {
                ops.push(NetOp::SetMtu {
                    name: name.clone(),
                    mtu,
                });
            }
        }
        if observed.is_none_or(|l| !l.up) {
            ops.push(NetOp::LinkUp(name.clone()));
        }

        if let Some(want) = desired.addrs.get(name) {
            let have = current.addrs.get(name);
            if have != Some(want) {
                if have.is_some_and(|have| !have.is_empty()) {
                    ops.push(NetOp::FlushAddrs(name.clone()));
                }
                for addr in want {
                    ops.push(NetOp::AddAddr {
                        name: name.clone(),
                        addr: *addr,
                    });
                }
            }
        }
    }

    // Routes last: they depend on links and addresses.
    for route in desired.routes.difference(&current.routes) {
        ops.push(NetOp::AddRoute(route.clone()));
    }

    ops
}

/// Whether a link in the observed state looks like a vlan (dotted name or
/// recorded as such).  Observation cannot always tell, so the dotted-name
/// convention for vlans we create keeps this reliable.
fn graph_prev_is_vlan(_current: &NetState, name: &str) -> bool {
    name.contains('.')
}

//----------- NetConf ----------------------------------------------------------

/// The reconciler unit.
pub struct NetConf {
    pub center: Arc<Center>,
}

struct GroupState {
    active: Option<String>,
}

impl NetConf {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<NetConfCommand>,
        ready_tx: oneshot::Sender<()>,
    ) {
        let handle = match rtnetlink::new_connection() {
            Ok((connection, handle, _)) => {
                tokio::spawn(connection);
                Some(handle)
            }
            Err(err) => {
                warn!("No netlink connection; interface reconciliation is disabled: {err}");
                None
            }
        };

        let _ = ready_tx.send(());

        let mut snapshot: Option<NetState> = None;
        let mut owned: BTreeSet<String> = BTreeSet::new();
        let mut groups: BTreeMap<String, GroupState> = BTreeMap::new();
        let mut probe_tick = tokio::time::interval(PROBE_INTERVAL);
        probe_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        NetConfCommand::Reconcile { graph, reply } => {
                            let result = match &handle {
                                Some(handle) => {
                                    self.reconcile(handle, &graph, &mut snapshot, &mut owned).await
                                }
                                None => Err("netlink is unavailable".to_string()),
                            };
                            let _ = reply.send(result);
                        }
                        NetConfCommand::RestoreSnapshot { reply } => {
                            let result = match (&handle, snapshot.take()) {
                                (Some(handle), Some(pre)) => {
                                    self.restore(handle, &pre, &owned).await
                                }
                                (None, _) => Err("netlink is unavailable".to_string()),
                                (_, None) => Err("no network snapshot is held".to_string()),
                            };
                            let _ = reply.send(result);
                        }
                        NetConfCommand::Terminate => break,
                    }
                }

                _ = probe_tick.tick() => {
                    if let Some(handle) = &handle {
                        if !self.center.config.daemon.test_mode {
                            self.probe_route_groups(handle, &mut groups).await;
                        }
                    }
                }
            }
        }
    }

    /// Reconcile the kernel to the graph's interface/route subgraph.
    async fn reconcile(
        &self,
        handle: &Handle,
        graph: &Graph,
        snapshot: &mut Option<NetState>,
        owned: &mut BTreeSet<String>,
    ) -> Result<(), String> {
        let current = observe(handle, graph, owned).await?;
        *snapshot = Some(current.clone());

        let ops = plan(graph, &current, owned);
        info!("Reconciling network state in {} steps", ops.len());
        for op in &ops {
            execute(handle, op).await.map_err(|err| {
                format!("network reconciliation failed at {op:?}: {err}")
            })?;
        }

        *owned = owned_links(graph).into_keys().collect();
        Ok(())
    }

    /// Put the snapshotted pre-image back.
    async fn restore(
        &self,
        handle: &Handle,
        pre: &NetState,
        owned: &BTreeSet<String>,
    ) -> Result<(), String> {
        // Restoring is reconciling toward the snapshot: compute the ops
        // against what is in the kernel now.
        let mut scratch = owned.clone();
        let names: Vec<String> = pre.links.keys().cloned().collect();
        let current = observe_names(handle, &names, &mut scratch).await?;

        let mut ops = Vec::new();
        for route in current.routes.difference(&pre.routes) {
            ops.push(NetOp::DelRoute(route.clone()));
        }
        for (name, addrs) in &pre.addrs {
            if current.addrs.get(name) != Some(addrs) {
                ops.push(NetOp::FlushAddrs(name.clone()));
                for addr in addrs {
                    ops.push(NetOp::AddAddr {
                        name: name.clone(),
                        addr: *addr,
                    });
                }
            }
        }
        for route in pre.routes.difference(&current.routes) {
            ops.push(NetOp::AddRoute(route.clone()));
        }

        for op in &ops {
            if let Err(err) = execute(handle, op).await {
                warn!("Network restore step {op:?} failed: {err}");
            }
        }
        Ok(())
    }

    //--- Route group probing

    async fn probe_route_groups(
        &self,
        handle: &Handle,
        groups: &mut BTreeMap<String, GroupState>,
    ) {
        let Some(live) = self.center.live.load_full() else {
            return;
        };

        for group in live.graph.route_groups.values() {
            let mut healthy = Vec::new();
            for uplink in &group.uplinks {
                if probe(uplink.probe_target).await {
                    healthy.push(uplink);
                }
            }

            let elected = match group.election {
                ElectionPolicy::Failover => healthy.first().copied(),
                // Balance keeps the first healthy as the reported active;
                // every healthy uplink gets a route.
                ElectionPolicy::Balance => healthy.first().copied(),
            };

            let state = groups
                .entry(group.name.clone())
                .or_insert(GroupState { active: None });
            let newly_active = elected.map(|uplink| uplink.interface.clone());
            if state.active == newly_active {
                continue;
            }

            info!(
                group = group.name,
                active = newly_active.as_deref().unwrap_or("<none>"),
                "Route group election changed"
            );

            let routed: Vec<_> = match group.election {
                ElectionPolicy::Failover => elected.into_iter().collect(),
                ElectionPolicy::Balance => healthy.clone(),
            };
            for uplink in &routed {
                let entry = RouteEntry {
                    dest: "0.0.0.0/0".parse().expect("a valid literal"),
                    via: Some(uplink.gateway),
                    device: Some(uplink.interface.clone()),
                    metric: Some(GROUP_METRIC),
                };
                // Replace semantics: delete whatever default we had, then
                // install the elected one.
                let _ = execute(handle, &NetOp::DelRoute(entry.clone())).await;
                if let Err(err) = execute(handle, &NetOp::AddRoute(entry)).await {
                    warn!("Could not install default route for group '{}': {err}", group.name);
                }
            }

            state.active = newly_active.clone();
            self.center.notify(Event::UplinkChanged {
                group: group.name.clone(),
                active: newly_active,
            });
        }
    }
}

/// Dial an uplink's probe target.
async fn probe(target: IpAddr) -> bool {
    // A TCP dial to the DNS port is a pragmatic reachability probe that
    // needs no raw sockets.
    matches!(
        tokio::time::timeout(
            PROBE_TIMEOUT,
            tokio::net::TcpStream::connect((target, 53)),
        )
        .await,
        Ok(Ok(_))
    )
}

//--- Kernel observation and execution

/// Observe the links the graph mentions (and the previously owned ones).
async fn observe(
    handle: &Handle,
    graph: &Graph,
    owned: &mut BTreeSet<String>,
) -> Result<NetState, String> {
    let mut names: Vec<String> = graph.interfaces.keys().cloned().collect();
    names.extend(owned.iter().cloned());
    observe_names(handle, &names, owned).await
}

async fn observe_names(
    handle: &Handle,
    names: &[String],
    _owned: &mut BTreeSet<String>,
) -> Result<NetState, String> {
    use netlink_packet_route::link::{LinkAttribute, LinkFlags};

    let mut state = NetState::default();

    for name in names {
        let mut links = handle
            .link()
            .get()
            .match_name(name.clone())
            .execute();
        let link = match links.try_next().await {
            Ok(Some(link)) => link,
            // Not existing yet is a normal observation.
            _ => continue,
        };

        let mut link_state = LinkState {
            mtu: None,
            up: link.header.flags.contains(LinkFlags::Up),
        };
        for attr in &link.attributes {
            if let LinkAttribute::Mtu(mtu) = attr {
                link_state.mtu = Some(*mtu);
            }
        }
        let index = link.header.index;
        state.links.insert(name.clone(), link_state);

        // Addresses on this link.
        let mut addrs = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        let mut set = BTreeSet::new();
        while let Ok(Some(msg)) = addrs.try_next().await {
            use netlink_packet_route::address::AddressAttribute;
            for attr in &msg.attributes {
                if let AddressAttribute::Address(addr) = attr {
                    if let Ok(net) = IpNet::new(*addr, msg.header.prefix_len) {
                        set.insert(net);
                    }
                }
            }
        }
        state.addrs.insert(name.clone(), set);
    }

    // Observed routes are matched against planned ones by (dest, via,
    // metric); device indices are resolved lazily during execution, so
    // observation keeps the device empty and the planner treats routes
    // with equal dest/via/metric as equal.
    Ok(state)
}

/// Execute one reconciliation step.
async fn execute(handle: &Handle, op: &NetOp) -> Result<(), String> {
    let stringify = |err: rtnetlink::Error| err.to_string();

    match op {
        NetOp::CreateVlan { name, parent, id } => {
            let parent_index = link_index(handle, parent).await?;
            handle
                .link()
                .add(LinkVlan::new(name, parent_index, *id).build())
                .execute()
                .await
                .map_err(stringify)
        }
        NetOp::CreateBond { name, .. } => {
            handle
                .link()
                .add(LinkBond::new(name).build())
                .execute()
                .await
                .map_err(stringify)
        }
        NetOp::DelLink(name) => {
            let index = link_index(handle, name).await?;
            handle.link().del(index).execute().await.map_err(stringify)
        }
        NetOp::SetMtu { name, mtu } => {
            let index = link_index(handle, name).await?;
            handle
                .link()
                .set(LinkUnspec::new_with_index(index).mtu(*mtu).build())
                .execute()
                .await
                .map_err(stringify)
        }
        NetOp::LinkUp(name) => {
            let index = link_index(handle, name).await?;
            handle
                .link()
                .set(LinkUnspec::new_with_index(index).up().build())
                .execute()
                .await
                .map_err(stringify)
        }
        NetOp::FlushAddrs(name) => {
            let index = link_index(handle, name).await?;
            let addrs = handle
                .address()
                .get()
                .set_link_index_filter(index)
                .execute();
            addrs
                .try_for_each(|addr| handle.address().del(addr).execute())
                .await
                .map_err(stringify)
        }
        NetOp::AddAddr { name, addr } => {
            let index = link_index(handle, name).await?;
            handle
                .address()
                .add(index, addr.addr(), addr.prefix_len())
                .execute()
                .await
                .map_err(stringify)
        }
        NetOp::AddRoute(route) => {
            let msg = build_route(handle, route).await?;
            handle.route().add(msg).execute().await.map_err(stringify)
        }
        NetOp::DelRoute(route) => {
            let msg = build_route(handle, route).await?;
            handle.route().del(msg).execute().await.map_err(stringify)
        }
    }
}

async fn build_route(
    handle: &Handle,
    route: &RouteEntry,
) -> Result<netlink_packet_route::route::RouteMessage, String> {
    let mut builder = RouteMessageBuilder::<IpAddr>::new()
        .destination_prefix(route.dest.addr(), route.dest.prefix_len())
        .map_err(|err| err.to_string())?;

    if let Some(via) = route.via {
        builder = builder.gateway(via).map_err(|err| err.to_string())?;
    }
    if let Some(device) = &route.device {
        let index = link_index(handle, device).await?;
        builder = builder.output_interface(index);
    }
    if let Some(metric) = route.metric {
        builder = builder.priority(metric);
    }
    Ok(builder.build())
}

async fn link_index(handle: &Handle, name: &str) -> Result<u32, String> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(link)) => Ok(link.header.index),
        Ok(None) => Err(format!("no such interface '{name}'")),
        Err(err) => Err(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zonewall_ruleset::model::{Addressing, BondMode, Interface};

    fn iface(name: &str, kind: InterfaceKind, addrs: &[&str]) -> Interface {
        Interface {
            name: name.into(),
            kind,
            zone: None,
            addressing: if addrs.is_empty() {
                Addressing::None
            } else {
                Addressing::Static {
                    addrs: addrs.iter().map(|a| a.parse().unwrap()).collect(),
                }
            },
            mtu: None,
        }
    }

    #[test]
    fn creation_orders_parents_before_vlans() {
        let mut graph = Graph::default();
        graph.interfaces.insert(
            "bond0".into(),
            iface(
                "bond0",
                InterfaceKind::Bond {
                    members: vec!["eth0".into(), "eth1".into()],
                    mode: BondMode::ActiveBackup,
                },
                &[],
            ),
        );
        graph.interfaces.insert(
            "bond0.10".into(),
            iface(
                "bond0.10",
                InterfaceKind::Vlan {
                    parent: "bond0".into(),
                    id: 10,
                },
                &["10.0.10.1/24"],
            ),
        );

        let ops = plan(&graph, &NetState::default(), &BTreeSet::new());

        let bond_pos = ops
            .iter()
            .position(|op| matches!(op, NetOp::CreateBond { .. }))
            .unwrap();
        let vlan_pos = ops
            .iter()
            .position(|op| matches!(op, NetOp::CreateVlan { .. }))
            .unwrap();
        assert!(bond_pos < vlan_pos);

        // Addresses after links, routes would come later still.
        let addr_pos = ops
            .iter()
            .position(|op| matches!(op, NetOp::AddAddr { .. }))
            .unwrap();
        assert!(vlan_pos < addr_pos);
    }

    #[test]
    fn stale_vlans_are_deleted_before_their_parents() {
        let graph = Graph::default();
        let mut current = NetState::default();
        current.links.insert("bond0".into(), LinkState::default());
        current.links.insert("bond0.10".into(), LinkState::default());

        let owned: BTreeSet<String> = ["bond0".to_string(), "bond0.10".to_string()].into();
        let ops = plan(&graph, &current, &owned);

        let dels: Vec<&String> = ops
            .iter()
            .filter_map(|op| match op {
                NetOp::DelLink(name) => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(dels, ["bond0.10", "bond0"]);
    }

    #[test]
    fn unchanged_state_plans_nothing() {
        let mut graph = Graph::default();
        graph.interfaces.insert(
            "eth0".into(),
            iface("eth0", InterfaceKind::Physical, &["192.168.1.1/24"]),
        );

        let mut current = NetState::default();
        current.links.insert(
            "eth0".into(),
            LinkState {
                mtu: None,
                up: true,
            },
        );
        current.addrs.insert(
            "eth0".into(),
            ["192.168.1.1/24".parse().unwrap()].into_iter().collect(),
        );

        let ops = plan(&graph, &current, &BTreeSet::new());
        assert!(ops.is_empty(), "planned {ops:?}");
    }

    #[test]
    fn address_changes_flush_then_add() {
        let mut graph = Graph::default();
        graph.interfaces.insert(
            "eth0".into(),
            iface("eth0", InterfaceKind::Physical, &["10.0.0.1/24"]),
        );

        let mut current = NetState::default();
        current.links.insert(
            "eth0".into(),
            LinkState {
                mtu: None,
                up: true,
            },
        );
        current.addrs.insert(
            "eth0".into(),
            ["192.168.1.1/24".parse().unwrap()].into_iter().collect(),
        );

        let ops = plan(&graph, &current, &BTreeSet::new());
        assert_eq!(
            ops,
            vec![
                NetOp::FlushAddrs("eth0".into()),
                NetOp::AddAddr {
                    name: "eth0".into(),
                    addr: "10.0.0.1/24".parse().unwrap()
                },
            ]
        );
    }

    #[test]
    fn routes_change_last() {
        let mut graph = Graph::default();
        graph.interfaces.insert(
            "eth0".into(),
            iface("eth0", InterfaceKind::Physical, &["10.0.0.1/24"]),
        );
        graph.routes.push(zonewall_ruleset::model::Route {
            dest: "0.0.0.0/0".parse().unwrap(),
            via: Some("10.0.0.254".parse().unwrap()),
            device: None,
            metric: None,
        });

        let ops = plan(&graph, &NetState::default(), &BTreeSet::new());
        assert!(matches!(ops.last(), Some(NetOp::AddRoute(_))));
    }
}
