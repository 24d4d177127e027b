//! The dynamic address-set manager.
//!
//! Runtime-mutable sets live here: the manager's in-memory contents are the
//! authoritative copy, the kernel set is a projection of them, and the
//! cache files under the state dir make persistent sets survive restarts.
//!
//! Three source kinds are managed:
//!
//! - **URL-sourced** sets refresh on an interval; a fetched feed is parsed,
//!   capped, staged to the cache file, and installed wholesale as one
//!   kernel transaction, so readers never see a half-replaced feed.  Fetch
//!   failures keep the most recent cached contents.
//! - **DNS-resolved** sets re-resolve their domains periodically and apply
//!   differential updates rather than a full flush.
//! - **Runtime** sets change only through `ipset.*` operations and events
//!   from other subsystems.
//!
//! The "smart flush" contract with the applier: before a ruleset swap the
//! applier sends [`SetMgrCommand::PrepareReload`], which snapshots the
//! contents of runtime sets present in both generations; after the swap,
//! [`SetMgrCommand::RestoreCarried`] pushes those contents into the fresh
//! kernel sets.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use zonewall_api::msg::{OpResult, SetStatus};
use zonewall_api::{ApiError, Event};
use zonewall_ruleset::model::{ElemKind, SetSource};
use zonewall_ruleset::{SetChanges, SetManifest};

use crate::center::Center;
use crate::comms::Reply;
use crate::nft::RulesetBackend;

//----------- SetMgrCommand ----------------------------------------------------

/// A command for the set manager.
#[derive(Debug)]
pub enum SetMgrCommand {
    /// Adopt the recovered generation's sets at startup: load persisted
    /// contents, push them into the kernel, start refreshers.
    Bootstrap { manifests: Vec<SetManifest> },

    /// A ruleset swap is imminent; snapshot what must survive it.
    PrepareReload {
        manifests: Vec<SetManifest>,
        changes: SetChanges,
        reply: oneshot::Sender<()>,
    },

    /// The swap happened; restore carried contents and start refreshers
    /// for the new generation.
    RestoreCarried {
        reply: oneshot::Sender<Result<(), String>>,
    },

    /// The swap did not happen; drop the snapshot and restart the current
    /// generation's refreshers.
    AbortReload { reply: oneshot::Sender<()> },

    /// Push every managed set's contents back into the kernel (after an
    /// integrity restore replaced the table).
    RestoreAll { reply: oneshot::Sender<()> },

    /// `ipset.list`.
    List { reply: Reply },

    /// `ipset.show`.
    Show { name: String, reply: Reply },

    /// `ipset.add`.
    Add {
        name: String,
        element: String,
        reply: Reply,
    },

    /// `ipset.remove`.
    Remove {
        name: String,
        element: String,
        reply: Reply,
    },

    /// `ipset.flush`.
    Flush { name: String, reply: Reply },

    /// A background refresher produced new contents for a set.
    Fetched {
        name: String,
        elements: BTreeSet<String>,
    },

    /// Shut the unit down.
    Terminate,
}

//----------- SetManager -------------------------------------------------------

/// One managed set.
#[derive(Debug)]
struct ManagedSet {
    manifest: SetManifest,
    elements: BTreeSet<String>,
    refresher: Option<tokio::task::JoinHandle<()>>,
}

impl ManagedSet {
    fn is_persistent(&self) -> bool {
        match &self.manifest.source {
            SetSource::Runtime { persist } => *persist,
            // URL feeds cache to disk so a fetch failure after restart
            // still has contents to fall back to.
            SetSource::Url { .. } => true,
            _ => false,
        }
    }
}

/// The dynamic set manager unit.
pub struct SetManager<B> {
    pub center: Arc<Center>,
    pub backend: Arc<B>,

    /// Our own sender, handed to refresher tasks.
    pub cmd_tx: mpsc::UnboundedSender<SetMgrCommand>,
}

struct Snapshot {
    manifests: Vec<SetManifest>,
    changes: SetChanges,
    carried: BTreeMap<String, BTreeSet<String>>,
}

impl<B: RulesetBackend> SetManager<B> {
    pub async fn run(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<SetMgrCommand>,
        ready_tx: oneshot::Sender<()>,
    ) {
        let mut sets: BTreeMap<String, ManagedSet> = BTreeMap::new();
        let mut snapshot: Option<Snapshot> = None;

        let _ = ready_tx.send(());

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                SetMgrCommand::Bootstrap { manifests } => {
                    self.adopt(&mut sets, manifests, &BTreeMap::new()).await;
                    self.push_all(&sets).await;
                }
                SetMgrCommand::PrepareReload {
                    manifests,
                    changes,
                    reply,
                } => {
                    // Snapshot runtime sets surviving the swap and stop the
                    // old generation's refreshers.
                    let mut carried = BTreeMap::new();
                    for name in &changes.carried {
                        if let Some(set) = sets.get(name) {
                            carried.insert(name.clone(), set.elements.clone());
                        }
                    }
                    for set in sets.values_mut() {
                        if let Some(refresher) = set.refresher.take() {
                            refresher.abort();
                        }
                    }
                    for name in &changes.discarded {
                        let _ = std::fs::remove_file(self.cache_path(name).as_std_path());
                    }
                    snapshot = Some(Snapshot {
                        manifests,
                        changes,
                        carried,
                    });
                    let _ = reply.send(());
                }
                SetMgrCommand::RestoreCarried { reply } => {
                    let result = match snapshot.take() {
                        Some(snapshot) => {
                            self.adopt(&mut sets, snapshot.manifests, &snapshot.carried)
                                .await;
                            debug!(
                                carried = snapshot.changes.carried.len(),
                                fresh = snapshot.changes.fresh.len(),
                                discarded = snapshot.changes.discarded.len(),
                                "Restored dynamic sets across the swap"
                            );
                            self.push_all(&sets).await;
                            Ok(())
                        }
                        None => Err("no reload was prepared".to_string()),
                    };
                    let _ = reply.send(result);
                }
                SetMgrCommand::AbortReload { reply } => {
                    snapshot = None;
                    for set in sets.values_mut() {
                        if set.refresher.is_none() {
                            set.refresher = self.spawn_refresher(&set.manifest);
                        }
                    }
                    let _ = reply.send(());
                }
                SetMgrCommand::RestoreAll { reply } => {
                    self.push_all(&sets).await;
                    let _ = reply.send(());
                }
                SetMgrCommand::List { reply } => {
                    let listed = sets
                        .values()
                        .map(|set| SetStatus {
                            name: set.manifest.name.clone(),
                            kind: source_kind(&set.manifest.source).into(),
                            elements: set.elements.len(),
                            persistent: set.is_persistent(),
                        })
                        .collect();
                    let _ = reply.send(Ok(OpResult::Sets { sets: listed }));
                }
                SetMgrCommand::Show { name, reply } => {
                    let result = match sets.get(&name) {
                        Some(set) => Ok(OpResult::SetElements {
                            name,
                            elements: set.elements.iter().cloned().collect(),
                        }),
                        None => Err(unknown_set(&name)),
                    };
                    let _ = reply.send(result);
                }
                SetMgrCommand::Add {
                    name,
                    element,
                    reply,
                } => {
                    let _ = reply.send(self.add(&mut sets, &name, element).await);
                }
                SetMgrCommand::Remove {
                    name,
                    element,
                    reply,
                } => {
                    let _ = reply.send(self.remove(&mut sets, &name, &element).await);
                }
                SetMgrCommand::Flush { name, reply } => {
                    let _ = reply.send(self.flush(&mut sets, &name).await);
                }
                SetMgrCommand::Fetched { name, elements } => {
                    self.install_fetched(&mut sets, &name, elements).await;
                }
                SetMgrCommand::Terminate => break,
            }
        }

        // Persist on the way out.
        for set in sets.values() {
            if set.is_persistent() {
                self.persist(set);
            }
        }
    }

    /// Build the managed map for a generation, seeding carried contents,
    /// cached feeds and persisted runtime contents.
    async fn adopt(
        &self,
        sets: &mut BTreeMap<String, ManagedSet>,
        manifests: Vec<SetManifest>,
        carried: &BTreeMap<String, BTreeSet<String>>,
    ) {
        let old = std::mem::take(sets);
        for (_, mut set) in old {
            if let Some(refresher) = set.refresher.take() {
                refresher.abort();
            }
        }

        for manifest in manifests {
            // Static sets are populated inline by the compiled ruleset and
            // need no management.
            if !manifest.is_runtime() {
                continue;
            }

            let name = manifest.name.clone();
            let elements = if let Some(carried) = carried.get(&name) {
                carried.clone()
            } else if matches!(
                manifest.source,
                SetSource::Url { .. } | SetSource::Runtime { persist: true }
            ) {
                self.load_cache(&name)
            } else {
                BTreeSet::new()
            };

            let refresher = self.spawn_refresher(&manifest);
            sets.insert(
                name,
                ManagedSet {
                    manifest,
                    elements,
                    refresher,
                },
            );
        }
    }

    /// Push every managed set's contents into the kernel.
    async fn push_all(&self, sets: &BTreeMap<String, ManagedSet>) {
        for set in sets.values() {
            if set.elements.is_empty() {
                continue;
            }
            let elements: Vec<String> = set.elements.iter().cloned().collect();
            if let Err(err) = self
                .backend
                .add_set_elements(&set.manifest.name, &elements)
                .await
            {
                warn!(
                    "Could not populate set '{}' in the kernel: {err}",
                    set.manifest.name
                );
            }
        }
    }

    //--- Runtime mutation

    async fn add(
        &self,
        sets: &mut BTreeMap<String, ManagedSet>,
        name: &str,
        element: String,
    ) -> Result<OpResult, ApiError> {
        let set = runtime_set(sets, name)?;
        check_element(set.manifest.elem, &element)?;

        if set.elements.insert(element.clone()) {
            self.backend
                .add_set_elements(name, &[element])
                .await
                .map_err(|err| ApiError::Apply {
                    kernel_reason: err.message,
                })?;
            if set.is_persistent() {
                self.persist(set);
            }
            self.center.notify(Event::SetUpdated {
                name: name.to_string(),
                elements: set.elements.len(),
            });
        }
        Ok(OpResult::Done)
    }

    async fn remove(
        &self,
        sets: &mut BTreeMap<String, ManagedSet>,
        name: &str,
        element: &str,
    ) -> Result<OpResult, ApiError> {
        let set = runtime_set(sets, name)?;
        if set.elements.remove(element) {
            self.backend
                .remove_set_element(name, element)
                .await
                .map_err(|err| ApiError::Apply {
                    kernel_reason: err.message,
                })?;
            if set.is_persistent() {
                self.persist(set);
            }
            self.center.notify(Event::SetUpdated {
                name: name.to_string(),
                elements: set.elements.len(),
            });
        }
        Ok(OpResult::Done)
    }

    async fn flush(
        &self,
        sets: &mut BTreeMap<String, ManagedSet>,
        name: &str,
    ) -> Result<OpResult, ApiError> {
        let set = runtime_set(sets, name)?;
        set.elements.clear();
        self.backend
            .flush_set(name)
            .await
            .map_err(|err| ApiError::Apply {
                kernel_reason: err.message,
            })?;
        if set.is_persistent() {
            self.persist(set);
        }
        self.center.notify(Event::SetUpdated {
            name: name.to_string(),
            elements: 0,
        });
        Ok(OpResult::Done)
    }

    //--- Refreshing

    /// Start the background refresher appropriate for the set's source.
    fn spawn_refresher(&self, manifest: &SetManifest) -> Option<tokio::task::JoinHandle<()>> {
        if self.center.config.daemon.test_mode {
            return None;
        }

        match &manifest.source {
            SetSource::Url {
                url,
                refresh_secs,
                max_elements,
            } => {
                let name = manifest.name.clone();
                let elem = manifest.elem;
                let url = url.clone();
                let interval = Duration::from_secs((*refresh_secs).max(60));
                let cap = *max_elements;
                let cmd_tx = self.cmd_tx.clone();
                Some(tokio::spawn(async move {
                    loop {
                        match fetch_feed(&url, elem, cap).await {
                            Ok(elements) => {
                                let _ = cmd_tx.send(SetMgrCommand::Fetched {
                                    name: name.clone(),
                                    elements,
                                });
                            }
                            Err(err) => {
                                warn!("Feed fetch for set '{name}' failed: {err}");
                            }
                        }
                        tokio::time::sleep(interval).await;
                    }
                }))
            }
            SetSource::Dns {
                domains,
                min_refresh_secs,
            } => {
                let name = manifest.name.clone();
                let elem = manifest.elem;
                let domains = domains.clone();
                let interval = Duration::from_secs((*min_refresh_secs).max(30));
                let cmd_tx = self.cmd_tx.clone();
                Some(tokio::spawn(async move {
                    loop {
                        match resolve_domains(&domains, elem).await {
                            Ok(elements) => {
                                let _ = cmd_tx.send(SetMgrCommand::Fetched {
                                    name: name.clone(),
                                    elements,
                                });
                            }
                            Err(err) => {
                                warn!("DNS refresh for set '{name}' failed: {err}");
                            }
                        }
                        tokio::time::sleep(interval).await;
                    }
                }))
            }
            _ => None,
        }
    }

    /// Install freshly fetched contents.
    ///
    /// The two refresher kinds install differently: a feed replaces the
    /// kernel set wholesale in one transaction (its staged contents are
    /// authoritative), while a DNS refresh touches only the addresses that
    /// actually changed, leaving the rest of the set undisturbed.
    async fn install_fetched(
        &self,
        sets: &mut BTreeMap<String, ManagedSet>,
        name: &str,
        elements: BTreeSet<String>,
    ) {
        let Some(set) = sets.get_mut(name) else {
            return;
        };
        if set.elements == elements {
            return;
        }

        match &set.manifest.source {
            SetSource::Url { .. } => {
                let staged: Vec<String> = elements.iter().cloned().collect();
                if let Err(err) = self.backend.replace_set_elements(name, &staged).await {
                    warn!("Could not install the fetched feed into set '{name}': {err}");
                    return;
                }
                info!(elements = staged.len(), "Installed feed into set '{name}'");
            }
            _ => {
                let added: Vec<String> = elements.difference(&set.elements).cloned().collect();
                let removed: Vec<String> = set.elements.difference(&elements).cloned().collect();

                if let Err(err) = self.backend.add_set_elements(name, &added).await {
                    warn!("Could not add elements to set '{name}': {err}");
                    return;
                }
                for element in &removed {
                    if let Err(err) = self.backend.remove_set_element(name, element).await {
                        warn!("Could not remove element from set '{name}': {err}");
                    }
                }
                info!(
                    added = added.len(),
                    removed = removed.len(),
                    "Refreshed set '{name}'"
                );
            }
        }

        set.elements = elements;
        if set.is_persistent() {
            self.persist(set);
        }
        self.center.notify(Event::SetUpdated {
            name: name.to_string(),
            elements: set.elements.len(),
        });
    }

    //--- Cache files

    fn cache_path(&self, name: &str) -> Utf8PathBuf {
        self.center.config.set_cache_dir().join(format!("{name}.set"))
    }

    fn persist(&self, set: &ManagedSet) {
        let path = self.cache_path(&set.manifest.name);
        let mut text = String::new();
        for element in &set.elements {
            text.push_str(element);
            text.push('\n');
        }
        if let Err(err) = crate::util::write_file(&path, text.as_bytes()) {
            warn!("Could not persist set '{}': {err}", set.manifest.name);
        }
    }

    fn load_cache(&self, name: &str) -> BTreeSet<String> {
        let path = self.cache_path(name);
        match std::fs::read_to_string(path.as_std_path()) {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => BTreeSet::new(),
        }
    }
}

fn runtime_set<'a>(
    sets: &'a mut BTreeMap<String, ManagedSet>,
    name: &str,
) -> Result<&'a mut ManagedSet, ApiError> {
    let set = sets.get_mut(name).ok_or_else(|| unknown_set(name))?;
    if !matches!(set.manifest.source, SetSource::Runtime { .. }) {
        return Err(ApiError::Validate {
            path: format!("ipset[{name}]"),
            reason: "only runtime sets can be mutated directly".into(),
        });
    }
    Ok(set)
}

fn unknown_set(name: &str) -> ApiError {
    ApiError::Validate {
        path: format!("ipset[{name}]"),
        reason: "no such managed set".into(),
    }
}

fn source_kind(source: &SetSource) -> &'static str {
    match source {
        SetSource::Static { .. } => "static",
        SetSource::Url { .. } => "url",
        SetSource::Dns { .. } => "dns",
        SetSource::Runtime { .. } => "runtime",
    }
}

fn check_element(elem: ElemKind, text: &str) -> Result<(), ApiError> {
    let ok = match elem {
        ElemKind::Ipv4 => text.parse::<std::net::Ipv4Addr>().is_ok(),
        ElemKind::Ipv6 => text.parse::<std::net::Ipv6Addr>().is_ok(),
        ElemKind::Cidr => text.parse::<ipnet::Ipv4Net>().is_ok(),
        ElemKind::Mac => {
            let bytes: Vec<&str> = text.split(':').collect();
            bytes.len() == 6 && bytes.iter().all(|b| u8::from_str_radix(b, 16).is_ok())
        }
    };
    if ok {
        Ok(())
    } else {
        Err(ApiError::Validate {
            path: "ipset".into(),
            reason: format!("'{text}' does not fit the set's element type"),
        })
    }
}

//--- Feed handling

/// Fetch and parse a URL-sourced feed.
async fn fetch_feed(
    url: &str,
    elem: ElemKind,
    max_elements: usize,
) -> Result<BTreeSet<String>, String> {
    let response = reqwest::get(url).await.map_err(|err| err.to_string())?;
    if !response.status().is_success() {
        return Err(format!("feed returned {}", response.status()));
    }
    let body = response.text().await.map_err(|err| err.to_string())?;
    Ok(parse_feed(&body, elem, max_elements))
}

/// Parse a plain-text feed: one element per line, `#` comments.
///
/// Entries that do not fit the element kind are skipped; the result is
/// capped at `max_elements`.
fn parse_feed(body: &str, elem: ElemKind, max_elements: usize) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for line in body.lines() {
        if out.len() >= max_elements {
            warn!("Feed truncated at {max_elements} elements");
            break;
        }
        let entry = line.split(['#', ';']).next().unwrap_or("").trim();
        if entry.is_empty() {
            continue;
        }
        if check_element(elem, entry).is_ok() {
            out.insert(entry.to_string());
        }
    }
    out
}

/// Resolve the domains of a DNS-sourced set.
async fn resolve_domains(domains: &[String], elem: ElemKind) -> Result<BTreeSet<String>, String> {
    let resolver = hickory_resolver::TokioResolver::builder_tokio()
        .map_err(|err| err.to_string())?
        .build();

    let mut out = BTreeSet::new();
    for domain in domains {
        let addrs = resolver
            .lookup_ip(domain.as_str())
            .await
            .map_err(|err| format!("{domain}: {err}"))?;
        for addr in addrs {
            let keep = match elem {
                ElemKind::Ipv4 | ElemKind::Cidr => addr.is_ipv4(),
                ElemKind::Ipv6 => addr.is_ipv6(),
                ElemKind::Mac => false,
            };
            if keep {
                out.insert(addr.to_string());
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nft::mock::MockBackend;
    use crate::test_support::{self, recv_result};

    fn runtime_manifest(name: &str, persist: bool) -> SetManifest {
        SetManifest {
            name: name.into(),
            elem: ElemKind::Ipv4,
            source: SetSource::Runtime { persist },
        }
    }

    fn url_manifest(name: &str) -> SetManifest {
        SetManifest {
            name: name.into(),
            elem: ElemKind::Ipv4,
            source: SetSource::Url {
                url: "https://feeds.example/blocklist.txt".into(),
                refresh_secs: 3600,
                max_elements: 100,
            },
        }
    }

    fn dns_manifest(name: &str) -> SetManifest {
        SetManifest {
            name: name.into(),
            elem: ElemKind::Ipv4,
            source: SetSource::Dns {
                domains: vec!["cdn.example".into()],
                min_refresh_secs: 300,
            },
        }
    }

    struct Rig {
        tx: mpsc::UnboundedSender<SetMgrCommand>,
        backend: Arc<MockBackend>,
        _dir: tempfile::TempDir,
    }

    async fn rig() -> Rig {
        let (center, _apply_rx, dir) = test_support::test_center().await;
        let backend = Arc::new(MockBackend::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let unit = SetManager {
            center,
            backend: backend.clone(),
            cmd_tx: tx.clone(),
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(unit.run(rx, ready_tx));
        let _ = ready_rx.await;
        Rig {
            tx,
            backend,
            _dir: dir,
        }
    }

    impl Rig {
        async fn bootstrap(&self, manifests: Vec<SetManifest>) {
            self.tx
                .send(SetMgrCommand::Bootstrap { manifests })
                .unwrap();
            self.restore_all().await;
        }

        async fn restore_all(&self) {
            let (reply, rx) = oneshot::channel();
            self.tx.send(SetMgrCommand::RestoreAll { reply }).unwrap();
            let _ = rx.await;
        }

        async fn add(&self, name: &str, element: &str) -> Result<OpResult, ApiError> {
            let (reply, rx) = oneshot::channel();
            self.tx
                .send(SetMgrCommand::Add {
                    name: name.into(),
                    element: element.into(),
                    reply,
                })
                .unwrap();
            recv_result(rx).await
        }

        async fn show(&self, name: &str) -> Result<OpResult, ApiError> {
            let (reply, rx) = oneshot::channel();
            self.tx
                .send(SetMgrCommand::Show {
                    name: name.into(),
                    reply,
                })
                .unwrap();
            recv_result(rx).await
        }

        async fn reload(&self, manifests: Vec<SetManifest>, changes: SetChanges) {
            let (reply, rx) = oneshot::channel();
            self.tx
                .send(SetMgrCommand::PrepareReload {
                    manifests,
                    changes,
                    reply,
                })
                .unwrap();
            let _ = rx.await;

            let (reply, rx) = oneshot::channel();
            self.tx
                .send(SetMgrCommand::RestoreCarried { reply })
                .unwrap();
            rx.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn runtime_add_reaches_the_kernel_and_survives_a_reload() {
        let rig = rig().await;
        rig.bootstrap(vec![runtime_manifest("blocked", false)]).await;

        rig.add("blocked", "1.2.3.4").await.unwrap();
        assert_eq!(
            rig.backend.state.lock().unwrap().sets["blocked"]
                .iter()
                .collect::<Vec<_>>(),
            ["1.2.3.4"]
        );

        // Reload with the set in both generations: smart flush carries it.
        rig.reload(
            vec![runtime_manifest("blocked", false)],
            SetChanges {
                carried: vec!["blocked".into()],
                ..Default::default()
            },
        )
        .await;

        let shown = rig.show("blocked").await.unwrap();
        let OpResult::SetElements { elements, .. } = shown else {
            panic!("expected elements");
        };
        assert_eq!(elements, ["1.2.3.4"]);
    }

    #[tokio::test]
    async fn removed_sets_are_discarded_on_reload() {
        let rig = rig().await;
        rig.bootstrap(vec![runtime_manifest("blocked", false)]).await;
        rig.add("blocked", "1.2.3.4").await.unwrap();

        rig.reload(
            Vec::new(),
            SetChanges {
                discarded: vec!["blocked".into()],
                ..Default::default()
            },
        )
        .await;

        assert!(matches!(
            rig.show("blocked").await.unwrap_err(),
            ApiError::Validate { .. }
        ));
    }

    #[tokio::test]
    async fn elements_must_fit_the_set_type() {
        let rig = rig().await;
        rig.bootstrap(vec![runtime_manifest("blocked", false)]).await;

        assert!(matches!(
            rig.add("blocked", "not-an-address").await.unwrap_err(),
            ApiError::Validate { .. }
        ));
        assert!(matches!(
            rig.add("blocked", "2001:db8::1").await.unwrap_err(),
            ApiError::Validate { .. }
        ));
    }

    #[tokio::test]
    async fn feeds_replace_wholesale_and_dns_updates_differentially() {
        let rig = rig().await;
        rig.bootstrap(vec![url_manifest("threats"), dns_manifest("cdn")])
            .await;

        // A fetched feed lands as one atomic replacement.
        rig.tx
            .send(SetMgrCommand::Fetched {
                name: "threats".into(),
                elements: ["1.1.1.1".to_string(), "2.2.2.2".to_string()].into(),
            })
            .unwrap();

        // A DNS refresh, then a second one that swaps one address.
        rig.tx
            .send(SetMgrCommand::Fetched {
                name: "cdn".into(),
                elements: ["3.3.3.3".to_string()].into(),
            })
            .unwrap();
        rig.tx
            .send(SetMgrCommand::Fetched {
                name: "cdn".into(),
                elements: ["4.4.4.4".to_string()].into(),
            })
            .unwrap();
        rig.restore_all().await;

        let state = rig.backend.state.lock().unwrap();
        assert!(state.set_ops.iter().any(|op| op == "replace threats (2)"));
        assert!(!state.set_ops.iter().any(|op| op.starts_with("replace cdn")));
        assert!(state.set_ops.iter().any(|op| op == "add cdn (1)"));
        assert!(state.set_ops.iter().any(|op| op == "remove cdn 3.3.3.3"));
        assert_eq!(
            state.sets["cdn"].iter().collect::<Vec<_>>(),
            ["4.4.4.4"]
        );
        assert_eq!(state.sets["threats"].len(), 2);
    }

    #[test]
    fn feeds_parse_with_comments_and_caps() {
        let body = "\
# a threat feed
1.2.3.4
5.6.7.8   # known scanner
not an address
9.9.9.9
";
        let parsed = parse_feed(body, ElemKind::Ipv4, 100);
        assert_eq!(parsed.len(), 3);
        assert!(parsed.contains("5.6.7.8"));

        let capped = parse_feed(body, ElemKind::Ipv4, 2);
        assert_eq!(capped.len(), 2);
    }
}
