//! The Routing Information Base: Adj-RIB-In per peer, Loc-RIB, Adj-RIB-Out
//! per peer, the decision process, and the kernel/peer fan-out it drives.
//!
//! Runs as a single task (spec Section 5, "a single RIB task serializes all
//! decision-process mutations") so ordering across peers is a total order
//! given by arrival at this task's inbound channel.

// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use tokio::sync::mpsc;

use bgpd_proto::path_attr::{Data, Flags, Origin, PathAttribute, PathAttributes, Type};
use bgpd_proto::prefix::Prefix;
use bgpd_proto::Update;

use crate::kernel::{KernelCommand, KernelEvent};
use crate::registry::{PeerId, PeerRegistry};

/// Default LOCAL_PREF when the attribute is absent (spec Section 4.5.2).
const DEFAULT_LOCAL_PREF: u32 = 100;

/// A single candidate path toward a prefix, as received from one peer.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub prefix: Prefix,
    pub attrs: PathAttributes,
    pub peer: PeerId,
    pub local_pref: u32,
}

impl Route {
    fn from_update_attrs(prefix: Prefix, attrs: PathAttributes, peer: PeerId) -> Self {
        let local_pref = match attrs.get(Type::LocalPref as u8) {
            Some(PathAttribute { data: Data::LocalPref(v), .. }) => *v,
            _ => DEFAULT_LOCAL_PREF,
        };
        Self { prefix, attrs, peer, local_pref }
    }

    fn origin(&self) -> Origin {
        match self.attrs.get(Type::Origin as u8) {
            Some(PathAttribute { data: Data::Origin(o), .. }) => *o,
            _ => Origin::Incomplete,
        }
    }

    fn as_path_len(&self) -> usize {
        match self.attrs.get(Type::AsPath as u8) {
            Some(PathAttribute { data: Data::AsPath(p), .. }) => p.path_length(),
            _ => 0,
        }
    }

    fn first_asn(&self) -> Option<u16> {
        match self.attrs.get(Type::AsPath as u8) {
            Some(PathAttribute { data: Data::AsPath(p), .. }) => p.first_asn(),
            _ => None,
        }
    }

    fn med(&self) -> Option<u32> {
        match self.attrs.get(Type::MultiExitDisc as u8) {
            Some(PathAttribute { data: Data::MultiExitDisc(m), .. }) => Some(*m),
            _ => None,
        }
    }

    fn next_hop(&self) -> Ipv4Addr {
        match self.attrs.get(Type::NextHop as u8) {
            Some(PathAttribute { data: Data::NextHop(addr), .. }) => *addr,
            _ => Ipv4Addr::UNSPECIFIED,
        }
    }
}

fn origin_rank(origin: Origin) -> u8 {
    match origin {
        Origin::Igp => 0,
        Origin::Egp => 1,
        Origin::Incomplete => 2,
    }
}

/// Compares two candidate routes for the same prefix, `Less` meaning `a` is
/// preferred, per the six-level tie-break (spec Section 4.5.2).
fn compare_routes(a: &Route, b: &Route, registry: &PeerRegistry) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    b.local_pref
        .cmp(&a.local_pref)
        .then_with(|| a.as_path_len().cmp(&b.as_path_len()))
        .then_with(|| origin_rank(a.origin()).cmp(&origin_rank(b.origin())))
        .then_with(|| {
            if a.first_asn().is_some() && a.first_asn() == b.first_asn() {
                a.med().unwrap_or(0).cmp(&b.med().unwrap_or(0))
            } else {
                Ordering::Equal
            }
        })
        .then_with(|| {
            let a_ebgp = registry.get(a.peer).is_some_and(|m| m.is_ebgp);
            let b_ebgp = registry.get(b.peer).is_some_and(|m| m.is_ebgp);
            b_ebgp.cmp(&a_ebgp)
        })
        .then_with(|| {
            let a_id = registry.get(a.peer).and_then(|m| m.router_id).unwrap_or(Ipv4Addr::BROADCAST);
            let b_id = registry.get(b.peer).and_then(|m| m.router_id).unwrap_or(Ipv4Addr::BROADCAST);
            u32::from(a_id).cmp(&u32::from(b_id))
        })
}

/// Picks the best route among candidates for one prefix, or `None` if the
/// set is empty (the prefix should be withdrawn).
fn best_path<'a>(candidates: impl Iterator<Item = &'a Route>, registry: &PeerRegistry) -> Option<&'a Route> {
    candidates.min_by(|a, b| compare_routes(a, b, registry))
}

/// Commands a peer task sends into the RIB.
#[derive(Debug)]
pub enum RibCommand {
    Update { peer: PeerId, update: Update },
    WithdrawPeer { peer: PeerId },
    /// Sent once, on entering Established: publish this speaker's
    /// locally-originated networks to `peer` only.
    PublishLocal { peer: PeerId, networks: Vec<Prefix> },
}

/// An outbound UPDATE the RIB hands to a specific peer's Adj-RIB-Out.
#[derive(Clone, Debug, PartialEq)]
pub struct RibToPeer(pub Update);

pub struct Rib {
    local_asn: u16,
    local_addr: Ipv4Addr,
    registry: PeerRegistry,
    adj_in: HashMap<PeerId, HashMap<Prefix, Route>>,
    loc_rib: HashMap<Prefix, Vec<Route>>,
    adj_out: HashMap<PeerId, HashSet<Prefix>>,
    kernel_commands: mpsc::Sender<KernelCommand>,
}

impl Rib {
    #[must_use]
    pub fn new(local_asn: u16, local_addr: Ipv4Addr, registry: PeerRegistry, kernel_commands: mpsc::Sender<KernelCommand>) -> Self {
        Self {
            local_asn,
            local_addr,
            registry,
            adj_in: HashMap::new(),
            loc_rib: HashMap::new(),
            adj_out: HashMap::new(),
            kernel_commands,
        }
    }

    /// Drives the RIB task: processes inbound commands and advisory kernel
    /// events until both channels close.
    pub async fn run(mut self, mut commands: mpsc::Receiver<RibCommand>, mut kernel_events: mpsc::Receiver<KernelEvent>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(RibCommand::Update { peer, update }) => self.handle_update(peer, update).await,
                        Some(RibCommand::WithdrawPeer { peer }) => self.withdraw_peer(peer).await,
                        Some(RibCommand::PublishLocal { peer, networks }) => self.publish_local(peer, networks).await,
                        None => return,
                    }
                }
                event = kernel_events.recv() => {
                    match event {
                        Some(event) => self.note_kernel_event(&event),
                        None => return,
                    }
                }
            }
        }
    }

    /// Kernel events are advisory only (spec Section 4.5.3): they never
    /// mutate BGP state, only get logged.
    fn note_kernel_event(&self, event: &KernelEvent) {
        match event {
            KernelEvent::Add { prefix, gateway } => {
                log::debug!("kernel reports externally-added route {prefix} via {gateway}");
            }
            KernelEvent::Del { prefix } => {
                log::debug!("kernel reports externally-removed route {prefix}");
            }
            KernelEvent::Err(message) => {
                log::warn!("kernel route monitor error: {message}");
            }
        }
    }

    async fn handle_update(&mut self, peer: PeerId, update: Update) {
        let mut dirty = HashSet::new();

        for prefix in update.withdrawn_routes.iter() {
            if let Some(table) = self.adj_in.get_mut(&peer) {
                table.remove(prefix);
            }
            dirty.insert(*prefix);
        }

        for prefix in update.nlri.iter() {
            let route = Route::from_update_attrs(*prefix, update.path_attrs.clone(), peer);
            self.adj_in.entry(peer).or_default().insert(*prefix, route);
            dirty.insert(*prefix);
        }

        for prefix in dirty {
            self.reselect(prefix, Some(peer)).await;
        }
    }

    async fn withdraw_peer(&mut self, peer: PeerId) {
        let Some(table) = self.adj_in.remove(&peer) else { return };
        let prefixes: Vec<Prefix> = table.into_keys().collect();
        for prefix in prefixes {
            self.reselect(prefix, Some(peer)).await;
        }
        self.adj_out.remove(&peer);
    }

    async fn publish_local(&mut self, peer: PeerId, networks: Vec<Prefix>) {
        if networks.is_empty() {
            return;
        }
        let attrs = self.local_origination_attrs();
        let is_ebgp = self.registry.get(peer).is_some_and(|m| m.is_ebgp);
        let transformed = transform_outbound(&attrs, is_ebgp, self.local_asn, self.local_addr);
        let update = Update {
            withdrawn_routes: Default::default(),
            path_attrs: transformed,
            nlri: networks.into_iter().collect(),
        };
        self.send_to_peer(peer, update).await;
    }

    fn local_origination_attrs(&self) -> PathAttributes {
        PathAttributes(vec![
            PathAttribute { flags: Flags::new(false, true, false, false), data: Data::Origin(Origin::Igp) },
            PathAttribute {
                flags: Flags::new(false, true, false, false),
                data: Data::AsPath(bgpd_proto::path_attr::AsPath(vec![])),
            },
            PathAttribute { flags: Flags::new(false, true, false, false), data: Data::NextHop(self.local_addr) },
        ])
    }

    /// Re-run best-path selection for `prefix`; if the winner changed,
    /// install/delete in the kernel and fan the change out to every other
    /// peer (spec Section 4.5, steps 3a/3b).
    async fn reselect(&mut self, prefix: Prefix, source_peer: Option<PeerId>) {
        let previous_best = self.loc_rib.get(&prefix).and_then(|routes| best_path(routes.iter(), &self.registry)).cloned();

        let mut candidates: Vec<Route> = self
            .adj_in
            .values()
            .filter_map(|table| table.get(&prefix))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| compare_routes(a, b, &self.registry));
        let new_best = candidates.first().cloned();

        if candidates.is_empty() {
            self.loc_rib.remove(&prefix);
        } else {
            self.loc_rib.insert(prefix, candidates);
        }

        let changed = match (&previous_best, &new_best) {
            (None, None) => false,
            (Some(a), Some(b)) => a.peer != b.peer || a.attrs != b.attrs,
            _ => true,
        };
        if !changed {
            return;
        }

        self.sync_kernel(prefix, previous_best.as_ref(), new_best.as_ref()).await;
        self.fan_out(prefix, new_best.as_ref(), source_peer).await;
    }

    async fn sync_kernel(&self, prefix: Prefix, previous: Option<&Route>, new: Option<&Route>) {
        if previous.is_some() {
            let _ = self.kernel_commands.send(KernelCommand::Del { prefix }).await;
        }
        if let Some(route) = new {
            let _ = self
                .kernel_commands
                .send(KernelCommand::Add { prefix, gateway: route.next_hop(), priority: 0 })
                .await;
        }
    }

    async fn fan_out(&mut self, prefix: Prefix, new_best: Option<&Route>, source_peer: Option<PeerId>) {
        let peer_ids: Vec<PeerId> = self.registry.iter().map(|(id, _)| id).collect();
        for peer in peer_ids {
            // Split horizon: skip the peer that triggered this reselection
            // and the peer that originated the winning path, matching spec
            // Section 4.5 step 3b's "for each peer Q != P (and Q != the
            // best path's originator)".
            if Some(peer) == source_peer || new_best.is_some_and(|best| best.peer == peer) {
                continue;
            }

            let update = match new_best {
                Some(route) => {
                    let is_ebgp = self.registry.get(peer).is_some_and(|m| m.is_ebgp);
                    let attrs = transform_outbound(&route.attrs, is_ebgp, self.local_asn, self.local_addr);
                    Update { withdrawn_routes: Default::default(), path_attrs: attrs, nlri: vec![prefix].into_iter().collect() }
                }
                None => {
                    if !self.adj_out.get(&peer).is_some_and(|s| s.contains(&prefix)) {
                        continue;
                    }
                    Update { withdrawn_routes: vec![prefix].into_iter().collect(), path_attrs: Default::default(), nlri: Default::default() }
                }
            };

            match new_best {
                Some(_) => {
                    self.adj_out.entry(peer).or_default().insert(prefix);
                }
                None => {
                    if let Some(set) = self.adj_out.get_mut(&peer) {
                        set.remove(&prefix);
                    }
                }
            }

            self.send_to_peer(peer, update).await;
        }
    }

    async fn send_to_peer(&self, peer: PeerId, update: Update) {
        if let Some(meta) = self.registry.get(peer) {
            let _ = meta.to_peer.send(RibToPeer(update)).await;
        }
    }
}

/// Attribute transforms applied when re-advertising a route (spec Section
/// 4.5.1): eBGP gets AS_PATH prepended and NEXT_HOP rewritten to us; iBGP
/// keeps AS_PATH, NEXT_HOP, MED and LOCAL_PREF untouched.
fn transform_outbound(attrs: &PathAttributes, to_ebgp: bool, local_asn: u16, local_addr: Ipv4Addr) -> PathAttributes {
    if !to_ebgp {
        return attrs.clone();
    }
    let mut out = Vec::with_capacity(attrs.len());
    for attr in attrs.iter() {
        match &attr.data {
            Data::AsPath(path) => {
                let mut path = path.clone();
                path.prepend(local_asn);
                out.push(PathAttribute { flags: attr.flags, data: Data::AsPath(path) });
            }
            Data::NextHop(_) => {
                out.push(PathAttribute { flags: attr.flags, data: Data::NextHop(local_addr) });
            }
            _ => out.push(attr.clone()),
        }
    }
    PathAttributes(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PeerMeta;
    use bgpd_proto::path_attr::{AsPath, AsSegment, AsSegmentType};

    fn registry_with_two_peers() -> (PeerRegistry, PeerId, PeerId, mpsc::Receiver<RibToPeer>, mpsc::Receiver<RibToPeer>) {
        let mut registry = PeerRegistry::new();
        let (tx_a, rx_a) = mpsc::channel(8);
        let (tx_b, rx_b) = mpsc::channel(8);
        let a = registry.register(PeerMeta {
            asn: 65001,
            address: "192.0.2.2".parse().unwrap(),
            router_id: Some("1.1.1.1".parse().unwrap()),
            is_ebgp: true,
            to_peer: tx_a,
        });
        let b = registry.register(PeerMeta {
            asn: 65002,
            address: "192.0.2.3".parse().unwrap(),
            router_id: Some("2.2.2.2".parse().unwrap()),
            is_ebgp: true,
            to_peer: tx_b,
        });
        (registry, a, b, rx_a, rx_b)
    }

    fn route_with(prefix: Prefix, peer: PeerId, as_path_len: usize, local_pref: u32) -> Route {
        let segments = vec![AsSegment { type_: AsSegmentType::AsSequence, asns: (0..as_path_len as u16).collect() }];
        let attrs = PathAttributes(vec![
            PathAttribute { flags: Flags::new(false, true, false, false), data: Data::Origin(Origin::Igp) },
            PathAttribute { flags: Flags::new(false, true, false, false), data: Data::AsPath(AsPath(segments)) },
            PathAttribute { flags: Flags::new(false, true, false, false), data: Data::NextHop("10.0.0.1".parse().unwrap()) },
            PathAttribute { flags: Flags::new(false, true, false, false), data: Data::LocalPref(local_pref) },
        ]);
        Route::from_update_attrs(prefix, attrs, peer)
    }

    /// S5 — shorter AS_PATH wins at equal LOCAL_PREF; raising the loser's
    /// LOCAL_PREF above the winner's flips the result.
    #[test]
    fn s5_best_path_tie_break() {
        let (registry, a, b, _rx_a, _rx_b) = registry_with_two_peers();
        let prefix = Prefix::new(24, "10.0.0.0".parse().unwrap());

        let route_a = route_with(prefix, a, 2, 100);
        let route_b = route_with(prefix, b, 4, 100);
        let candidates = vec![route_a.clone(), route_b.clone()];
        let best = best_path(candidates.iter(), &registry).unwrap();
        assert_eq!(best.peer, a);

        let route_b_pref = route_with(prefix, b, 4, 200);
        let candidates = vec![route_a, route_b_pref];
        let best = best_path(candidates.iter(), &registry).unwrap();
        assert_eq!(best.peer, b);
    }

    #[tokio::test]
    async fn withdrawing_a_peer_clears_its_loc_rib_contribution() {
        let (registry, a, _b, _rx_a, _rx_b) = registry_with_two_peers();
        let (kernel_tx, mut kernel_rx) = mpsc::channel(8);
        let mut rib = Rib::new(65000, "192.0.2.1".parse().unwrap(), registry, kernel_tx);

        let prefix = Prefix::new(24, "10.0.0.0".parse().unwrap());
        let route = route_with(prefix, a, 2, 100);
        rib.adj_in.entry(a).or_default().insert(prefix, route);
        rib.reselect(prefix, None).await;
        assert!(rib.loc_rib.contains_key(&prefix));
        assert!(matches!(kernel_rx.recv().await, Some(KernelCommand::Add { .. })));

        rib.withdraw_peer(a).await;
        assert!(!rib.loc_rib.contains_key(&prefix));
        assert!(matches!(kernel_rx.recv().await, Some(KernelCommand::Del { .. })));
    }
}
