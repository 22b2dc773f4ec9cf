//! Peer identity tokens.
//!
//! The RIB task and the acceptor both need to refer to a peer without
//! holding a handle back into that peer's task — otherwise peer → RIB →
//! peer forms a reference cycle. [`PeerId`] is the token that breaks it: the
//! RIB stores routes keyed by `PeerId`, and fans outbound UPDATEs out
//! through a registry mapping `PeerId` back to that peer's inbound channel.

// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tokio::sync::mpsc;

use crate::rib::RibToPeer;

/// Opaque handle identifying a configured peer session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u32);

/// Everything the RIB needs to know about a peer without owning its task.
#[derive(Clone, Debug)]
pub struct PeerMeta {
    pub asn: u16,
    pub address: Ipv4Addr,
    /// Lowest router-id tie-break (spec Section 4.5.2) uses the peer's BGP
    /// identifier. For point-to-point sessions this speaker requires the
    /// OPEN's BGP identifier to equal the peer's configured address, so it's
    /// known upfront rather than learned dynamically.
    pub router_id: Option<Ipv4Addr>,
    pub is_ebgp: bool,
    pub to_peer: mpsc::Sender<RibToPeer>,
}

/// Registry of every configured peer, indexed by [`PeerId`].
///
/// Owned jointly in spirit by the RIB task (for fan-out) and the acceptor
/// (for remote-address demux); in this single-process design both simply
/// hold an `Arc` to the same instance built once at startup, since
/// membership is fixed for the process lifetime (peers are configured, not
/// dynamically added).
#[derive(Clone, Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerMeta>,
    by_address: HashMap<Ipv4Addr, PeerId>,
    next: u32,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, meta: PeerMeta) -> PeerId {
        let id = PeerId(self.next);
        self.next += 1;
        self.by_address.insert(meta.address, id);
        self.peers.insert(id, meta);
        id
    }

    #[must_use]
    pub fn by_address(&self, address: Ipv4Addr) -> Option<PeerId> {
        self.by_address.get(&address).copied()
    }

    #[must_use]
    pub fn get(&self, id: PeerId) -> Option<&PeerMeta> {
        self.peers.get(&id)
    }

    pub fn set_router_id(&mut self, id: PeerId, router_id: Ipv4Addr) {
        if let Some(meta) = self.peers.get_mut(&id) {
            meta.router_id = Some(router_id);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &PeerMeta)> {
        self.peers.iter().map(|(id, meta)| (*id, meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_looks_up_by_address() {
        let mut reg = PeerRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let id = reg.register(PeerMeta {
            asn: 65001,
            address: "192.0.2.2".parse().unwrap(),
            router_id: None,
            is_ebgp: true,
            to_peer: tx,
        });
        assert_eq!(reg.by_address("192.0.2.2".parse().unwrap()), Some(id));
        assert_eq!(reg.get(id).unwrap().asn, 65001);
    }

    #[test]
    fn distinct_peers_get_distinct_ids() {
        let mut reg = PeerRegistry::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        let a = reg.register(PeerMeta {
            asn: 65001,
            address: "192.0.2.2".parse().unwrap(),
            router_id: None,
            is_ebgp: true,
            to_peer: tx1,
        });
        let b = reg.register(PeerMeta {
            asn: 65002,
            address: "192.0.2.3".parse().unwrap(),
            router_id: None,
            is_ebgp: true,
            to_peer: tx2,
        });
        assert_ne!(a, b);
    }
}
