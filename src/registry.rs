// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bookkeeping of the connected peers: id allocation, the peer table, and
//! the acknowledgement barrier used while a new peer joins.

use crate::annotation::MAX_PEERS;
use crate::protocol::Message;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc;

/// Reply sent to a peer that failed the password check.
pub const ID_AUTH_FAILED: i64 = -1;
/// Reply sent when all peer ids are taken.
pub const ID_REGISTRY_FULL: i64 = -2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("peer {0} is no longer reachable")]
pub struct DeadPeer(pub i64);

/// One connected peer. The address is the canonical identity of the
/// connection; the id is what all protocol messages refer to.
#[derive(Debug)]
pub struct Peer {
    pub id: i64,
    pub name: String,
    pub address: SocketAddr,
    pub cursor_index: usize,
    outbox: mpsc::UnboundedSender<Message>,
}

impl Peer {
    #[must_use]
    pub fn new(
        id: i64,
        name: String,
        address: SocketAddr,
        outbox: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            id,
            name,
            address,
            cursor_index: 0,
            outbox,
        }
    }

    /// Hands a message to the peer's connection task. Fails once the
    /// connection task is gone, which is how dead peers are detected.
    pub fn send(&self, message: Message) -> Result<(), DeadPeer> {
        self.outbox.send(message).map_err(|_| DeadPeer(self.id))
    }
}

#[derive(Debug)]
pub struct Registry {
    peers: BTreeMap<i64, Peer>,
    last_id: i64,
    awaiting_ack: bool,
    acknowledged: HashSet<i64>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            peers: BTreeMap::new(),
            last_id: -1,
            awaiting_ack: false,
            acknowledged: HashSet::new(),
        }
    }
}

impl Registry {
    /// Hands out the next free id, or [`ID_REGISTRY_FULL`] when every slot
    /// is taken. Ids count up first and wrap around to freed slots after,
    /// scanning the ring at most once.
    pub fn allocate_id(&mut self) -> i64 {
        let slots = MAX_PEERS as i64;
        for offset in 1..=slots {
            let id = (self.last_id + offset).rem_euclid(slots);
            if !self.peers.contains_key(&id) {
                self.last_id = id;
                return id;
            }
        }
        ID_REGISTRY_FULL
    }

    pub fn admit(&mut self, peer: Peer) {
        self.peers.insert(peer.id, peer);
    }

    pub fn evict(&mut self, id: i64) -> Option<Peer> {
        let peer = self.peers.remove(&id);
        if peer.is_some() && self.awaiting_ack {
            // A peer dying mid-handshake must not wedge the session.
            self.check_barrier();
        }
        peer
    }

    #[must_use]
    pub fn get(&self, id: i64) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: i64) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    #[must_use]
    pub fn contains_address(&self, address: &SocketAddr) -> bool {
        self.peers.values().any(|peer| peer.address == *address)
    }

    /// Peers in id order, which is also the broadcast order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<i64> {
        self.peers.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Opens the acknowledgement barrier: until every registered peer has
    /// confirmed, the dispatch loop defers everything else.
    pub fn await_acks(&mut self) {
        self.awaiting_ack = true;
        self.acknowledged.clear();
    }

    pub fn record_ack(&mut self, id: i64) {
        if self.awaiting_ack {
            self.acknowledged.insert(id);
            self.check_barrier();
        }
    }

    #[must_use]
    pub fn awaiting_ack(&self) -> bool {
        self.awaiting_ack
    }

    fn check_barrier(&mut self) {
        if self
            .peers
            .keys()
            .all(|id| self.acknowledged.contains(id))
        {
            self.awaiting_ack = false;
            self.acknowledged.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_peer(id: i64) -> (Peer, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let address = format!("127.0.0.1:{}", 40000 + id).parse().unwrap();
        (Peer::new(id, format!("peer-{id}"), address, tx), rx)
    }

    #[test]
    fn ids_count_up_from_zero() {
        let mut registry = Registry::default();
        assert_eq!(registry.allocate_id(), 0);
        assert_eq!(registry.allocate_id(), 1);
        assert_eq!(registry.allocate_id(), 2);
    }

    #[test]
    fn freed_ids_are_reused_after_wraparound() {
        let mut registry = Registry::default();
        for id in 0..MAX_PEERS as i64 {
            assert_eq!(registry.allocate_id(), id);
            let (peer, _rx) = test_peer(id);
            registry.admit(peer);
        }

        registry.evict(3);
        assert_eq!(registry.allocate_id(), 3);
    }

    #[test]
    fn full_registry_is_signalled() {
        let mut registry = Registry::default();
        let mut receivers = Vec::new();
        for id in 0..MAX_PEERS as i64 {
            registry.allocate_id();
            let (peer, rx) = test_peer(id);
            registry.admit(peer);
            receivers.push(rx);
        }
        assert_eq!(registry.allocate_id(), ID_REGISTRY_FULL);
    }

    #[test]
    fn allocation_never_returns_a_live_id() {
        let mut registry = Registry::default();
        let mut receivers = Vec::new();
        for id in 0..MAX_PEERS as i64 {
            registry.allocate_id();
            let (peer, rx) = test_peer(id);
            registry.admit(peer);
            receivers.push(rx);
        }
        registry.evict(0);
        registry.evict(7);
        let first = registry.allocate_id();
        let (peer, rx) = test_peer(first);
        registry.admit(peer);
        receivers.push(rx);
        let second = registry.allocate_id();

        assert_eq!(first, 0);
        assert_eq!(second, 7);
    }

    #[test]
    fn barrier_clears_once_every_peer_acknowledged() {
        let mut registry = Registry::default();
        let (peer_a, _rx_a) = test_peer(0);
        let (peer_b, _rx_b) = test_peer(1);
        registry.admit(peer_a);
        registry.admit(peer_b);

        registry.await_acks();
        assert!(registry.awaiting_ack());
        registry.record_ack(0);
        assert!(registry.awaiting_ack());
        registry.record_ack(1);
        assert!(!registry.awaiting_ack());
    }

    #[test]
    fn eviction_can_complete_the_barrier() {
        let mut registry = Registry::default();
        let (peer_a, _rx_a) = test_peer(0);
        let (peer_b, _rx_b) = test_peer(1);
        registry.admit(peer_a);
        registry.admit(peer_b);

        registry.await_acks();
        registry.record_ack(0);
        registry.evict(1);
        assert!(!registry.awaiting_ack());
    }

    #[test]
    fn send_to_a_dropped_connection_reports_a_dead_peer() {
        let (peer, rx) = test_peer(4);
        drop(rx);
        assert_eq!(
            peer.send(Message::server(crate::protocol::Body::RequestAck)),
            Err(DeadPeer(4))
        );
    }
}
