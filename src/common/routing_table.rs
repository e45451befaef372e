//! Bounded routing table keeping the peers nearest to the local node.

use std::collections::HashMap;

use crate::common::{nearest, Id, Peer};

/// K = the default capacity of the routing table.
pub const DEFAULT_BUCKET_SIZE: usize = 20;

#[derive(Debug, Clone)]
/// Routing table holding at most `capacity` peers.
///
/// Whenever an insertion pushes the table over capacity, it is rebuilt from
/// the `capacity` peers nearest to the local [Id] among everything it held
/// plus the newcomers, so it always keeps the nearest peers seen so far.
pub struct RoutingTable {
    id: Id,
    capacity: usize,
    peers: HashMap<Id, Peer>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] for a local node `id`, holding at most
    /// `capacity` peers.
    pub fn new(id: Id, capacity: usize) -> Self {
        RoutingTable {
            id,
            capacity,
            peers: HashMap::with_capacity(capacity + 1),
        }
    }

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // === Public Methods ===

    /// Insert or overwrite every peer by id, ignoring the local node, then
    /// shrink back to capacity if needed.
    pub fn add<I>(&mut self, peers: I)
    where
        I: IntoIterator<Item = Peer>,
    {
        for peer in peers {
            if peer.id() == &self.id {
                continue;
            }

            self.peers.insert(*peer.id(), peer);
        }

        self.shrink();
    }

    /// Upsert a single peer. Returns `true` if it was not known before.
    pub fn add_or_update(&mut self, peer: Peer) -> bool {
        if peer.id() == &self.id {
            return false;
        }

        let new = self.peers.insert(*peer.id(), peer).is_none();

        if new {
            self.shrink();
        }

        new
    }

    /// Remove a peer by id, returns the removed record if it was present.
    pub fn remove(&mut self, id: &Id) -> Option<Peer> {
        self.peers.remove(id)
    }

    /// Return at most `k` peers, sorted by ascending distance to `target`.
    pub fn nearest(&self, target: &Id, k: usize) -> Vec<Peer> {
        nearest(target, k, self.peers.values(), &self.id)
    }

    pub fn get(&self, id: &Id) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.peers.contains_key(id)
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Return the number of peers in this routing table.
    pub fn size(&self) -> usize {
        self.peers.len()
    }

    /// Returns an iterator over the peers in this routing table, in no particular order.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Export an owned vector of peers from this routing table.
    pub fn to_owned_peers(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    // === Private Methods ===

    fn shrink(&mut self) {
        if self.peers.len() <= self.capacity {
            return;
        }

        let kept = self.nearest(&self.id, self.capacity);

        self.peers = kept.into_iter().map(|peer| (*peer.id(), peer)).collect();
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use crate::common::ID_SIZE;

    use super::*;

    fn peer_at(id: Id) -> Peer {
        Peer::new(id, SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    #[test]
    fn table_is_empty() {
        let mut table = RoutingTable::new(Id::random(), DEFAULT_BUCKET_SIZE);
        assert!(table.is_empty());

        table.add_or_update(Peer::random());
        assert!(!table.is_empty());
    }

    #[test]
    fn to_owned_peers() {
        let mut table = RoutingTable::new(Id::random(), DEFAULT_BUCKET_SIZE);

        let expected_peers: Vec<Peer> = (0..20).map(|_| Peer::random()).collect();

        table.add(expected_peers.clone());

        let mut peers = table.to_owned_peers();
        peers.sort_by_key(|p| *p.id());
        let mut expected = expected_peers;
        expected.sort_by_key(|p| *p.id());

        assert_eq!(peers, expected);
    }

    #[test]
    fn contains() {
        let mut table = RoutingTable::new(Id::random(), DEFAULT_BUCKET_SIZE);

        let peer = Peer::random();

        assert!(!table.contains(peer.id()));

        table.add_or_update(peer.clone());
        assert!(table.contains(peer.id()));
    }

    #[test]
    fn remove() {
        let mut table = RoutingTable::new(Id::random(), DEFAULT_BUCKET_SIZE);

        let peer = Peer::random();

        table.add_or_update(peer.clone());
        assert!(table.contains(peer.id()));

        assert!(table.remove(peer.id()).is_some());
        assert!(!table.contains(peer.id()));

        // Absent peers are a no-op.
        assert!(table.remove(peer.id()).is_none());
    }

    #[test]
    fn entries_are_sets() {
        let mut table = RoutingTable::new(Id::random(), DEFAULT_BUCKET_SIZE);

        let peer1 = Peer::random();
        let peer2 = Peer::new(*peer1.id(), "10.0.0.9:4000".parse().unwrap());

        assert!(table.add_or_update(peer1));
        assert!(!table.add_or_update(peer2.clone()));

        assert_eq!(table.size(), 1);
        assert_eq!(
            table.get(peer2.id()).map(|p| p.address()),
            Some(peer2.address()),
            "later-seen address wins"
        );
    }

    #[test]
    fn should_not_add_self() {
        let id = Id::random();
        let mut table = RoutingTable::new(id, DEFAULT_BUCKET_SIZE);
        let peer = Peer::random().with_id(id);

        assert!(!table.add_or_update(peer.clone()));
        table.add(vec![peer]);

        assert!(table.is_empty());
    }

    #[test]
    fn keeps_nearest_k_seen_so_far() {
        let own = [0_u8; ID_SIZE];
        let mut table = RoutingTable::new(Id::from(own), 5);

        // Peers at increasing distance from our all-zero id.
        let peers: Vec<Peer> = (1..=10_u8)
            .map(|i| {
                let mut bytes = own;
                bytes[0] = i;
                peer_at(Id::from(bytes))
            })
            .collect();

        // Insert the far half first, then the near half one by one.
        table.add(peers[5..].to_vec());
        assert_eq!(table.size(), 5);

        for peer in peers[..5].iter().rev() {
            table.add_or_update(peer.clone());
            assert!(table.size() <= 5);
        }

        let mut ids: Vec<Id> = table.peers().map(|p| *p.id()).collect();
        ids.sort();
        let expected: Vec<Id> = peers[..5].iter().map(|p| *p.id()).collect();

        assert_eq!(ids, expected);
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut table = RoutingTable::new(Id::random(), DEFAULT_BUCKET_SIZE);

        for round in 0..10 {
            if round % 2 == 0 {
                table.add((0..15).map(|_| Peer::random()));
            } else {
                for _ in 0..15 {
                    table.add_or_update(Peer::random());
                }
            }

            assert!(table.size() <= DEFAULT_BUCKET_SIZE);
        }

        assert_eq!(table.size(), DEFAULT_BUCKET_SIZE);
    }

    #[test]
    fn nearest() {
        let mut table = RoutingTable::new(Id::random(), DEFAULT_BUCKET_SIZE);
        table.add((0..20).map(|_| Peer::random()));

        let target = Id::random();
        let closest = table.nearest(&target, 7);

        assert_eq!(closest.len(), 7);

        for pair in closest.windows(2) {
            assert!(pair[0].id().distance(&target) < pair[1].id().distance(&target));
        }

        let furthest_included = closest[6].id().distance(&target);
        let excluded = table
            .peers()
            .filter(|p| !closest.contains(p))
            .map(|p| p.id().distance(&target));

        for distance in excluded {
            assert!(distance > furthest_included);
        }
    }
}
