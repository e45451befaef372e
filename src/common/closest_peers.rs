use std::vec::IntoIter;

use crate::common::{Id, Peer};

#[derive(Debug, Clone)]
/// Peers ordered by ascending XOR distance to a target, without duplicate ids.
pub struct ClosestPeers {
    target: Id,
    peers: Vec<Peer>,
}

impl ClosestPeers {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            peers: Vec::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    // === Public Methods ===

    /// Insert a peer at its distance rank. A peer whose id is already present
    /// replaces the existing record (later-seen address wins).
    pub fn add(&mut self, peer: Peer) {
        if let Some(existing) = self.peers.iter_mut().find(|p| p.id() == peer.id()) {
            *existing = peer;
            return;
        }

        let seek = peer.id().distance(&self.target);

        // Equal distances imply equal ids, so ties only ever come from
        // duplicates handled above.
        let pos = self
            .peers
            .partition_point(|probe| probe.id().distance(&self.target) < seek);

        self.peers.insert(pos, peer);
    }

    /// Keep only the `k` closest peers.
    pub fn truncate(&mut self, k: usize) {
        self.peers.truncate(k);
    }
}

impl IntoIterator for ClosestPeers {
    type Item = Peer;
    type IntoIter = IntoIter<Peer>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestPeers {
    type Item = &'a Peer;
    type IntoIter = std::slice::Iter<'a, Peer>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers.iter()
    }
}

/// Return at most `k` of the `candidates` sorted by ascending XOR distance
/// to `target`, skipping `exclude` (the local node) and duplicate ids.
pub fn nearest<'a, I>(target: &Id, k: usize, candidates: I, exclude: &Id) -> Vec<Peer>
where
    I: IntoIterator<Item = &'a Peer>,
{
    let mut closest = ClosestPeers::new(*target);

    for peer in candidates {
        if peer.id() != exclude {
            closest.add(peer.clone());
        }
    }

    closest.truncate(k);
    closest.into_iter().collect()
}
