//! Manage iterative lookups and their corresponding requests/responses.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::common::{
    nearest, FindNodeRequestArguments, FindValueRequestArguments, Id, Peer, RequestSpecific,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The two flavors of iterative lookups.
pub enum LookupKind {
    FindNode,
    FindValue,
}

/// An iterative process of concurrently sending a request to the closest known peers to
/// the target, learning closer peers from the responses, and repeating this process
/// until no closer peers (that aren't already queried) are found.
///
/// Progresses in rounds: every peer of a round is contacted at once, and the next round
/// only starts after all of them either responded or failed.
#[derive(Debug)]
pub(crate) struct IterativeQuery {
    kind: LookupKind,
    target: Id,
    /// The local node, never queried nor returned.
    local_id: Id,
    fanout: usize,

    /// Every peer learned of, including the queried ones.
    discovered: HashMap<Id, Peer>,
    queried: HashSet<Id>,
    /// Queried peers that timed out or were unreachable.
    failed: HashSet<Id>,
    holders: Vec<Peer>,

    /// Requests of the current round, by magic.
    inflight_requests: HashMap<u32, Peer>,
    rounds: usize,
    done: bool,
}

impl IterativeQuery {
    pub fn new(kind: LookupKind, target: Id, local_id: Id, fanout: usize, seeds: Vec<Peer>) -> Self {
        trace!(?target, ?kind, seeds = seeds.len(), "New Query");

        let mut query = Self {
            kind,
            target,
            local_id,
            fanout,

            discovered: HashMap::new(),
            queried: HashSet::new(),
            failed: HashSet::new(),
            holders: Vec::new(),

            inflight_requests: HashMap::new(),
            rounds: 0,
            done: false,
        };

        query.add_candidates(seeds);

        query
    }

    // === Getters ===

    #[cfg(test)]
    pub fn target(&self) -> Id {
        self.target
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Returns true if no response is awaited in the current round.
    pub fn round_closed(&self) -> bool {
        self.inflight_requests.is_empty()
    }

    #[cfg(test)]
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// The request sent to every peer of each round.
    pub fn request(&self) -> RequestSpecific {
        match self.kind {
            LookupKind::FindNode => RequestSpecific::FindNode(FindNodeRequestArguments {
                target: self.target,
            }),
            LookupKind::FindValue => RequestSpecific::FindValue(FindValueRequestArguments {
                target: self.target,
            }),
        }
    }

    /// The `fanout` closest peers that were queried and didn't fail.
    pub fn closest(&self) -> Vec<Peer> {
        nearest(
            &self.target,
            self.fanout,
            self.discovered
                .values()
                .filter(|peer| self.queried.contains(peer.id()) && !self.failed.contains(peer.id())),
            &self.local_id,
        )
    }

    /// The outcome of this lookup: the holders for [LookupKind::FindValue],
    /// the closest peers for [LookupKind::FindNode].
    pub fn result(&self) -> Vec<Peer> {
        match self.kind {
            LookupKind::FindNode => self.closest(),
            LookupKind::FindValue => self.holders.clone(),
        }
    }

    // === Public Methods ===

    /// Returns true if a response (by magic) is expected by this query.
    pub fn inflight(&self, magic: u32) -> bool {
        self.inflight_requests.contains_key(&magic)
    }

    /// Close the current round and return the peers to contact in the next one.
    ///
    /// Returns an empty list, and marks the query as done, once a holder is
    /// found or the frontier is exhausted. Must only be called when
    /// [Self::round_closed] is true.
    pub fn next_round(&mut self) -> Vec<Peer> {
        if self.done {
            return vec![];
        }

        if self.kind == LookupKind::FindValue && !self.holders.is_empty() {
            self.finish();
            return vec![];
        }

        let frontier: Vec<Peer> = nearest(
            &self.target,
            self.fanout,
            self.discovered.values(),
            &self.local_id,
        )
        .into_iter()
        .filter(|peer| !self.queried.contains(peer.id()))
        .collect();

        if frontier.is_empty() {
            self.finish();
            return vec![];
        }

        self.rounds += 1;
        for peer in &frontier {
            self.queried.insert(*peer.id());
        }

        debug!(target = ?self.target, round = self.rounds, peers = frontier.len(), "Query round");

        frontier
    }

    /// Record a request sent to a peer of the current round.
    pub fn sent(&mut self, magic: u32, to: Peer) {
        self.inflight_requests.insert(magic, to);
    }

    /// Stop awaiting a response, returning the peer it was sent to.
    pub fn take(&mut self, magic: u32) -> Option<Peer> {
        self.inflight_requests.remove(&magic)
    }

    /// Mark a queried peer as failed (timed out, or unreachable).
    pub fn add_failure(&mut self, peer: &Peer) {
        self.failed.insert(*peer.id());
    }

    /// Learn about peers closer to the target.
    pub fn add_candidates<I: IntoIterator<Item = Peer>>(&mut self, peers: I) {
        for peer in peers {
            if peer.id() != &self.local_id {
                self.discovered.insert(*peer.id(), peer);
            }
        }
    }

    /// Record a peer holding the value.
    pub fn add_holder(&mut self, holder: Peer) {
        if holder.id() == &self.local_id || self.holders.contains(&holder) {
            return;
        }

        self.holders.push(holder);
    }

    // === Private Methods ===

    fn finish(&mut self) {
        self.done = true;

        debug!(
            target = ?self.target,
            kind = ?self.kind,
            rounds = self.rounds,
            queried = self.queried.len(),
            failed = self.failed.len(),
            holders = self.holders.len(),
            "Done query"
        );
    }
}
