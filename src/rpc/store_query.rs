//! Replicate a stored chunk to the closest peers of its id.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::common::{Id, Peer, RequestSpecific, StoreValueRequestArguments};

#[derive(Debug)]
/// Once the closest peers of `id` are found, send each of them a `store_value`
/// request, making them pull the chunk over the bulk channel.
///
/// Best effort: the query is done once every request was acknowledged or failed.
pub(crate) struct StoreQuery {
    id: Id,
    /// Requests by magic.
    inflight_requests: HashMap<u32, Peer>,
    stored_at: Vec<Peer>,
    started: bool,
}

impl StoreQuery {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            inflight_requests: HashMap::new(),
            stored_at: Vec::new(),
            started: false,
        }
    }

    // === Getters ===

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn request(&self) -> RequestSpecific {
        RequestSpecific::StoreValue(StoreValueRequestArguments { id: self.id })
    }

    /// Peers that acknowledged storing the chunk.
    pub fn stored_at(&self) -> &[Peer] {
        &self.stored_at
    }

    pub fn is_done(&self) -> bool {
        self.started && self.inflight_requests.is_empty()
    }

    // === Public Methods ===

    /// Mark the query as started, after sending requests to the closest peers.
    pub fn start(&mut self) {
        trace!(id = ?self.id, requests = self.inflight_requests.len(), "Start store query");

        self.started = true;
    }

    pub fn sent(&mut self, magic: u32, to: Peer) {
        self.inflight_requests.insert(magic, to);
    }

    pub fn inflight(&self, magic: u32) -> bool {
        self.inflight_requests.contains_key(&magic)
    }

    /// Stop awaiting a response, returning the peer it was sent to.
    pub fn take(&mut self, magic: u32) -> Option<Peer> {
        self.inflight_requests.remove(&magic)
    }

    pub fn add_success(&mut self, peer: Peer) {
        debug!(id = ?self.id, ?peer, "Chunk stored");

        self.stored_at.push(peer);
    }
}
