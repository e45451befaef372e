use std::net::SocketAddr;

use crate::common::{Id, Peer};

use super::Rpc;

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    local: Peer,
    local_addr: SocketAddr,
    routing_table_size: usize,
    stored_chunks: usize,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        self.local.id()
    }
    /// The descriptor this node advertises to other peers.
    pub fn local(&self) -> &Peer {
        &self.local
    }
    /// Local socket address that both the control (UDP) and bulk (TCP)
    /// channels are listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
    /// Number of peers in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }
    /// Number of chunks held in local storage.
    pub fn stored_chunks(&self) -> usize {
        self.stored_chunks
    }
}

impl From<&Rpc> for Info {
    fn from(rpc: &Rpc) -> Self {
        Self {
            local: rpc.local().clone(),
            local_addr: rpc.local_addr(),
            routing_table_size: rpc.routing_table().size(),
            stored_chunks: rpc.storage().keys().len(),
        }
    }
}
