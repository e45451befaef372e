//! Struct and implementation of the Peer entry in the routing table
use std::{
    fmt::{self, Debug, Formatter},
    hash::{Hash, Hasher},
    net::{IpAddr, SocketAddr},
};

use serde::{Deserialize, Serialize};

use crate::common::Id;

#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "PeerRecord", into = "PeerRecord")]
/// A known participant of the network: its [Id] and the address it listens on,
/// for both the control and the bulk channel.
///
/// Equality and hashing only consider the [Id]; two records with the same id
/// and different addresses are the same logical peer.
pub struct Peer {
    id: Id,
    address: SocketAddr,
}

impl Peer {
    /// Creates a new Peer from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Peer {
        Peer { id, address }
    }

    /// Creates a peer with random Id for testing purposes.
    #[cfg(test)]
    pub fn random() -> Peer {
        Peer {
            id: Id::random(),
            address: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }

    #[cfg(test)]
    pub fn with_id(mut self, id: Id) -> Self {
        self.id = id;
        self
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn ip(&self) -> IpAddr {
        self.address.ip()
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl Debug for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &format_args!("{}", self.id))
            .field("address", &format_args!("{}", self.address))
            .finish()
    }
}

/// The `{node_id, ip, port}` shape a peer takes on the wire and in configuration files.
#[derive(Serialize, Deserialize)]
struct PeerRecord {
    node_id: Id,
    ip: IpAddr,
    port: u16,
}

impl From<PeerRecord> for Peer {
    fn from(record: PeerRecord) -> Self {
        Peer::new(record.node_id, SocketAddr::new(record.ip, record.port))
    }
}

impl From<Peer> for PeerRecord {
    fn from(peer: Peer) -> Self {
        PeerRecord {
            node_id: peer.id,
            ip: peer.address.ip(),
            port: peer.address.port(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn equality_by_id_only() {
        let a = Peer::random();
        let b = Peer::new(*a.id(), SocketAddr::from(([10, 0, 0, 1], 9000)));

        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);

        assert_eq!(set.len(), 1);
    }

    #[test]
    fn serde_shape() {
        let id = Id::random();
        let peer = Peer::new(id, SocketAddr::from(([127, 0, 0, 1], 5000)));

        let value = serde_json::to_value(&peer).unwrap();

        assert_eq!(
            value,
            serde_json::json!({"node_id": id.to_string(), "ip": "127.0.0.1", "port": 5000})
        );

        let back: Peer = serde_json::from_value(value).unwrap();
        assert_eq!(back.address(), peer.address());
    }

    #[test]
    fn reject_malformed_record() {
        let value = serde_json::json!({"node_id": "abc", "ip": "127.0.0.1", "port": 5000});
        assert!(serde_json::from_value::<Peer>(value).is_err());

        let value = serde_json::json!({"node_id": Id::random().to_string(), "ip": "nope", "port": 1});
        assert!(serde_json::from_value::<Peer>(value).is_err());
    }
}
