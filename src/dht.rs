//! Dht node.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};

use bytes::Bytes;
use flume::Sender;
use tracing::{debug, warn};

use crate::{
    actor::{Actor, ActorMessage},
    common::{Id, Peer},
    rpc::{bulk, Config, Info, Rpc},
    storage::{FileStorage, MemoryStorage, Storage, StorageError},
};

#[derive(Debug, Clone)]
/// A handle to a Dht node, running in its own thread.
///
/// Cloning is cheap, and every clone talks to the same node. The node thread
/// stops once [Dht::shutdown] is called, or every handle is dropped.
pub struct Dht {
    pub(crate) sender: Sender<ActorMessage>,
    storage: Arc<dyn Storage>,
    local: Peer,
    bulk_timeout: Duration,
}

#[derive(Debug, Default, Clone)]
/// A builder for [Dht].
pub struct DhtBuilder {
    config: Config,
    storage: Option<Arc<dyn Storage>>,
}

impl DhtBuilder {
    /// Set this node's [Id], random by default.
    pub fn id(&mut self, id: Id) -> &mut Self {
        self.config.id = Some(id);

        self
    }

    /// Set the address advertised to other peers.
    pub fn ip(&mut self, ip: IpAddr) -> &mut Self {
        self.config.ip = ip;

        self
    }

    /// Set an explicit port to listen on.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.config.port = Some(port);

        self
    }

    /// Set the seed peers to join the network through.
    pub fn bootstrap(&mut self, bootstrap: &[Peer]) -> &mut Self {
        self.config.bootstrap = bootstrap.to_vec();

        self
    }

    /// Persist chunks as files in this directory, instead of in memory.
    ///
    /// Ignored if a [Self::storage] is set.
    pub fn file_dir<P: Into<PathBuf>>(&mut self, file_dir: P) -> &mut Self {
        self.config.file_dir = Some(file_dir.into());

        self
    }

    /// Set the control channel request timeout, also the deadline of lookup rounds.
    pub fn request_timeout(&mut self, request_timeout: Duration) -> &mut Self {
        self.config.request_timeout = request_timeout;

        self
    }

    /// Set the interval between two health rounds.
    pub fn ping_interval(&mut self, ping_interval: Duration) -> &mut Self {
        self.config.ping_interval = ping_interval;

        self
    }

    /// Set the connect and read timeout of bulk transfers.
    pub fn bulk_timeout(&mut self, bulk_timeout: Duration) -> &mut Self {
        self.config.bulk_timeout = bulk_timeout;

        self
    }

    /// Set the number of peers contacted per lookup round.
    pub fn fanout(&mut self, fanout: usize) -> &mut Self {
        self.config.fanout = fanout;

        self
    }

    /// Set the capacity of the routing table.
    pub fn bucket_size(&mut self, bucket_size: usize) -> &mut Self {
        self.config.bucket_size = bucket_size;

        self
    }

    /// Use a custom [Storage].
    pub fn storage(&mut self, storage: Arc<dyn Storage>) -> &mut Self {
        self.storage = Some(storage);

        self
    }

    /// Create a Dht node.
    pub fn build(&self) -> Result<Dht, std::io::Error> {
        let storage = match (&self.storage, &self.config.file_dir) {
            (Some(storage), _) => storage.clone(),
            (None, Some(file_dir)) => Arc::new(FileStorage::open(file_dir)?),
            (None, None) => Arc::new(MemoryStorage::new()),
        };

        Dht::new(self.config.clone(), storage)
    }
}

impl From<Config> for DhtBuilder {
    fn from(config: Config) -> Self {
        Self {
            config,
            storage: None,
        }
    }
}

impl Dht {
    /// Create a new Dht node, binding its sockets and spawning its thread.
    pub fn new(config: Config, storage: Arc<dyn Storage>) -> Result<Self, std::io::Error> {
        let (sender, receiver) = flume::unbounded();

        let rpc = Rpc::new(&config, storage.clone())?;
        let local = rpc.local().clone();

        thread::Builder::new()
            .name("chunkdht".to_string())
            .spawn(move || Actor::new(rpc, receiver).run())?;

        Ok(Dht {
            sender,
            storage,
            local,
            bulk_timeout: config.bulk_timeout,
        })
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    /// The descriptor this node advertises to other peers.
    pub fn local(&self) -> &Peer {
        &self.local
    }

    /// The storage holding this node's chunks.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.sender
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// A snapshot of the routing table.
    pub fn routing_table(&self) -> Result<Vec<Peer>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<Peer>>(1);

        self.sender
            .send(ActorMessage::RoutingTable(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop, and wait for its sockets to be closed.
    pub fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.sender.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv();
    }

    /// Enter the network: ping the seed peers, then look up our own id.
    ///
    /// Returns the closest peers to this node, empty if it runs standalone.
    pub fn join(&self) -> Result<Vec<Peer>, DhtWasShutdown> {
        self.request(ActorMessage::Join)
    }

    /// Ping every peer in the routing table once, evicting the ones that fail
    /// to respond, and wait for that round to finish.
    pub fn ping_nodes(&self) -> Result<(), DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<()>(1);

        self.sender
            .send(ActorMessage::PingNodes(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Find nodes ===

    /// Iteratively look up the closest responding peers to `target`.
    ///
    /// Never includes this node.
    pub fn find_node(&self, target: Id) -> Result<Vec<Peer>, DhtWasShutdown> {
        self.request(|sender| ActorMessage::FindNode(target, sender))
    }

    /// Iteratively look up peers holding the value of `id`.
    ///
    /// Returns this node alone, without any network traffic, if it holds the value.
    pub fn find_value(&self, id: Id) -> Result<Vec<Peer>, DhtWasShutdown> {
        self.request(|sender| ActorMessage::FindValue(id, sender))
    }

    // === Chunks ===

    /// Store a chunk locally, then replicate it to the closest peers of its id.
    ///
    /// `id` must be the SHA-256 digest of `data`. Returns the peers that
    /// acknowledged storing it; partial (or no) replication is not an error.
    pub fn store_value(&self, id: Id, data: Bytes) -> Result<Vec<Peer>, DhtError> {
        self.store_locally(id, data)?;

        Ok(self.request(|sender| ActorMessage::Store(id, sender))?)
    }

    /// Get a chunk by its id: from local storage, from `peer` if given, or
    /// from the holders found by [Self::find_value].
    ///
    /// Every fetched payload is verified against `id`, and persisted locally.
    pub fn get_value(&self, id: Id, peer: Option<&Peer>) -> Result<Bytes, DhtError> {
        let key = id.to_hex();

        if let Some(data) = self.storage.get(&key) {
            return Ok(data);
        }

        let candidates = match peer {
            Some(peer) => vec![peer.clone()],
            None => self.find_value(id)?,
        };

        for holder in candidates {
            let data = match bulk::fetch(holder.address(), &id, self.bulk_timeout) {
                Ok(Some(data)) => data,
                Ok(None) => {
                    debug!(?id, ?holder, "Holder does not have the chunk");
                    continue;
                }
                Err(error) => {
                    debug!(?id, ?holder, ?error, "Failed to fetch chunk");
                    continue;
                }
            };

            let actual = Id::hash(&data);

            if actual != id {
                warn!(?id, ?actual, ?holder, "Discarding chunk with mismatched digest");
                continue;
            }

            self.storage.set(&key, data.clone())?;

            return Ok(data);
        }

        Err(DhtError::NotFound(id))
    }

    // === Private Methods ===

    /// Verify that `id` is the digest of `data`, then persist it in local storage.
    pub(crate) fn store_locally(&self, id: Id, data: Bytes) -> Result<(), DhtError> {
        let actual = Id::hash(&data);

        if actual != id {
            return Err(DhtError::DigestMismatch {
                expected: id,
                actual,
            });
        }

        self.storage.set(&id.to_hex(), data)?;

        Ok(())
    }

    fn request<F>(&self, message: F) -> Result<Vec<Peer>, DhtWasShutdown>
    where
        F: FnOnce(Sender<Vec<Peer>>) -> ActorMessage,
    {
        let (sender, receiver) = flume::bounded::<Vec<Peer>>(1);

        self.sender
            .send(message(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("The Dht was shutdown")]
/// The Dht node's thread stopped, so it can't answer anymore.
pub struct DhtWasShutdown;

#[derive(thiserror::Error, Debug)]
/// Errors storing or retrieving chunks.
pub enum DhtError {
    #[error(transparent)]
    Shutdown(#[from] DhtWasShutdown),

    /// No holder of the chunk could provide a payload matching its id.
    #[error("Chunk not found: {0}")]
    NotFound(Id),

    /// The id of a chunk must be the SHA-256 digest of its bytes.
    #[error("Digest mismatch, expected {expected}, got {actual}")]
    DigestMismatch { expected: Id, actual: Id },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Create a testnet of Dht nodes on the loopback interface.
#[derive(Debug)]
pub struct Testnet {
    /// A seed peer for nodes joining this testnet.
    pub bootstrap: Vec<Peer>,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    /// Create `count` nodes, each seeded with the previous one, and join them in order.
    pub fn new(count: usize) -> Result<Testnet, std::io::Error> {
        Self::with_builder(count, Dht::builder())
    }

    /// Same as [Testnet::new], with every node built from a copy of `builder`.
    pub fn with_builder(count: usize, builder: DhtBuilder) -> Result<Testnet, std::io::Error> {
        let mut nodes: Vec<Dht> = Vec::with_capacity(count);

        for _ in 0..count {
            let mut builder = builder.clone();
            builder.storage(Arc::new(MemoryStorage::new()));

            if let Some(previous) = nodes.last() {
                builder.bootstrap(&[previous.local().clone()]);
            }

            let node = builder.build()?;

            node.join()
                .map_err(|error| std::io::Error::new(std::io::ErrorKind::Other, error))?;

            nodes.push(node);
        }

        let bootstrap = nodes
            .first()
            .map(|node| vec![node.local().clone()])
            .unwrap_or_default();

        Ok(Self { bootstrap, nodes })
    }

    /// Return the bootstrap peer as a list of [SocketAddr], useful for logging.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.bootstrap.iter().map(|peer| peer.address()).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shutdown() {
        let mut dht = Dht::builder().build().unwrap();

        let clone = dht.clone();

        dht.shutdown();

        assert_eq!(clone.find_node(Id::random()), Err(DhtWasShutdown));
        assert!(matches!(clone.info(), Err(DhtWasShutdown)));
    }

    #[test]
    fn store_get_without_peers() {
        let dht = Dht::builder().build().unwrap();
        assert!(dht.join().unwrap().is_empty());

        let data = Bytes::from_static(b"Hello World!");
        let id = Id::hash(&data);

        let stored_at = dht.store_value(id, data.clone()).unwrap();
        assert!(stored_at.is_empty(), "local-only persistence");

        assert_eq!(dht.get_value(id, None).unwrap(), data);
    }

    #[test]
    fn store_rejects_wrong_id() {
        let dht = Dht::builder().build().unwrap();

        let result = dht.store_value(Id::random(), Bytes::from_static(b"data"));

        assert!(matches!(result, Err(DhtError::DigestMismatch { .. })));
        assert!(dht.storage().keys().is_empty());
    }

    #[test]
    fn get_missing_without_peers() {
        let dht = Dht::builder().build().unwrap();
        let id = Id::random();

        assert!(matches!(dht.get_value(id, None), Err(DhtError::NotFound(missing)) if missing == id));
    }

    #[test]
    fn find_value_held_locally() {
        let dht = Dht::builder().build().unwrap();

        let data = Bytes::from_static(&[0xdf]);
        let id = Id::hash(&data);
        dht.store_value(id, data).unwrap();

        assert_eq!(dht.find_value(id).unwrap(), vec![dht.local().clone()]);
    }

    #[test]
    fn testnet() {
        let testnet = Testnet::new(5).unwrap();

        assert_eq!(testnet.nodes.len(), 5);
        assert_eq!(testnet.bootstrap, vec![testnet.nodes[0].local().clone()]);

        for node in &testnet.nodes {
            assert!(!node.routing_table().unwrap().is_empty());
        }
    }

    #[test]
    fn file_dir_storage() {
        let dir = tempfile::tempdir().unwrap();

        let dht = Dht::builder().file_dir(dir.path()).build().unwrap();

        let data = Bytes::from_static(b"on disk");
        let id = Id::hash(&data);
        dht.store_value(id, data.clone()).unwrap();

        assert_eq!(
            std::fs::read(dir.path().join(id.to_hex())).unwrap(),
            data.to_vec()
        );
    }
}
