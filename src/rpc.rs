//! Control channel engine: routing table, request correlation, lookups and health rounds.

pub mod bulk;
pub mod config;
mod health;
mod info;
mod iterative_query;
pub(crate) mod socket;
mod store_query;

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flume::{Receiver, Sender};
use tracing::{debug, info, trace, warn};

use crate::common::{
    ErrorSpecific, FindNodeRequestArguments, FindNodeResponseArguments,
    FindValueRequestArguments, FindValueResponseArguments, Id, Message, MessageType, Peer,
    PingResponseArguments, RequestSpecific, ResponseSpecific, RoutingTable,
    StoreValueRequestArguments, STORE_VALUE,
};
use crate::storage::{Storage, StorageError};

use bulk::{BulkError, BulkServer};
use health::HealthMonitor;
use iterative_query::IterativeQuery;
use socket::{ControlSocket, InflightRequest, Incoming};
use store_query::StoreQuery;

pub use config::{
    Config, ConfigError, DEFAULT_BULK_TIMEOUT, DEFAULT_FANOUT, DEFAULT_PING_INTERVAL,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use info::Info;
pub use iterative_query::LookupKind;

/// How many ephemeral ports to try until one is free for both UDP and TCP.
const MAX_BIND_ATTEMPTS: usize = 16;
/// Inbound `store_value` pulls running at once, other requests are refused.
const MAX_CONCURRENT_PULLS: usize = 32;

#[derive(Debug)]
/// The engine owning every piece of mutable network state of a node.
///
/// Not thread safe; it is meant to be driven by a single thread calling [Rpc::tick]
/// in a loop, see [crate::Dht].
pub struct Rpc {
    socket: ControlSocket,
    /// Kept alive for as long as the engine, serving chunks from `storage`.
    bulk: BulkServer,

    routing_table: RoutingTable,
    storage: Arc<dyn Storage>,
    health: HealthMonitor,

    // Active queries
    queries: HashMap<(LookupKind, Id), IterativeQuery>,
    /// Store queries wait for the find_node query of their id to finish,
    /// then send `store_value` to the closest peers found.
    store_queries: HashMap<Id, StoreQuery>,
    join: JoinState,

    /// Requesters (address and magic) awaiting the pull of a chunk, one pull per id.
    pulls_in_flight: HashMap<Id, Vec<(SocketAddr, u32)>>,
    /// Outcomes of inbound `store_value` requests, pulled off the actor thread.
    pulls: (Sender<PullOutcome>, Receiver<PullOutcome>),

    // Options
    fanout: usize,
    bulk_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinState {
    Idle,
    /// Waiting for a health round over the seeds to finish.
    Probing,
    /// Waiting for the find_node query of our own id.
    Searching,
}

#[derive(Debug, Default)]
/// Everything that finished during one [Rpc::tick].
pub struct RpcTickReport {
    pub done_find_node_queries: Vec<(Id, Vec<Peer>)>,
    pub done_find_value_queries: Vec<(Id, Vec<Peer>)>,
    pub done_store_queries: Vec<(Id, Vec<Peer>)>,
    pub done_health_round: bool,
    /// The closest peers to our own id found while joining, possibly empty
    /// for a standalone node.
    pub joined: Option<Vec<Peer>>,
}

#[derive(Debug)]
struct PullOutcome {
    id: Id,
    result: Result<(), PullError>,
}

impl Rpc {
    /// Bind the control and bulk channels and create the engine.
    pub fn new(config: &Config, storage: Arc<dyn Storage>) -> Result<Self, io::Error> {
        let id = config.id.unwrap_or_else(Id::random);

        let (udp, tcp) = bind(config.ip, config.port)?;
        let port = udp.local_addr()?.port();

        let local = Peer::new(id, SocketAddr::new(config.ip, port));

        let bulk = BulkServer::start(tcp, storage.clone(), config.bulk_timeout)?;
        let socket = ControlSocket::new(udp, local.clone(), config.request_timeout)?;

        let mut routing_table = RoutingTable::new(id, config.bucket_size);
        routing_table.add(config.bootstrap.clone());

        info!(?local, seeds = routing_table.size(), "Listening");

        Ok(Rpc {
            socket,
            bulk,

            routing_table,
            storage,
            health: HealthMonitor::new(config.ping_interval),

            queries: HashMap::new(),
            store_queries: HashMap::new(),
            join: JoinState::Idle,

            pulls_in_flight: HashMap::new(),
            pulls: flume::unbounded(),

            fanout: config.fanout,
            bulk_timeout: config.bulk_timeout,
        })
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &Id {
        self.routing_table.id()
    }

    /// Returns the descriptor this node advertises.
    pub fn local(&self) -> &Peer {
        self.socket.local()
    }

    /// Returns the address both channels are listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.bulk.local_addr()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Advance the inner state machine, and read one message from the control channel.
    pub fn tick(&mut self) -> RpcTickReport {
        let mut report = RpcTickReport::default();

        for request in self.socket.expired() {
            self.on_request_failure(request, "timeout");
        }

        match self.socket.recv_from() {
            Some(Incoming::Request { message, from }) => self.handle_request(from, message),
            Some(Incoming::Response { message, request }) => self.handle_response(message, request),
            None => {}
        }

        while let Ok(outcome) = self.pulls.1.try_recv() {
            self.on_pull_outcome(outcome);
        }

        self.tick_health(&mut report);
        self.tick_queries(&mut report);
        self.tick_store_queries(&mut report);

        report
    }

    /// Start a find_node lookup, unless one for the same target is running.
    pub fn find_node(&mut self, target: Id) {
        self.query(LookupKind::FindNode, target);
    }

    /// Start a find_value lookup, unless one for the same target is running.
    ///
    /// Returns the local node right away if it holds the value.
    pub fn find_value(&mut self, target: Id) -> Option<Vec<Peer>> {
        if self.storage.has(&target.to_hex()) {
            return Some(vec![self.local().clone()]);
        }

        self.query(LookupKind::FindValue, target);

        None
    }

    /// Replicate a chunk, already held in local storage, to the closest peers of its id.
    pub fn store(&mut self, id: Id) {
        self.store_queries
            .entry(id)
            .or_insert_with(|| StoreQuery::new(id));

        self.find_node(id);
    }

    /// Start a health round now, unless one is already running.
    pub fn ping_nodes(&mut self) {
        if !self.health.is_running() {
            self.start_health_round();
        }
    }

    /// Probe the seeds (and any known peer), then look up our own id.
    pub fn join(&mut self) {
        if self.join == JoinState::Idle {
            self.join = JoinState::Probing;
        }

        self.ping_nodes();
    }

    // === Private Methods ===

    fn query(&mut self, kind: LookupKind, target: Id) {
        if self.queries.contains_key(&(kind, target)) {
            return;
        }

        let seeds = self.routing_table.nearest(&target, self.fanout);

        self.queries.insert(
            (kind, target),
            IterativeQuery::new(kind, target, *self.id(), self.fanout, seeds),
        );
    }

    /// Send a request, evicting the peer if it is unreachable.
    fn request(&mut self, to: &Peer, request: RequestSpecific) -> Option<u32> {
        match self.socket.request(to, request) {
            Ok(magic) => Some(magic),
            Err(error) => {
                debug!(?to, ?error, "Evicting unreachable peer");
                self.routing_table.remove(to.id());
                None
            }
        }
    }

    fn handle_request(&mut self, from: SocketAddr, message: Message) {
        let Message {
            magic,
            requester,
            message_type,
        } = message;

        let MessageType::Request(request) = message_type else {
            return;
        };

        // Unsolicited contact is a discovery signal.
        self.routing_table.add_or_update(requester.clone());

        match request {
            RequestSpecific::Ping => {
                let responder = self.local().clone();

                self.socket.response(
                    from,
                    magic,
                    ResponseSpecific::Ping(PingResponseArguments { responder }),
                );
            }
            RequestSpecific::FindNode(FindNodeRequestArguments { target }) => {
                self.socket.response(
                    from,
                    magic,
                    ResponseSpecific::FindNode(FindNodeResponseArguments {
                        nodes: self.routing_table.nearest(&target, self.fanout),
                    }),
                );
            }
            RequestSpecific::FindValue(FindValueRequestArguments { target }) => {
                let result = if self.storage.has(&target.to_hex()) {
                    FindValueResponseArguments::Holder(self.local().clone())
                } else {
                    FindValueResponseArguments::Closer(
                        self.routing_table.nearest(&target, self.fanout),
                    )
                };

                self.socket
                    .response(from, magic, ResponseSpecific::FindValue(result));
            }
            RequestSpecific::StoreValue(StoreValueRequestArguments { id }) => {
                if self.storage.has(&id.to_hex()) {
                    self.socket
                        .response(from, magic, ResponseSpecific::StoreValue);
                } else if let Some(waiting) = self.pulls_in_flight.get_mut(&id) {
                    waiting.push((from, magic));
                } else if self.pulls_in_flight.len() >= MAX_CONCURRENT_PULLS {
                    debug!(?id, ?from, "Too many pulls in flight, refusing store");

                    self.socket.error(
                        from,
                        magic,
                        ErrorSpecific {
                            request_type: STORE_VALUE.to_string(),
                            description: "Too many concurrent stores".to_string(),
                        },
                    );
                } else {
                    self.pulls_in_flight.insert(id, vec![(from, magic)]);
                    self.pull(requester, id);
                }
            }
        }
    }

    fn handle_response(&mut self, message: Message, request: InflightRequest) {
        let magic = message.magic;
        let responder = message.requester;

        let response = match message.message_type {
            MessageType::Response(response) => response,
            MessageType::Error(error) => {
                debug!(?error, to = ?request.to, "Error response");

                // Answered, so not evicted, but contributes nothing.
                if let Some(query) = self.queries.values_mut().find(|q| q.inflight(magic)) {
                    query.take(magic);
                } else if let Some(query) = self.store_queries.values_mut().find(|q| q.inflight(magic)) {
                    query.take(magic);
                } else {
                    self.health.take(magic);
                }

                return;
            }
            MessageType::Request(_) => return,
        };

        if let Some(expected) = self.health.take(magic) {
            self.health.add_alive();

            let returned = match response {
                ResponseSpecific::Ping(PingResponseArguments { responder }) => responder,
                _ => responder,
            };

            if returned.id() != expected.id() {
                debug!(?expected, ?returned, "Peer changed its id");
                self.routing_table.remove(expected.id());
            }

            self.routing_table.add_or_update(returned);

            return;
        }

        self.routing_table.add_or_update(responder.clone());

        if let Some(query) = self.queries.values_mut().find(|q| q.inflight(magic)) {
            query.take(magic);

            match response {
                ResponseSpecific::FindNode(FindNodeResponseArguments { nodes })
                | ResponseSpecific::FindValue(FindValueResponseArguments::Closer(nodes)) => {
                    self.routing_table.add(nodes.clone());
                    query.add_candidates(nodes);
                }
                ResponseSpecific::FindValue(FindValueResponseArguments::Holder(holder)) => {
                    query.add_holder(holder);
                }
                other => {
                    trace!(?other, "Unexpected response type for a lookup");
                }
            }
        } else if let Some(query) = self.store_queries.values_mut().find(|q| q.inflight(magic)) {
            if let Some(peer) = query.take(magic) {
                if matches!(response, ResponseSpecific::StoreValue) {
                    query.add_success(peer);
                }
            }
        }
    }

    /// A request timed out. Evict the peer and treat its contribution as empty.
    fn on_request_failure(&mut self, request: InflightRequest, reason: &'static str) {
        let InflightRequest { magic, to, .. } = request;

        debug!(?to, reason, "Evicting peer");
        self.routing_table.remove(to.id());

        if let Some(query) = self.queries.values_mut().find(|q| q.inflight(magic)) {
            if let Some(peer) = query.take(magic) {
                query.add_failure(&peer);
            }
        } else if let Some(query) = self.store_queries.values_mut().find(|q| q.inflight(magic)) {
            query.take(magic);
        } else if self.health.take(magic).is_some() {
            self.health.add_evicted();
        }
    }

    /// Pull a chunk from the peer that asked us to store it, off the actor thread.
    fn pull(&self, source: Peer, id: Id) {
        let storage = self.storage.clone();
        let sender = self.pulls.0.clone();
        let timeout = self.bulk_timeout;

        thread::spawn(move || {
            let result = pull_chunk(&source, &id, storage.as_ref(), timeout);
            let _ = sender.send(PullOutcome { id, result });
        });
    }

    /// Answer every requester waiting on this pull.
    fn on_pull_outcome(&mut self, outcome: PullOutcome) {
        let PullOutcome { id, result } = outcome;
        let waiting = self.pulls_in_flight.remove(&id).unwrap_or_default();

        match result {
            Ok(()) => {
                debug!(?id, requesters = waiting.len(), "Stored pulled chunk");

                for (from, magic) in waiting {
                    self.socket
                        .response(from, magic, ResponseSpecific::StoreValue);
                }
            }
            Err(error) => {
                warn!(?id, requesters = waiting.len(), ?error, "Failed to pull chunk");

                for (from, magic) in waiting {
                    self.socket.error(
                        from,
                        magic,
                        ErrorSpecific {
                            request_type: STORE_VALUE.to_string(),
                            description: error.to_string(),
                        },
                    );
                }
            }
        }
    }

    fn start_health_round(&mut self) {
        let peers = self.health.start(&self.routing_table);

        trace!(peers = peers.len(), "Start health round");

        for peer in peers {
            match self.request(&peer, RequestSpecific::Ping) {
                Some(magic) => self.health.sent(magic, peer),
                None => self.health.add_evicted(),
            }
        }
    }

    fn tick_health(&mut self, report: &mut RpcTickReport) {
        if self.health.is_due() {
            self.start_health_round();
        }

        if !self.health.round_closed() {
            return;
        }

        self.health.finish();
        report.done_health_round = true;

        if self.join == JoinState::Probing {
            if self.routing_table.is_empty() {
                info!("No reachable seed peers, running as a standalone (genesis) node");

                self.join = JoinState::Idle;
                report.joined = Some(vec![]);
            } else {
                self.join = JoinState::Searching;
                self.find_node(*self.id());
            }
        }
    }

    fn tick_queries(&mut self, report: &mut RpcTickReport) {
        let mut done = vec![];

        for (key, query) in self.queries.iter_mut() {
            if !query.round_closed() {
                continue;
            }

            let frontier = query.next_round();

            if query.is_done() {
                done.push(*key);
                continue;
            }

            let request = query.request();

            for peer in frontier {
                match self.socket.request(&peer, request.clone()) {
                    Ok(magic) => query.sent(magic, peer),
                    Err(error) => {
                        debug!(to = ?peer, ?error, "Evicting unreachable peer");
                        self.routing_table.remove(peer.id());
                        query.add_failure(&peer);
                    }
                }
            }
        }

        for key in done {
            let Some(query) = self.queries.remove(&key) else {
                continue;
            };

            let (kind, target) = key;
            let result = query.result();

            match kind {
                LookupKind::FindValue => {
                    report.done_find_value_queries.push((target, result));
                }
                LookupKind::FindNode => {
                    if let Some(store_query) = self.store_queries.get_mut(&target) {
                        if !store_query.started() {
                            let request = store_query.request();

                            for peer in &result {
                                match self.socket.request(peer, request.clone()) {
                                    Ok(magic) => store_query.sent(magic, peer.clone()),
                                    Err(error) => {
                                        debug!(to = ?peer, ?error, "Evicting unreachable peer");
                                        self.routing_table.remove(peer.id());
                                    }
                                }
                            }

                            store_query.start();
                        }
                    }

                    if self.join == JoinState::Searching && &target == self.routing_table.id() {
                        self.join = JoinState::Idle;

                        info!(closest = result.len(), table_size = self.routing_table.size(), "Joined the network");
                        report.joined = Some(result.clone());
                    }

                    report.done_find_node_queries.push((target, result));
                }
            }
        }
    }

    fn tick_store_queries(&mut self, report: &mut RpcTickReport) {
        let done: Vec<Id> = self
            .store_queries
            .values()
            .filter(|query| query.is_done())
            .map(|query| query.id())
            .collect();

        for id in done {
            if let Some(query) = self.store_queries.remove(&id) {
                report
                    .done_store_queries
                    .push((id, query.stored_at().to_vec()));
            }
        }
    }
}

/// Fetch a chunk over the bulk channel, verify it against its id, and persist it.
fn pull_chunk(
    source: &Peer,
    id: &Id,
    storage: &dyn Storage,
    timeout: Duration,
) -> Result<(), PullError> {
    let data = bulk::fetch(source.address(), id, timeout)?.ok_or(PullError::NotFound)?;

    let actual = Id::hash(&data);
    if &actual != id {
        return Err(PullError::DigestMismatch {
            expected: *id,
            actual,
        });
    }

    storage.set(&id.to_hex(), data)?;

    Ok(())
}

#[derive(thiserror::Error, Debug)]
enum PullError {
    #[error(transparent)]
    Bulk(#[from] BulkError),

    #[error("Requester does not hold the chunk")]
    NotFound,

    #[error("Digest mismatch, expected {expected}, got {actual}")]
    DigestMismatch { expected: Id, actual: Id },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Bind a UDP socket and a TCP listener on the same port.
fn bind(ip: IpAddr, port: Option<u16>) -> Result<(UdpSocket, TcpListener), io::Error> {
    let unspecified = match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };

    if let Some(port) = port {
        let address = SocketAddr::new(unspecified, port);

        return Ok((UdpSocket::bind(address)?, TcpListener::bind(address)?));
    }

    let mut last_error = None;

    for _ in 0..MAX_BIND_ATTEMPTS {
        let udp = UdpSocket::bind(SocketAddr::new(unspecified, 0))?;
        let address = SocketAddr::new(unspecified, udp.local_addr()?.port());

        match TcpListener::bind(address) {
            Ok(tcp) => return Ok((udp, tcp)),
            Err(error) => last_error = Some(error),
        }
    }

    Err(last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no free port")))
}
