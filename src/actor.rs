//! The thread owning the [Rpc] engine, serving requests from [crate::Dht] handles.

use std::collections::HashMap;

use flume::{Receiver, RecvError, Sender, TryRecvError};
use tracing::debug;

use crate::common::{Id, Peer};
use crate::rpc::{Info, Rpc};

#[derive(Debug)]
pub(crate) struct Actor {
    rpc: Rpc,
    receiver: Receiver<ActorMessage>,

    // Callers waiting on queries, by target. Concurrent callers share a query.
    find_node_senders: HashMap<Id, Vec<Sender<Vec<Peer>>>>,
    find_value_senders: HashMap<Id, Vec<Sender<Vec<Peer>>>>,
    store_senders: HashMap<Id, Vec<Sender<Vec<Peer>>>>,
    ping_senders: Vec<Sender<()>>,
    join_senders: Vec<Sender<Vec<Peer>>>,
}

impl Actor {
    pub fn new(rpc: Rpc, receiver: Receiver<ActorMessage>) -> Self {
        Self {
            rpc,
            receiver,

            find_node_senders: HashMap::new(),
            find_value_senders: HashMap::new(),
            store_senders: HashMap::new(),
            ping_senders: Vec::new(),
            join_senders: Vec::new(),
        }
    }

    /// Tick until every handle is dropped or a shutdown is requested.
    pub fn run(mut self) {
        let shutdown = loop {
            match self.tick() {
                Ok(None) => {}
                Ok(Some(sender)) => break Some(sender),
                Err(RecvError::Disconnected) => break None,
            }
        };

        // Release the sockets before acknowledging the shutdown.
        drop(self);

        if let Some(sender) = shutdown {
            let _ = sender.send(());
        }
    }

    /// Handle at most one message, then tick the engine.
    ///
    /// Returns the shutdown acknowledgement sender if a shutdown was requested,
    /// and an error if all handles were dropped.
    fn tick(&mut self) -> Result<Option<Sender<()>>, RecvError> {
        match self.receiver.try_recv() {
            Ok(actor_message) => match actor_message {
                ActorMessage::Shutdown(sender) => {
                    debug!("Shutting down the actor thread");
                    return Ok(Some(sender));
                }
                ActorMessage::Info(sender) => {
                    let _ = sender.send(self.rpc.info());
                }
                ActorMessage::RoutingTable(sender) => {
                    let _ = sender.send(self.rpc.routing_table().to_owned_peers());
                }
                ActorMessage::FindNode(target, sender) => {
                    self.rpc.find_node(target);

                    self.find_node_senders.entry(target).or_default().push(sender);
                }
                ActorMessage::FindValue(target, sender) => match self.rpc.find_value(target) {
                    Some(holders) => {
                        let _ = sender.send(holders);
                    }
                    None => {
                        self.find_value_senders.entry(target).or_default().push(sender);
                    }
                },
                ActorMessage::Store(id, sender) => {
                    self.rpc.store(id);

                    self.store_senders.entry(id).or_default().push(sender);
                }
                ActorMessage::PingNodes(sender) => {
                    self.rpc.ping_nodes();

                    self.ping_senders.push(sender);
                }
                ActorMessage::Join(sender) => {
                    self.rpc.join();

                    self.join_senders.push(sender);
                }
            },
            Err(TryRecvError::Disconnected) => {
                // Node was dropped, kill this thread.
                debug!("chunkdht::Dht's actor thread was shutdown after Drop.");
                return Err(RecvError::Disconnected);
            }
            Err(TryRecvError::Empty) => {
                // No op
            }
        }

        let report = self.rpc.tick();

        for (id, closest) in report.done_find_node_queries {
            respond(self.find_node_senders.remove(&id), closest);
        }

        for (id, holders) in report.done_find_value_queries {
            respond(self.find_value_senders.remove(&id), holders);
        }

        for (id, stored_at) in report.done_store_queries {
            respond(self.store_senders.remove(&id), stored_at);
        }

        if report.done_health_round {
            for sender in self.ping_senders.drain(..) {
                let _ = sender.send(());
            }
        }

        if let Some(closest) = report.joined {
            for sender in self.join_senders.drain(..) {
                let _ = sender.send(closest.clone());
            }
        }

        Ok(None)
    }
}

fn respond(senders: Option<Vec<Sender<Vec<Peer>>>>, peers: Vec<Peer>) {
    for sender in senders.unwrap_or_default() {
        let _ = sender.send(peers.clone());
    }
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Info(Sender<Info>),
    RoutingTable(Sender<Vec<Peer>>),
    FindNode(Id, Sender<Vec<Peer>>),
    FindValue(Id, Sender<Vec<Peer>>),
    /// Replicate a chunk already held in local storage.
    Store(Id, Sender<Vec<Peer>>),
    PingNodes(Sender<()>),
    Join(Sender<Vec<Peer>>),
    Shutdown(Sender<()>),
}
