//! AsyncDht node.

use std::thread;

use bytes::Bytes;
use flume::Sender;

use crate::{
    actor::ActorMessage,
    common::{Id, Peer},
    dht::{Dht, DhtError, DhtWasShutdown},
    rpc::Info,
};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// The descriptor this node advertises to other peers.
    pub fn local(&self) -> &Peer {
        self.0.local()
    }

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0
            .sender
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    /// A snapshot of the routing table.
    pub async fn routing_table(&self) -> Result<Vec<Peer>, DhtWasShutdown> {
        self.request(ActorMessage::RoutingTable).await
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub async fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.sender.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv_async().await;
    }

    /// Async version of [Dht::join].
    pub async fn join(&self) -> Result<Vec<Peer>, DhtWasShutdown> {
        self.request(ActorMessage::Join).await
    }

    /// Async version of [Dht::ping_nodes].
    pub async fn ping_nodes(&self) -> Result<(), DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<()>(1);

        self.0
            .sender
            .send(ActorMessage::PingNodes(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }

    // === Find nodes ===

    /// Async version of [Dht::find_node].
    pub async fn find_node(&self, target: Id) -> Result<Vec<Peer>, DhtWasShutdown> {
        self.request(|sender| ActorMessage::FindNode(target, sender))
            .await
    }

    /// Async version of [Dht::find_value].
    pub async fn find_value(&self, id: Id) -> Result<Vec<Peer>, DhtWasShutdown> {
        self.request(|sender| ActorMessage::FindValue(id, sender))
            .await
    }

    // === Chunks ===

    /// Async version of [Dht::store_value].
    pub async fn store_value(&self, id: Id, data: Bytes) -> Result<Vec<Peer>, DhtError> {
        self.0.store_locally(id, data)?;

        Ok(self
            .request(|sender| ActorMessage::Store(id, sender))
            .await?)
    }

    /// Async version of [Dht::get_value].
    ///
    /// Bulk transfers are blocking, so they run on a separate thread.
    pub async fn get_value(&self, id: Id, peer: Option<Peer>) -> Result<Bytes, DhtError> {
        let (sender, receiver) = flume::bounded(1);
        let dht = self.0.clone();

        thread::spawn(move || {
            let _ = sender.send(dht.get_value(id, peer.as_ref()));
        });

        receiver
            .recv_async()
            .await
            .map_err(|_| DhtError::Shutdown(DhtWasShutdown))?
    }

    // === Private Methods ===

    async fn request<F>(&self, message: F) -> Result<Vec<Peer>, DhtWasShutdown>
    where
        F: FnOnce(Sender<Vec<Peer>>) -> ActorMessage,
    {
        let (sender, receiver) = flume::bounded::<Vec<Peer>>(1);

        self.0
            .sender
            .send(message(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| DhtWasShutdown)
    }
}

#[cfg(test)]
mod test {
    use crate::dht::Testnet;

    use super::*;

    #[test]
    fn shutdown() {
        async fn test() {
            let mut dht = Dht::builder().build().unwrap().as_async();

            let a = dht.clone();

            dht.shutdown().await;

            let result = a.find_value(Id::random()).await;

            assert!(matches!(result, Err(DhtWasShutdown)))
        }
        futures::executor::block_on(test());
    }

    #[test]
    fn store_get_across_nodes() {
        async fn test() {
            let testnet = Testnet::new(3).unwrap();

            let a = Dht::builder()
                .bootstrap(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();
            a.join().await.unwrap();

            let b = Dht::builder()
                .bootstrap(&testnet.bootstrap)
                .build()
                .unwrap()
                .as_async();
            b.join().await.unwrap();

            let data = Bytes::from_static(b"Hello World!");
            let id = Id::hash(&data);

            let stored_at = a.store_value(id, data.clone()).await.unwrap();
            assert!(!stored_at.is_empty());

            assert_eq!(b.get_value(id, None).await.unwrap(), data);
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn store_rejects_wrong_id() {
        async fn test() {
            let dht = Dht::builder().build().unwrap().as_async();

            let result = dht.store_value(Id::random(), Bytes::from_static(b"data")).await;

            assert!(matches!(result, Err(DhtError::DigestMismatch { .. })));
            assert!(dht.0.storage().keys().is_empty());
        }

        futures::executor::block_on(test());
    }
}
