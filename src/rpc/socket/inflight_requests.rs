use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::common::Peer;

#[derive(Debug, Clone)]
/// A request waiting for its response.
pub struct InflightRequest {
    pub magic: u32,
    pub to: Peer,
    pub sent_at: Instant,
}

impl InflightRequest {
    /// Returns true if a response from `from` can answer this request.
    ///
    /// Ignores the ip if it is unspecified.
    pub fn does_match(&self, from: &SocketAddr) -> bool {
        let to = self.to.address();

        if to.port() != from.port() {
            return false;
        }

        if to.ip().is_unspecified() {
            return true;
        }

        to.ip() == from.ip()
    }
}

#[derive(Debug, Default)]
/// Pending requests keyed by their magic (nonce).
pub struct InflightRequests {
    requests: HashMap<u32, InflightRequest>,
}

impl InflightRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, magic: u32, to: Peer) {
        self.requests.insert(
            magic,
            InflightRequest {
                magic,
                to,
                sent_at: Instant::now(),
            },
        );
    }

    pub fn contains(&self, magic: u32) -> bool {
        self.requests.contains_key(&magic)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Remove an inflight request if it exists and matches the responding address.
    pub fn remove(&mut self, magic: u32, from: &SocketAddr) -> Option<InflightRequest> {
        if !self.requests.get(&magic)?.does_match(from) {
            return None;
        }

        self.requests.remove(&magic)
    }

    /// Remove and return every request older than `timeout`.
    pub fn cleanup(&mut self, timeout: Duration) -> Vec<InflightRequest> {
        let expired: Vec<u32> = self
            .requests
            .values()
            .filter(|request| request.sent_at.elapsed() >= timeout)
            .map(|request| request.magic)
            .collect();

        expired
            .into_iter()
            .filter_map(|magic| self.requests.remove(&magic))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use crate::common::Id;

    use super::*;

    fn peer(port: u16) -> Peer {
        Peer::new(Id::random(), SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn remove_once() {
        let mut requests = InflightRequests::new();
        let to = peer(4000);

        requests.add(7, to.clone());
        assert!(requests.contains(7));

        assert!(requests.remove(7, &to.address()).is_some());
        assert!(
            requests.remove(7, &to.address()).is_none(),
            "second response is a duplicate"
        );
        assert!(requests.is_empty());
    }

    #[test]
    fn ignore_wrong_address() {
        let mut requests = InflightRequests::new();
        let to = peer(4000);

        requests.add(7, to);

        assert!(requests
            .remove(7, &SocketAddr::from(([127, 0, 0, 1], 4001)))
            .is_none());
        assert!(requests
            .remove(7, &SocketAddr::from(([10, 0, 0, 1], 4000)))
            .is_none());
        assert!(requests.contains(7));
    }

    #[test]
    fn cleanup_returns_expired() {
        let mut requests = InflightRequests::new();

        requests.add(1, peer(4000));
        requests.add(2, peer(4001));

        assert!(requests.cleanup(Duration::from_secs(60)).is_empty());
        assert_eq!(requests.len(), 2);

        let mut expired: Vec<u32> = requests
            .cleanup(Duration::ZERO)
            .into_iter()
            .map(|r| r.magic)
            .collect();
        expired.sort();

        assert_eq!(expired, vec![1, 2]);
        assert!(requests.is_empty());
    }
}
