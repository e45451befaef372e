//! Periodic liveness probing of the routing table.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::common::{Peer, RoutingTable};

/// Schedules health rounds, and tracks the pings of the current one.
#[derive(Debug)]
pub(crate) struct HealthMonitor {
    interval: Duration,
    last_round: Instant,
    /// Pings of the running round, by magic.
    round: Option<HashMap<u32, Peer>>,
    alive: usize,
    evicted: usize,
}

impl HealthMonitor {
    pub fn new(interval: Duration) -> Self {
        HealthMonitor {
            interval,
            last_round: Instant::now(),
            round: None,
            alive: 0,
            evicted: 0,
        }
    }

    // === Getters ===

    pub fn is_running(&self) -> bool {
        self.round.is_some()
    }

    /// Returns true if a round is running and all its pings are answered or failed.
    pub fn round_closed(&self) -> bool {
        self.round.as_ref().is_some_and(HashMap::is_empty)
    }

    #[cfg(test)]
    pub fn inflight(&self, magic: u32) -> bool {
        self.round
            .as_ref()
            .is_some_and(|round| round.contains_key(&magic))
    }

    // === Public Methods ===

    /// Returns true if a new round should start now.
    pub fn is_due(&self) -> bool {
        self.is_due_at(Instant::now())
    }

    /// Start a new round, returning the peers to ping: every peer currently
    /// in the routing table.
    pub fn start(&mut self, routing_table: &RoutingTable) -> Vec<Peer> {
        self.start_at(Instant::now(), routing_table)
    }

    pub fn sent(&mut self, magic: u32, to: Peer) {
        if let Some(round) = self.round.as_mut() {
            round.insert(magic, to);
        }
    }

    /// Stop awaiting a ping, returning the peer it was sent to.
    pub fn take(&mut self, magic: u32) -> Option<Peer> {
        self.round.as_mut()?.remove(&magic)
    }

    pub fn add_alive(&mut self) {
        self.alive += 1;
    }

    pub fn add_evicted(&mut self) {
        self.evicted += 1;
    }

    /// End the running round.
    pub fn finish(&mut self) {
        if self.round.take().is_some() {
            debug!(alive = self.alive, evicted = self.evicted, "Health round done");
        }
    }

    // === Private Methods ===

    fn is_due_at(&self, now: Instant) -> bool {
        self.round.is_none() && now.duration_since(self.last_round) >= self.interval
    }

    fn start_at(&mut self, now: Instant, routing_table: &RoutingTable) -> Vec<Peer> {
        self.last_round = now;
        self.round = Some(HashMap::new());
        self.alive = 0;
        self.evicted = 0;

        routing_table.to_owned_peers()
    }
}

#[cfg(test)]
mod test {
    use crate::common::{Id, DEFAULT_BUCKET_SIZE};

    use super::*;

    #[test]
    fn due_after_interval() {
        let interval = Duration::from_secs(10);
        let mut monitor = HealthMonitor::new(interval);
        let table = RoutingTable::new(Id::random(), DEFAULT_BUCKET_SIZE);

        // We add to Instant::now() instead of subtracting, because on Windows
        // Instant can be close to its internal epoch and subtraction overflows.
        let now = Instant::now();
        assert!(!monitor.is_due_at(now));

        let later = now + interval + Duration::from_secs(1);
        assert!(monitor.is_due_at(later));

        monitor.start_at(later, &table);
        assert!(!monitor.is_due_at(later + interval), "round still running");

        monitor.finish();
        assert!(!monitor.is_due_at(later));
        assert!(monitor.is_due_at(later + interval));
    }

    #[test]
    fn round_pings_every_peer() {
        let mut monitor = HealthMonitor::new(Duration::from_secs(10));
        let mut table = RoutingTable::new(Id::random(), DEFAULT_BUCKET_SIZE);
        table.add((0..5).map(|_| Peer::random()));

        let peers = monitor.start(&table);
        assert_eq!(peers.len(), 5);

        for (magic, peer) in peers.into_iter().enumerate() {
            monitor.sent(magic as u32, peer);
        }

        assert!(monitor.inflight(3));
        assert!(!monitor.round_closed());

        for magic in 0..5 {
            assert!(monitor.take(magic).is_some());
        }

        assert!(monitor.round_closed());
        monitor.finish();
        assert!(!monitor.is_running());
    }

    #[test]
    fn empty_round_closes_immediately() {
        let mut monitor = HealthMonitor::new(Duration::from_secs(10));
        let table = RoutingTable::new(Id::random(), DEFAULT_BUCKET_SIZE);

        assert!(monitor.start(&table).is_empty());
        assert!(monitor.round_closed());
    }
}
