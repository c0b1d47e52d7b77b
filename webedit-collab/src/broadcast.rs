//! Fan-out of server messages to every live connection.
//!
//! Each connection owns a bounded outbox drained by its own task. A
//! broadcast serializes the message once and does one non-blocking
//! `try_send` per recipient. A peer whose outbox is full can no longer be
//! kept in sync, so it is evicted: its sender is dropped, which ends the
//! connection, and its id is queued for the hub to purge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Utf8Bytes;

use crate::protocol::{ProtocolError, ServerMessage};
use crate::registry::UserId;

/// Sending half of a connection's outbound queue.
pub type Outbox = mpsc::Sender<Utf8Bytes>;
/// Receiving half, owned by the connection task.
pub type OutboxReceiver = mpsc::Receiver<Utf8Bytes>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub peers_evicted: u64,
    pub active_peers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    peers_evicted: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            peers_evicted: AtomicU64::new(0),
        }
    }
}

enum Delivery {
    Sent,
    Full,
    Closed,
}

/// The set of live connections a broadcast reaches.
pub struct BroadcastGroup {
    peers: HashMap<UserId, Outbox>,
    /// Frames buffered per peer before it is evicted
    capacity: usize,
    /// Peers evicted since the last `take_evicted`
    evicted: Vec<UserId>,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: HashMap::new(),
            capacity: capacity.max(1),
            evicted: Vec::new(),
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Add a peer and hand back the receiver its connection task drains.
    pub fn add_peer(&mut self, user_id: UserId) -> OutboxReceiver {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.peers.insert(user_id, tx);
        rx
    }

    /// Remove a peer. Dropping its outbox ends the connection's send loop.
    pub fn remove_peer(&mut self, user_id: &UserId) -> bool {
        self.peers.remove(user_id).is_some()
    }

    /// Serialize once and deliver to every peer except `exclude`.
    ///
    /// Returns how many peers accepted the frame.
    pub fn broadcast(
        &mut self,
        msg: &ServerMessage,
        exclude: Option<&UserId>,
    ) -> Result<usize, ProtocolError> {
        let frame = Utf8Bytes::from(msg.encode()?);
        Ok(self.broadcast_raw(frame, exclude))
    }

    /// Deliver a pre-encoded frame to every peer except `exclude`.
    pub fn broadcast_raw(&mut self, frame: Utf8Bytes, exclude: Option<&UserId>) -> usize {
        let mut delivered = 0;
        let mut overflowed = Vec::new();
        for (user_id, outbox) in &self.peers {
            if Some(user_id) == exclude {
                continue;
            }
            match deliver(&self.atomic_stats, user_id, outbox, frame.clone()) {
                Delivery::Sent => delivered += 1,
                Delivery::Full => overflowed.push(*user_id),
                Delivery::Closed => {}
            }
        }
        for user_id in overflowed {
            self.evict(user_id);
        }
        delivered
    }

    /// Deliver a message to a single peer.
    pub fn send_to(&mut self, user_id: &UserId, msg: &ServerMessage) -> Result<bool, ProtocolError> {
        let Some(outbox) = self.peers.get(user_id) else {
            return Ok(false);
        };
        let frame = Utf8Bytes::from(msg.encode()?);
        match deliver(&self.atomic_stats, user_id, outbox, frame) {
            Delivery::Sent => Ok(true),
            Delivery::Full => {
                self.evict(*user_id);
                Ok(false)
            }
            Delivery::Closed => Ok(false),
        }
    }

    fn evict(&mut self, user_id: UserId) {
        if self.peers.remove(&user_id).is_some() {
            self.atomic_stats.peers_evicted.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Outbox for {user_id} is full ({} frames), evicting",
                self.capacity
            );
            self.evicted.push(user_id);
        }
    }

    /// Drain the ids evicted for overflow since the last call.
    pub fn take_evicted(&mut self) -> Vec<UserId> {
        std::mem::take(&mut self.evicted)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peer(&self, user_id: &UserId) -> bool {
        self.peers.contains_key(user_id)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            peers_evicted: self.atomic_stats.peers_evicted.load(Ordering::Relaxed),
            active_peers: self.peers.len(),
        }
    }
}

fn deliver(
    stats: &AtomicBroadcastStats,
    user_id: &UserId,
    outbox: &Outbox,
    frame: Utf8Bytes,
) -> Delivery {
    match outbox.try_send(frame) {
        Ok(()) => {
            stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            Delivery::Sent
        }
        Err(TrySendError::Full(_)) => {
            stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            Delivery::Full
        }
        Err(TrySendError::Closed(_)) => {
            stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("Outbox for {user_id} is closed, dropping frame");
            Delivery::Closed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pong() -> ServerMessage {
        ServerMessage::Pong {
            timestamp: "t".into(),
        }
    }

    #[tokio::test]
    async fn test_add_remove_peer() {
        let mut group = BroadcastGroup::new(16);
        let alice = UserId::new(1);

        let _rx = group.add_peer(alice);
        assert_eq!(group.peer_count(), 1);
        assert!(group.has_peer(&alice));

        assert!(group.remove_peer(&alice));
        assert!(!group.remove_peer(&alice));
        assert_eq!(group.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let mut group = BroadcastGroup::new(16);
        let (a, b, c) = (UserId::new(1), UserId::new(2), UserId::new(3));
        let mut rx_a = group.add_peer(a);
        let mut rx_b = group.add_peer(b);
        let mut rx_c = group.add_peer(c);

        let count = group.broadcast(&pong(), Some(&a)).unwrap();
        assert_eq!(count, 2);

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.recv().await.unwrap().as_str().contains("pong"));
        assert!(rx_c.recv().await.unwrap().as_str().contains("pong"));
    }

    #[tokio::test]
    async fn test_broadcast_without_exclusion_reaches_all() {
        let mut group = BroadcastGroup::new(16);
        let mut receivers: Vec<_> = (1..=5).map(|i| group.add_peer(UserId::new(i))).collect();

        assert_eq!(group.broadcast(&pong(), None).unwrap(), 5);
        for rx in &mut receivers {
            assert!(rx.try_recv().is_ok());
        }
    }

    #[tokio::test]
    async fn test_full_outbox_evicts_peer() {
        let mut group = BroadcastGroup::new(1);
        let (slow, fast) = (UserId::new(1), UserId::new(2));
        let mut rx_slow = group.add_peer(slow);
        let mut rx_fast = group.add_peer(fast);

        // Fill the slow peer; the fast one keeps draining.
        assert_eq!(group.broadcast(&pong(), None).unwrap(), 2);
        rx_fast.recv().await.unwrap();

        assert_eq!(group.broadcast(&pong(), None).unwrap(), 1);
        assert!(rx_fast.recv().await.is_some());
        assert!(!group.has_peer(&slow));
        assert_eq!(group.take_evicted(), vec![slow]);
        assert!(group.take_evicted().is_empty());

        // The buffered frame is still delivered, then the outbox ends.
        assert!(rx_slow.recv().await.is_some());
        assert!(rx_slow.recv().await.is_none());

        let stats = group.stats();
        assert_eq!(stats.messages_sent, 3);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.peers_evicted, 1);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_send_to_full_outbox_evicts_peer() {
        let mut group = BroadcastGroup::new(1);
        let a = UserId::new(1);
        let _rx = group.add_peer(a);

        assert!(group.send_to(&a, &pong()).unwrap());
        assert!(!group.send_to(&a, &pong()).unwrap());
        assert_eq!(group.take_evicted(), vec![a]);
        assert_eq!(group.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_outbox_isolated() {
        let mut group = BroadcastGroup::new(4);
        let (gone, live) = (UserId::new(1), UserId::new(2));
        drop(group.add_peer(gone));
        let mut rx_live = group.add_peer(live);

        assert_eq!(group.broadcast(&pong(), None).unwrap(), 1);
        assert!(rx_live.recv().await.is_some());
        assert_eq!(group.stats().messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_send_to_single_peer() {
        let mut group = BroadcastGroup::new(4);
        let (a, b) = (UserId::new(1), UserId::new(2));
        let mut rx_a = group.add_peer(a);
        let mut rx_b = group.add_peer(b);

        assert!(group.send_to(&a, &pong()).unwrap());
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());

        assert!(!group.send_to(&UserId::new(99), &pong()).unwrap());
    }

    #[tokio::test]
    async fn test_frame_serialized_once_and_shared() {
        let mut group = BroadcastGroup::new(4);
        let mut rx1 = group.add_peer(UserId::new(1));
        let mut rx2 = group.add_peer(UserId::new(2));

        group.broadcast_raw(Utf8Bytes::from_static("{\"type\":\"pong\"}"), None);
        let f1 = rx1.recv().await.unwrap();
        let f2 = rx2.recv().await.unwrap();
        assert_eq!(f1.as_str(), f2.as_str());
    }

    #[tokio::test]
    async fn test_zero_capacity_still_buffers_one_frame() {
        let mut group = BroadcastGroup::new(0);
        let mut rx = group.add_peer(UserId::new(1));
        assert_eq!(group.broadcast(&pong(), None).unwrap(), 1);
        assert!(rx.recv().await.is_some());
    }
}
