//! Peer registry and transport multiplexing.
//!
//! The registry enforces the one-logical-link-per-node rule over two
//! asymmetric underlying roles (we-dialed vs they-dialed), resolves
//! simultaneous-connection collisions with the canonical tie-break, and is
//! the fan-out point for floods. Liveness stamps are lock-free atomics
//! against a monotonic reference instant; per-peer transport swaps happen
//! under a short per-peer mutex that never crosses an await.

mod opqueue;
mod transport;

pub use opqueue::{OpExecutor, OpQueueConfig, OperationQueue};
pub use transport::{Transport, TransportKind};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::link::{DataType, LinkError};
use crate::wire::NodeId;

/// How a `register` call was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// First link for this node id.
    Installed,
    /// Replaced the previous transport (MAC rotation or same-kind retry).
    Replaced,
    /// Simultaneous-connection collision; the new link won.
    CollisionKeptNew,
    /// Simultaneous-connection collision; the existing link won.
    CollisionKeptExisting,
}

impl RegisterOutcome {
    /// True when the node was not connected before this call.
    #[must_use]
    pub fn is_new_peer(self) -> bool {
        matches!(self, Self::Installed)
    }
}

/// One remote node: its current transport and when it was last heard.
pub struct PeerConnection {
    node_id: NodeId,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    /// Nanos since the registry reference instant of the last inbound frame.
    last_heard_nanos: AtomicU64,
}

impl PeerConnection {
    fn new(node_id: NodeId, reference: Instant) -> Self {
        let connection = Self {
            node_id,
            transport: Mutex::new(None),
            last_heard_nanos: AtomicU64::new(0),
        };
        connection.touch(reference);
        connection
    }

    /// Remote node id.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Clones the current transport, if any.
    #[must_use]
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().clone()
    }

    fn touch(&self, reference: Instant) {
        let nanos = Instant::now().duration_since(reference).as_nanos() as u64;
        self.last_heard_nanos.store(nanos, Ordering::Relaxed);
    }

    fn silence(&self, reference: Instant) -> Duration {
        let now_nanos = Instant::now().duration_since(reference).as_nanos() as u64;
        Duration::from_nanos(now_nanos.saturating_sub(self.last_heard_nanos.load(Ordering::Relaxed)))
    }
}

/// All authenticated peers, at most one logical link each.
pub struct PeerRegistry {
    own_node_id: NodeId,
    peers: DashMap<NodeId, Arc<PeerConnection>>,
    /// Monotonic reference for the lock-free liveness stamps.
    reference: Instant,
}

impl PeerRegistry {
    /// Creates an empty registry for a node.
    #[must_use]
    pub fn new(own_node_id: NodeId) -> Self {
        Self {
            own_node_id,
            peers: DashMap::new(),
            reference: Instant::now(),
        }
    }

    /// Number of connected peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no peers are connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// True when `node_id` has a live connection.
    #[must_use]
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.peers.contains_key(&node_id)
    }

    /// Snapshot of connected node ids.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    /// Looks up a peer's connection.
    #[must_use]
    pub fn get(&self, node_id: NodeId) -> Option<Arc<PeerConnection>> {
        self.peers.get(&node_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Refreshes the liveness stamp for `node_id` (any inbound frame).
    pub fn touch(&self, node_id: NodeId) {
        if let Some(peer) = self.peers.get(&node_id) {
            peer.touch(self.reference);
        }
    }

    /// Peers silent for longer than `timeout`.
    #[must_use]
    pub fn idle_peers(&self, timeout: Duration) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|entry| entry.value().silence(self.reference) > timeout)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Installs a transport for `node_id`, enforcing one link per node.
    ///
    /// On an address mismatch the old link is assumed dead (MAC rotation)
    /// and replaced. A same-kind duplicate is a retry and replaces. Opposite
    /// kinds on one address are a simultaneous-connection collision, broken
    /// by "the link whose dialer has the greater node id wins": a new
    /// Outgoing link is kept iff `own > remote`, a new Incoming link iff
    /// `remote > own`. The losing transport is disconnected.
    pub async fn register(
        &self,
        node_id: NodeId,
        new_transport: Arc<dyn Transport>,
    ) -> RegisterOutcome {
        let peer = Arc::clone(
            self.peers
                .entry(node_id)
                .or_insert_with(|| Arc::new(PeerConnection::new(node_id, self.reference)))
                .value(),
        );

        let (outcome, to_dispose) = {
            let mut slot = peer.transport.lock();
            match slot.take() {
                None => {
                    *slot = Some(new_transport);
                    (RegisterOutcome::Installed, None)
                }
                Some(current) => {
                    if current.link_address() != new_transport.link_address()
                        || current.kind() == new_transport.kind()
                    {
                        *slot = Some(new_transport);
                        (RegisterOutcome::Replaced, Some(current))
                    } else {
                        let keep_new = match new_transport.kind() {
                            TransportKind::Outgoing => self.own_node_id > node_id,
                            TransportKind::Incoming => node_id > self.own_node_id,
                        };
                        if keep_new {
                            *slot = Some(new_transport);
                            (RegisterOutcome::CollisionKeptNew, Some(current))
                        } else {
                            *slot = Some(current);
                            (RegisterOutcome::CollisionKeptExisting, Some(new_transport))
                        }
                    }
                }
            }
        };

        peer.touch(self.reference);
        if let Some(loser) = to_dispose {
            log::debug!(
                "[PeerRegistry] Disposing {:?} link to {:#010x} ({:?})",
                loser.kind(),
                node_id,
                outcome
            );
            loser.disconnect().await;
        }
        outcome
    }

    /// Removes the peer whose *current* transport matches the dropped link.
    ///
    /// A disconnect event from a just-replaced stale transport matches
    /// neither address nor link id and leaves the live link alone.
    pub fn unregister_link(&self, link_address: &str, link_id: u64) -> Option<NodeId> {
        let node_id = self.peers.iter().find_map(|entry| {
            let transport = entry.value().transport();
            match transport {
                Some(t) if t.link_address() == link_address && t.link_id() == link_id => {
                    Some(*entry.key())
                }
                _ => None,
            }
        })?;
        self.peers.remove(&node_id);
        Some(node_id)
    }

    /// Force-disconnects `node_id`.
    ///
    /// The map entry is removed before the transport teardown is awaited,
    /// so a re-registration under the same id never sees stale state.
    pub async fn disconnect(&self, node_id: NodeId) -> bool {
        let Some((_, peer)) = self.peers.remove(&node_id) else {
            return false;
        };
        let transport = peer.transport.lock().take();
        if let Some(transport) = transport {
            transport.disconnect().await;
        }
        true
    }

    /// Tears down every link.
    pub async fn disconnect_all(&self) {
        let node_ids = self.node_ids();
        join_all(node_ids.into_iter().map(|node_id| self.disconnect(node_id))).await;
    }

    /// Sends a frame to one peer.
    pub async fn send(
        &self,
        node_id: NodeId,
        frame: Bytes,
        data_type: DataType,
    ) -> Result<(), LinkError> {
        let transport = self
            .peers
            .get(&node_id)
            .and_then(|peer| peer.transport())
            .ok_or(LinkError::LinkClosed)?;
        transport.send(frame, data_type).await
    }

    /// Sends a frame to every peer except `exclude`.
    ///
    /// Per-link failures are logged and swallowed; a broken link is healed
    /// by its own disconnect path, never by aborting the flood.
    pub async fn broadcast(&self, frame: Bytes, data_type: DataType, exclude: Option<NodeId>) {
        let transports: Vec<_> = self
            .peers
            .iter()
            .filter(|entry| Some(*entry.key()) != exclude)
            .filter_map(|entry| entry.value().transport())
            .collect();

        let sends = transports.iter().map(|transport| {
            let frame = frame.clone();
            async move {
                if let Err(err) = transport.send(frame, data_type).await {
                    log::debug!(
                        "[PeerRegistry] Broadcast to {:#010x} failed: {err}",
                        transport.node_id()
                    );
                }
            }
        });
        join_all(sends).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use tokio::time;

    struct TestTransport {
        node_id: NodeId,
        kind: TransportKind,
        link_address: String,
        link_id: u64,
        disconnected: AtomicBool,
        sent: Mutex<Vec<Bytes>>,
    }

    impl TestTransport {
        fn new(node_id: NodeId, kind: TransportKind, link_address: &str, link_id: u64) -> Arc<Self> {
            Arc::new(Self {
                node_id,
                kind,
                link_address: link_address.to_string(),
                link_id,
                disconnected: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn is_disconnected(&self) -> bool {
            self.disconnected.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for TestTransport {
        fn node_id(&self) -> NodeId {
            self.node_id
        }

        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn link_address(&self) -> &str {
            &self.link_address
        }

        fn link_id(&self) -> u64 {
            self.link_id
        }

        async fn send(&self, frame: Bytes, _data_type: DataType) -> Result<(), LinkError> {
            self.sent.lock().push(frame);
            Ok(())
        }

        async fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn install_then_contains() {
        let registry = PeerRegistry::new(1);
        let transport = TestTransport::new(2, TransportKind::Outgoing, "AA", 1);
        let outcome = registry.register(2, transport).await;
        assert_eq!(outcome, RegisterOutcome::Installed);
        assert!(outcome.is_new_peer());
        assert!(registry.contains(2));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn address_change_replaces_as_mac_rotation() {
        let registry = PeerRegistry::new(1);
        let old = TestTransport::new(2, TransportKind::Outgoing, "AA", 1);
        let new = TestTransport::new(2, TransportKind::Incoming, "BB", 2);
        registry.register(2, Arc::clone(&old) as Arc<dyn Transport>).await;

        let outcome = registry.register(2, Arc::clone(&new) as Arc<dyn Transport>).await;
        assert_eq!(outcome, RegisterOutcome::Replaced);
        assert!(old.is_disconnected());
        assert!(!new.is_disconnected());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn same_kind_is_a_retry_and_replaces() {
        let registry = PeerRegistry::new(1);
        let old = TestTransport::new(2, TransportKind::Outgoing, "AA", 1);
        let new = TestTransport::new(2, TransportKind::Outgoing, "AA", 2);
        registry.register(2, Arc::clone(&old) as Arc<dyn Transport>).await;

        let outcome = registry.register(2, Arc::clone(&new) as Arc<dyn Transport>).await;
        assert_eq!(outcome, RegisterOutcome::Replaced);
        assert!(old.is_disconnected());
    }

    #[tokio::test]
    async fn collision_new_outgoing_wins_when_own_id_greater() {
        let registry = PeerRegistry::new(5);
        let incoming = TestTransport::new(2, TransportKind::Incoming, "AA", 1);
        let outgoing = TestTransport::new(2, TransportKind::Outgoing, "AA", 2);
        registry.register(2, Arc::clone(&incoming) as Arc<dyn Transport>).await;

        let outcome = registry.register(2, Arc::clone(&outgoing) as Arc<dyn Transport>).await;
        assert_eq!(outcome, RegisterOutcome::CollisionKeptNew);
        assert!(incoming.is_disconnected());
        assert!(!outgoing.is_disconnected());
    }

    #[tokio::test]
    async fn collision_new_outgoing_loses_when_own_id_smaller() {
        let registry = PeerRegistry::new(1);
        let incoming = TestTransport::new(2, TransportKind::Incoming, "AA", 1);
        let outgoing = TestTransport::new(2, TransportKind::Outgoing, "AA", 2);
        registry.register(2, Arc::clone(&incoming) as Arc<dyn Transport>).await;

        let outcome = registry.register(2, Arc::clone(&outgoing) as Arc<dyn Transport>).await;
        assert_eq!(outcome, RegisterOutcome::CollisionKeptExisting);
        assert!(outgoing.is_disconnected());
        assert!(!incoming.is_disconnected());
    }

    #[tokio::test]
    async fn collision_new_incoming_wins_when_remote_id_greater() {
        let registry = PeerRegistry::new(1);
        let outgoing = TestTransport::new(2, TransportKind::Outgoing, "AA", 1);
        let incoming = TestTransport::new(2, TransportKind::Incoming, "AA", 2);
        registry.register(2, Arc::clone(&outgoing) as Arc<dyn Transport>).await;

        let outcome = registry.register(2, Arc::clone(&incoming) as Arc<dyn Transport>).await;
        assert_eq!(outcome, RegisterOutcome::CollisionKeptNew);
        assert!(outgoing.is_disconnected());
    }

    #[tokio::test]
    async fn collision_resolution_keeps_exactly_one_link() {
        // Either registration order must converge on the same winner.
        for (first_kind, second_kind) in [
            (TransportKind::Incoming, TransportKind::Outgoing),
            (TransportKind::Outgoing, TransportKind::Incoming),
        ] {
            let registry = PeerRegistry::new(1);
            let first = TestTransport::new(2, first_kind, "AA", 1);
            let second = TestTransport::new(2, second_kind, "AA", 2);
            registry.register(2, Arc::clone(&first) as Arc<dyn Transport>).await;
            registry.register(2, Arc::clone(&second) as Arc<dyn Transport>).await;

            let kept = registry.peers.get(&2).unwrap().transport().unwrap();
            // own=1 < remote=2, so the remote-dialed (Incoming) link wins.
            assert_eq!(kept.kind(), TransportKind::Incoming);
            assert_eq!(registry.len(), 1);
        }
    }

    #[tokio::test]
    async fn stale_disconnect_event_does_not_evict_live_link() {
        let registry = PeerRegistry::new(1);
        let live = TestTransport::new(2, TransportKind::Incoming, "AA", 7);
        registry.register(2, live).await;

        // A disconnect for the disposed collision loser (same address,
        // different link id) must not remove the live link.
        assert_eq!(registry.unregister_link("AA", 3), None);
        assert!(registry.contains(2));

        assert_eq!(registry.unregister_link("AA", 7), Some(2));
        assert!(!registry.contains(2));
    }

    #[tokio::test]
    async fn disconnect_removes_entry_and_tears_down_transport() {
        let registry = PeerRegistry::new(1);
        let transport = TestTransport::new(2, TransportKind::Outgoing, "AA", 1);
        registry.register(2, Arc::clone(&transport) as Arc<dyn Transport>).await;

        assert!(registry.disconnect(2).await);
        assert!(!registry.contains(2));
        assert!(transport.is_disconnected());
        assert!(!registry.disconnect(2).await);
    }

    #[tokio::test]
    async fn broadcast_excludes_the_sender() {
        let registry = PeerRegistry::new(1);
        let b = TestTransport::new(2, TransportKind::Outgoing, "BB", 1);
        let c = TestTransport::new(3, TransportKind::Outgoing, "CC", 2);
        registry.register(2, Arc::clone(&b) as Arc<dyn Transport>).await;
        registry.register(3, Arc::clone(&c) as Arc<dyn Transport>).await;

        registry
            .broadcast(Bytes::from_static(b"voice"), DataType::Audio, Some(2))
            .await;

        assert!(b.sent.lock().is_empty());
        assert_eq!(c.sent.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_peers_reports_silent_links() {
        let registry = PeerRegistry::new(1);
        registry.register(2, TestTransport::new(2, TransportKind::Outgoing, "BB", 1)).await;
        registry.register(3, TestTransport::new(3, TransportKind::Outgoing, "CC", 2)).await;

        time::advance(Duration::from_secs(4)).await;
        registry.touch(3);
        time::advance(Duration::from_secs(2)).await;

        let idle = registry.idle_peers(Duration::from_secs(5));
        assert_eq!(idle, vec![2]);
    }
}
