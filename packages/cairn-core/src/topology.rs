//! Topology engine: root election, island merge, downgrade.
//!
//! The engine is a pure function of the heartbeat stream plus a clock tick;
//! it performs no I/O and takes `now` explicitly. The ordering rule is the
//! standard loop-free monotonic metric: a strictly greater `networkId`
//! always wins (merge), and within a network only a strictly greater
//! sequence is accepted (refresh). Stale information cycled back through
//! the flood can therefore never be re-adopted.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::wire::{Heartbeat, NodeId};

/// What this node currently believes about its island.
#[derive(Debug, Clone)]
pub struct TopologyState {
    /// Node id of the believed root.
    pub network_id: NodeId,
    /// Hops from this node to the root (0 when self-root).
    pub hops_to_root: u8,
    /// Latest accepted root sequence.
    pub root_sequence: i32,
    /// When the last heartbeat was accepted (or the state was reset).
    pub last_heartbeat_at: Instant,
}

/// Serializable view of [`TopologyState`] for UIs and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TopologySnapshot {
    /// Node id of the believed root.
    #[serde(rename = "networkId")]
    pub network_id: NodeId,
    /// Hops from this node to the root.
    #[serde(rename = "hopsToRoot")]
    pub hops_to_root: u8,
    /// Latest accepted root sequence.
    #[serde(rename = "rootSequence")]
    pub root_sequence: i32,
    /// Whether this node is the root.
    #[serde(rename = "isRoot")]
    pub is_root: bool,
}

/// Outcome of ingesting one heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The state changed; the caller relays at `hops + 1` and refreshes
    /// advertising.
    Changed,
    /// Stale or duplicate information; nothing to do.
    Unchanged,
}

/// Outcome of one periodic tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Self-root: emit this heartbeat to all peers.
    Emit(Heartbeat),
    /// Root went silent; this node downgraded to a one-node island.
    Downgraded,
    /// Non-root, root still live; nothing to do.
    Idle,
}

/// Per-component root election driven by heartbeats and a clock.
pub struct TopologyEngine {
    own_node_id: NodeId,
    heartbeat_timeout: Duration,
    state: TopologyState,
}

impl TopologyEngine {
    /// Creates an engine for a fresh one-node island rooted at `own_node_id`.
    #[must_use]
    pub fn new(own_node_id: NodeId, heartbeat_timeout: Duration, now: Instant) -> Self {
        Self {
            own_node_id,
            heartbeat_timeout,
            state: Self::self_root_state(own_node_id, now),
        }
    }

    fn self_root_state(own_node_id: NodeId, now: Instant) -> TopologyState {
        TopologyState {
            network_id: own_node_id,
            hops_to_root: 0,
            root_sequence: 0,
            last_heartbeat_at: now,
        }
    }

    /// Resets to a one-node island (entering RadioActive).
    pub fn reset(&mut self, now: Instant) {
        self.state = Self::self_root_state(self.own_node_id, now);
    }

    /// True when this node believes it is the root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.state.network_id == self.own_node_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &TopologyState {
        &self.state
    }

    /// Serializable snapshot.
    #[must_use]
    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            network_id: self.state.network_id,
            hops_to_root: self.state.hops_to_root,
            root_sequence: self.state.root_sequence,
            is_root: self.is_root(),
        }
    }

    /// Ingests a heartbeat received from a neighbor.
    pub fn on_heartbeat(&mut self, hb: &Heartbeat, now: Instant) -> HeartbeatOutcome {
        if hb.network_id > self.state.network_id {
            // Merge: a greater root id always wins.
            self.state.network_id = hb.network_id;
            self.state.hops_to_root = hb.hops.saturating_add(1);
            self.state.root_sequence = hb.sequence;
            self.state.last_heartbeat_at = now;
            HeartbeatOutcome::Changed
        } else if hb.network_id == self.state.network_id && hb.sequence > self.state.root_sequence {
            // Refresh: newer word from the same root.
            self.state.hops_to_root = hb.hops.saturating_add(1);
            self.state.root_sequence = hb.sequence;
            self.state.last_heartbeat_at = now;
            HeartbeatOutcome::Changed
        } else {
            HeartbeatOutcome::Unchanged
        }
    }

    /// Advances the engine by one `HEARTBEAT_INTERVAL` tick.
    pub fn on_tick(&mut self, now: Instant) -> TickOutcome {
        if self.is_root() {
            self.state.root_sequence = self.state.root_sequence.wrapping_add(1);
            self.state.last_heartbeat_at = now;
            TickOutcome::Emit(Heartbeat {
                network_id: self.own_node_id,
                sequence: self.state.root_sequence,
                hops: 0,
            })
        } else if now.duration_since(self.state.last_heartbeat_at) > self.heartbeat_timeout {
            self.reset(now);
            TickOutcome::Downgraded
        } else {
            TickOutcome::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(6);

    fn engine(own: NodeId) -> TopologyEngine {
        TopologyEngine::new(own, TIMEOUT, Instant::now())
    }

    fn hb(network_id: NodeId, sequence: i32, hops: u8) -> Heartbeat {
        Heartbeat { network_id, sequence, hops }
    }

    #[tokio::test]
    async fn starts_as_self_root() {
        let engine = engine(5);
        assert!(engine.is_root());
        assert_eq!(engine.state().network_id, 5);
        assert_eq!(engine.state().hops_to_root, 0);
        assert_eq!(engine.state().root_sequence, 0);
    }

    #[tokio::test]
    async fn greater_network_id_is_adopted() {
        let mut engine = engine(5);
        let outcome = engine.on_heartbeat(&hb(9, 4, 1), Instant::now());
        assert_eq!(outcome, HeartbeatOutcome::Changed);
        assert!(!engine.is_root());
        assert_eq!(engine.state().network_id, 9);
        assert_eq!(engine.state().hops_to_root, 2);
        assert_eq!(engine.state().root_sequence, 4);
    }

    #[tokio::test]
    async fn lesser_network_id_is_ignored() {
        let mut engine = engine(5);
        assert_eq!(
            engine.on_heartbeat(&hb(3, 100, 0), Instant::now()),
            HeartbeatOutcome::Unchanged
        );
        assert!(engine.is_root());
    }

    #[tokio::test]
    async fn same_network_needs_strictly_greater_sequence() {
        let mut engine = engine(5);
        engine.on_heartbeat(&hb(9, 4, 1), Instant::now());

        // Replay and stale sequences are rejected.
        assert_eq!(
            engine.on_heartbeat(&hb(9, 4, 0), Instant::now()),
            HeartbeatOutcome::Unchanged
        );
        assert_eq!(
            engine.on_heartbeat(&hb(9, 3, 0), Instant::now()),
            HeartbeatOutcome::Unchanged
        );

        // A fresh sequence refreshes hops too.
        assert_eq!(
            engine.on_heartbeat(&hb(9, 5, 3), Instant::now()),
            HeartbeatOutcome::Changed
        );
        assert_eq!(engine.state().hops_to_root, 4);
        assert_eq!(engine.state().root_sequence, 5);
    }

    #[tokio::test]
    async fn acceptance_is_monotone_over_time() {
        let mut engine = engine(1);
        let mut last = (engine.state().network_id, engine.state().root_sequence);
        for beat in [hb(4, 1, 0), hb(3, 9, 0), hb(4, 2, 1), hb(7, 1, 2), hb(7, 1, 0)] {
            engine.on_heartbeat(&beat, Instant::now());
            let current = (engine.state().network_id, engine.state().root_sequence);
            assert!(current >= last, "state regressed: {last:?} -> {current:?}");
            last = current;
        }
    }

    #[tokio::test]
    async fn root_tick_emits_monotone_sequence_with_zero_hops() {
        let mut engine = engine(5);
        for expected_seq in 1..=3 {
            match engine.on_tick(Instant::now()) {
                TickOutcome::Emit(beat) => {
                    assert_eq!(beat.network_id, 5);
                    assert_eq!(beat.sequence, expected_seq);
                    assert_eq!(beat.hops, 0);
                }
                other => panic!("expected Emit, got {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_root_triggers_downgrade() {
        let mut engine = engine(5);
        engine.on_heartbeat(&hb(9, 1, 0), Instant::now());
        assert!(!engine.is_root());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(engine.on_tick(Instant::now()), TickOutcome::Idle);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(engine.on_tick(Instant::now()), TickOutcome::Downgraded);
        assert!(engine.is_root());
        assert_eq!(engine.state().network_id, 5);
        assert_eq!(engine.state().hops_to_root, 0);
        assert_eq!(engine.state().root_sequence, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_the_root_alive() {
        let mut engine = engine(5);
        engine.on_heartbeat(&hb(9, 1, 0), Instant::now());

        for seq in 2..8 {
            tokio::time::advance(Duration::from_secs(1)).await;
            engine.on_heartbeat(&hb(9, seq, 0), Instant::now());
            assert_eq!(engine.on_tick(Instant::now()), TickOutcome::Idle);
        }
        assert!(!engine.is_root());
    }

    #[tokio::test]
    async fn reset_returns_to_self_root() {
        let mut engine = engine(5);
        engine.on_heartbeat(&hb(9, 7, 2), Instant::now());
        engine.reset(Instant::now());
        assert!(engine.is_root());
        assert_eq!(engine.snapshot().root_sequence, 0);
    }
}
