//! Event emitter abstraction for decoupling the controller from transport.
//!
//! The controller depends on the [`EventEmitter`] trait rather than a
//! concrete channel, enabling testing and alternative delivery paths.

use super::{DiscoveryEvent, PeerEvent, StateEvent, TopologyEvent};

/// Trait for emitting mesh events without knowledge of transport.
///
/// The controller uses this trait to surface events, decoupling it from how
/// they reach the embedding (Tauri frontend, WebSocket, logs, test probes).
pub trait EventEmitter: Send + Sync {
    /// Emits an engine state transition.
    fn emit_state(&self, event: StateEvent);

    /// Emits a group discovery event.
    fn emit_discovery(&self, event: DiscoveryEvent);

    /// Emits a peer join/leave event.
    fn emit_peer(&self, event: PeerEvent);

    /// Emits a topology change event.
    fn emit_topology(&self, event: TopologyEvent);
}

/// No-op emitter for embeddings that poll snapshots instead.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_state(&self, _event: StateEvent) {
        // No-op
    }

    fn emit_discovery(&self, _event: DiscoveryEvent) {
        // No-op
    }

    fn emit_peer(&self, _event: PeerEvent) {
        // No-op
    }

    fn emit_topology(&self, _event: TopologyEvent) {
        // No-op
    }
}

/// Logging emitter for debugging and headless runs.
///
/// Logs all events at debug level.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_state(&self, event: StateEvent) {
        tracing::debug!(?event, "state_event");
    }

    fn emit_discovery(&self, event: DiscoveryEvent) {
        tracing::debug!(?event, "discovery_event");
    }

    fn emit_peer(&self, event: PeerEvent) {
        tracing::debug!(?event, "peer_event");
    }

    fn emit_topology(&self, event: TopologyEvent) {
        tracing::debug!(?event, "topology_event");
    }
}
