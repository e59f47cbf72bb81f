//! Event system for embedders (UI, headless server).
//!
//! This module provides:
//! - [`EventEmitter`] trait for the controller to emit events
//! - Event types for the mesh domains (engine state, discovery, peers,
//!   topology)
//!
//! Transport of the events (Tauri bridge, WebSocket, plain logs) is the
//! embedding's concern; the core only calls the trait.

mod emitter;

pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

use crate::wire::NodeId;

/// Events broadcast to embedders.
///
/// This enum categorizes all real-time events the mesh core can surface.
/// Each category has its own inner event type with specific variants.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum MeshEvent {
    /// Engine state machine transitions.
    State(StateEvent),

    /// Group discovery while scanning.
    Discovery(DiscoveryEvent),

    /// Peer links coming and going.
    Peer(PeerEvent),

    /// Root / island changes.
    Topology(TopologyEvent),
}

/// Engine state machine transitions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StateEvent {
    /// The engine entered a new state.
    Changed {
        /// New state name (`idle`, `discovering`, `joining`, `radioActive`).
        state: &'static str,
        /// Group name, when the state carries one.
        group: Option<String>,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Group discovery while scanning.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DiscoveryEvent {
    /// A group was seen for the first time, or its strongest RSSI improved.
    GroupUpdated {
        /// Advertised group name.
        #[serde(rename = "groupName")]
        group_name: String,
        /// Strongest RSSI observed for this group (dBm).
        #[serde(rename = "highestRssi")]
        highest_rssi: i16,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A group fell silent past the advertisement timeout.
    GroupExpired {
        /// Advertised group name.
        #[serde(rename = "groupName")]
        group_name: String,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Peer links coming and going.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PeerEvent {
    /// A peer authenticated and was registered.
    Joined {
        /// Remote node id.
        #[serde(rename = "nodeId")]
        node_id: NodeId,
        /// Registry size after the join.
        #[serde(rename = "peerCount")]
        peer_count: usize,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A peer link was lost or force-disconnected.
    Left {
        /// Remote node id.
        #[serde(rename = "nodeId")]
        node_id: NodeId,
        /// Registry size after the departure.
        #[serde(rename = "peerCount")]
        peer_count: usize,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}

/// Root / island changes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TopologyEvent {
    /// The believed root, hop distance, or root role changed.
    Changed {
        /// Node id of the believed root.
        #[serde(rename = "networkId")]
        network_id: NodeId,
        /// Hops from this node to the root.
        #[serde(rename = "hopsToRoot")]
        hops_to_root: u8,
        /// Whether this node is the root.
        #[serde(rename = "isRoot")]
        is_root: bool,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
}
