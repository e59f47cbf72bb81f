//! Link Driver capability.
//!
//! The core never touches BLE APIs directly; any physical transport (or the
//! in-process [`memory`] hub) implements [`LinkDriver`] and feeds the
//! controller a single [`LinkEvent`] stream. The driver owns the radio
//! primitives — scanner, advertiser, GATT client and server — and runs the
//! per-link handshake, since it is the layer holding the session
//! credentials (`set_credentials`).

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::peer::Transport;
use crate::wire::{AdvertisingConfig, NodeId};

/// Which characteristic a frame travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Control envelopes: handshake, heartbeats, pings.
    Control,
    /// Raw voice frames.
    Audio,
}

/// Errors reported by a link driver.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    /// The platform lacks a required radio capability.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Connecting to a peer failed before authentication.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Connecting did not authenticate within the configured bound.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The link closed under an in-flight operation.
    #[error("link closed")]
    LinkClosed,

    /// A single operation exceeded the watchdog.
    #[error("operation stalled")]
    OperationStalled,
}

/// A scan result, one per received advertisement.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    /// Opaque link-layer address (BLE MAC or hub address).
    pub link_address: String,
    /// Advertised group name from the scan response.
    pub group_name: String,
    /// Received signal strength (dBm).
    pub rssi: i16,
    /// Advertiser's node id.
    pub node_id: NodeId,
    /// Advertiser's believed root.
    pub network_id: NodeId,
    /// Advertiser's hops to its root.
    pub hops_to_root: u8,
    /// Whether the advertiser accepts another link.
    pub is_available: bool,
}

/// The single event stream a driver produces for the controller.
pub enum LinkEvent {
    /// An advertisement was received while scanning.
    PeerDiscovered(DiscoveredPeer),
    /// A link finished authenticating; the transport is ready to register.
    PeerConnected {
        /// Authenticated remote node id.
        node_id: NodeId,
        /// The ready transport strategy for this link.
        transport: Arc<dyn Transport>,
    },
    /// A link dropped (remote close, stall, or radio loss).
    PeerDisconnected {
        /// Remote node id of the dropped link.
        node_id: NodeId,
        /// Remote link address of the dropped link.
        link_address: String,
        /// Identity of the dropped link, for the stale-disconnect guard.
        link_id: u64,
    },
    /// A frame arrived on an authenticated link.
    DataReceived {
        /// Sending peer.
        from: NodeId,
        /// Frame bytes (envelope for control, raw for audio).
        data: Bytes,
        /// Characteristic the frame arrived on.
        data_type: DataType,
    },
}

impl std::fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerDiscovered(peer) => f.debug_tuple("PeerDiscovered").field(peer).finish(),
            Self::PeerConnected { node_id, transport } => f
                .debug_struct("PeerConnected")
                .field("node_id", node_id)
                .field("link_address", &transport.link_address())
                .field("kind", &transport.kind())
                .finish(),
            Self::PeerDisconnected { node_id, link_address, link_id } => f
                .debug_struct("PeerDisconnected")
                .field("node_id", node_id)
                .field("link_address", link_address)
                .field("link_id", link_id)
                .finish(),
            Self::DataReceived { from, data, data_type } => f
                .debug_struct("DataReceived")
                .field("from", from)
                .field("len", &data.len())
                .field("data_type", data_type)
                .finish(),
        }
    }
}

/// Sender half of a driver's event stream.
pub type LinkEventSender = mpsc::Sender<LinkEvent>;

/// Receiver half of a driver's event stream, consumed by the controller.
pub type LinkEventReceiver = mpsc::Receiver<LinkEvent>;

/// Capacity of a driver's event channel.
pub const LINK_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Uniform view over scanner + advertiser + GATT client + GATT server.
///
/// Implementations must emit every connection outcome on the event stream:
/// `connect_to` eventually yields `PeerConnected` or the link terminates
/// with `PeerDisconnected` (or an error return, when it never got far
/// enough to exist).
#[async_trait]
pub trait LinkDriver: Send + Sync {
    /// Checks that the platform can scan, advertise, and serve GATT.
    fn validate_capabilities(&self) -> Result<(), LinkError>;

    /// Installs the session credentials used by the handshake.
    fn set_credentials(&self, access_code: &str, own_node_id: NodeId);

    /// Starts the scanner. The caller holds a scan-rate-limiter token.
    async fn start_scanning(&self) -> Result<(), LinkError>;

    /// Stops the scanner.
    async fn stop_scanning(&self);

    /// Starts (or restarts) advertising with the given configuration.
    async fn start_advertising(&self, config: &AdvertisingConfig) -> Result<(), LinkError>;

    /// Stops advertising.
    async fn stop_advertising(&self);

    /// Dials `link_address` and runs the client side of the handshake.
    ///
    /// Resolves once the link authenticates (after `PeerConnected` is
    /// emitted) or fails. `node_id` is the advertiser's id from the scan
    /// result, used to label the resulting transport.
    async fn connect_to(&self, link_address: &str, node_id: NodeId) -> Result<(), LinkError>;

    /// Tears down every live link.
    async fn disconnect_all(&self);

    /// Releases radio resources. The driver is unusable afterwards.
    fn destroy(&self);
}
