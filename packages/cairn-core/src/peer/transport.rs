//! Transport strategies over a single authenticated link.
//!
//! A link is asymmetric at the GATT layer — one side dialed (client), one
//! side accepted (server) — but the registry treats both through one
//! interface. The kind survives only for the simultaneous-connection
//! tie-break; everything else is role-blind.

use async_trait::async_trait;
use bytes::Bytes;

use crate::link::{DataType, LinkError};
use crate::wire::NodeId;

/// Which side of the GATT connection this strategy is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// We dialed (GATT client).
    Outgoing,
    /// They dialed (GATT server).
    Incoming,
}

/// One logical send/disconnect surface over an authenticated link.
///
/// Exactly one strategy per [`super::PeerConnection`] at any instant.
/// `send` resolves once the frame is handed to the link layer, so a send
/// followed by `disconnect` flushes before the close (the handshake's
/// reject-then-drop path depends on this).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Authenticated remote node id.
    fn node_id(&self) -> NodeId;

    /// Which side dialed.
    fn kind(&self) -> TransportKind;

    /// Remote link-layer address.
    fn link_address(&self) -> &str;

    /// Process-unique identity of this link.
    ///
    /// Both links of a simultaneous-connection collision share one remote
    /// address; disconnect events are matched on this id instead.
    fn link_id(&self) -> u64;

    /// Queues a frame on the link's operation queue.
    async fn send(&self, frame: Bytes, data_type: DataType) -> Result<(), LinkError>;

    /// Closes the link: cancels the event collector, then drops the queue.
    async fn disconnect(&self);
}
