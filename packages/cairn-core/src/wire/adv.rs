//! Advertising packet layout.
//!
//! Discovery runs over BLE legacy advertising: a 10-byte service-data block
//! in the main advertisement and the UTF-8 group name in the scan response
//! (manufacturer data, id 0xFFFF). The group name is truncated on a
//! code-point boundary so a partial name still decodes.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use super::{NodeId, WireError};
use crate::protocol_constants::{ADV_SERVICE_DATA_LEN, MAX_GROUP_NAME_BYTES};

/// Everything a node advertises between refreshes.
///
/// Compared for equality to suppress redundant advertising restarts; the
/// comparison must therefore cover every advertised field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdvertisingConfig {
    /// Group name, at most 20 UTF-8 bytes on the air.
    pub group_name: String,
    /// This node's id.
    pub own_node_id: NodeId,
    /// Believed root of this node's island.
    pub network_id: NodeId,
    /// Hops from this node to the root.
    pub hops_to_root: u8,
    /// Whether this node accepts another link (`peer_count < MAX_PEERS`).
    pub is_available: bool,
}

/// Encodes the 10-byte advertising service-data block.
#[must_use]
pub fn encode_service_data(config: &AdvertisingConfig) -> Bytes {
    let mut buf = BytesMut::with_capacity(ADV_SERVICE_DATA_LEN);
    buf.put_u32_le(config.own_node_id);
    buf.put_u32_le(config.network_id);
    buf.put_u8(config.hops_to_root);
    buf.put_u8(u8::from(config.is_available));
    buf.freeze()
}

/// Decodes the 10-byte service-data block into `(nodeId, networkId, hops, isAvailable)`.
pub fn decode_service_data(data: &[u8]) -> Result<(NodeId, NodeId, u8, bool), WireError> {
    if data.len() != ADV_SERVICE_DATA_LEN {
        return Err(WireError::MalformedFrame("advertising service data is 10 bytes"));
    }
    let node_id = u32::from_le_bytes(data[0..4].try_into().expect("length checked"));
    let network_id = u32::from_le_bytes(data[4..8].try_into().expect("length checked"));
    Ok((node_id, network_id, data[8], data[9] != 0))
}

/// Truncates `s` to at most `max_bytes` UTF-8 bytes on a code-point boundary.
///
/// The result is always a valid UTF-8 prefix of `s`.
#[must_use]
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// The group name as it appears in the scan response.
#[must_use]
pub fn advertised_group_name(group_name: &str) -> &str {
    truncate_utf8(group_name, MAX_GROUP_NAME_BYTES)
}
