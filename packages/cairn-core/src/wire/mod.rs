//! Wire codec for connected frames.
//!
//! Everything that crosses a link is either a raw voice frame (audio
//! characteristic) or a control envelope (control characteristic):
//!
//! ```text
//! versionFlags (1, high nibble = version) | messageType (1) | payload
//! ```
//!
//! All multi-byte integers are little-endian. Decode failures are
//! [`WireError`]s; callers drop the frame and keep the link (the handshake
//! path is the one exception, handled in [`crate::auth`]).

mod adv;

pub use adv::{
    advertised_group_name, decode_service_data, encode_service_data, truncate_utf8,
    AdvertisingConfig,
};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::error::ErrorCode;
use crate::protocol_constants::{HEARTBEAT_PAYLOAD_LEN, PROTOCOL_VERSION};

/// Identifies a node for the lifetime of its process.
pub type NodeId = u32;

/// Errors produced by the frame codecs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Frame shorter than its layout requires, or a field out of bounds.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Envelope carries a message type this version does not know.
    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// Envelope version nibble is not ours.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
}

impl ErrorCode for WireError {
    fn code(&self) -> &'static str {
        match self {
            Self::MalformedFrame(_) => "malformed_frame",
            Self::UnknownMessageType(_) => "unknown_message_type",
            Self::UnsupportedVersion(_) => "unsupported_version",
        }
    }
}

/// Control-envelope message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Server → client: 8-byte ASCII nonce.
    AuthChallenge = 0x01,
    /// Client → server: truncated digest plus node id.
    AuthResponse = 0x02,
    /// Server → client: 0x01 accepted, 0x00 rejected.
    AuthResult = 0x03,
    /// Client → server: opens the handshake, empty payload.
    ClientHello = 0x04,
    /// Root-originated topology beacon, relayed hop by hop.
    Heartbeat = 0x10,
    /// Point-to-point keepalive, never relayed.
    Ping = 0xA0,
}

impl MessageType {
    /// Maps a wire byte back to a message type.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::AuthChallenge),
            0x02 => Some(Self::AuthResponse),
            0x03 => Some(Self::AuthResult),
            0x04 => Some(Self::ClientHello),
            0x10 => Some(Self::Heartbeat),
            0xA0 => Some(Self::Ping),
            _ => None,
        }
    }
}

/// Encodes a control envelope around `payload`.
#[must_use]
pub fn encode_control(message_type: MessageType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + payload.len());
    buf.put_u8(PROTOCOL_VERSION << 4);
    buf.put_u8(message_type as u8);
    buf.put_slice(payload);
    buf.freeze()
}

/// Decodes a control envelope, returning the message type and payload slice.
pub fn decode_control(frame: &[u8]) -> Result<(MessageType, &[u8]), WireError> {
    if frame.len() < 2 {
        return Err(WireError::MalformedFrame("control envelope under 2 bytes"));
    }
    let version = frame[0] >> 4;
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let message_type =
        MessageType::from_byte(frame[1]).ok_or(WireError::UnknownMessageType(frame[1]))?;
    Ok((message_type, &frame[2..]))
}

/// A topology beacon: who the root is, how fresh, and how far away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// Node id of the believed root.
    pub network_id: NodeId,
    /// Root's monotone emission counter.
    pub sequence: i32,
    /// Hops the beacon has traveled from the root.
    pub hops: u8,
}

/// Encodes the 9-byte heartbeat payload.
#[must_use]
pub fn encode_heartbeat(hb: &Heartbeat) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEARTBEAT_PAYLOAD_LEN);
    buf.put_u32_le(hb.network_id);
    buf.put_i32_le(hb.sequence);
    buf.put_u8(hb.hops);
    buf.freeze()
}

/// Decodes the 9-byte heartbeat payload.
pub fn decode_heartbeat(payload: &[u8]) -> Result<Heartbeat, WireError> {
    if payload.len() != HEARTBEAT_PAYLOAD_LEN {
        return Err(WireError::MalformedFrame("heartbeat payload is 9 bytes"));
    }
    Ok(Heartbeat {
        network_id: u32::from_le_bytes(payload[0..4].try_into().expect("length checked")),
        sequence: i32::from_le_bytes(payload[4..8].try_into().expect("length checked")),
        hops: payload[8],
    })
}

/// Convenience: heartbeat wrapped in its control envelope, ready to send.
#[must_use]
pub fn encode_heartbeat_frame(hb: &Heartbeat) -> Bytes {
    encode_control(MessageType::Heartbeat, &encode_heartbeat(hb))
}

/// Convenience: the ping frame (empty payload).
#[must_use]
pub fn encode_ping_frame() -> Bytes {
    encode_control(MessageType::Ping, &[])
}
