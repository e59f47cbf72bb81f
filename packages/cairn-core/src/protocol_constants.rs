//! Fixed protocol constants that should NOT be changed.
//!
//! These values are pinned by the Cairn wire format and by BLE platform
//! limits; changing them breaks interoperability with deployed nodes.
//! Tunable knobs live in [`crate::config::MeshConfig`] and merely default
//! to the values in the tuning section below.

use std::time::Duration;

use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// GATT Surface
// ─────────────────────────────────────────────────────────────────────────────

/// Service UUID under which both discovery packets and characteristics live.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xb5e764d4_4a06_4c96_8c25_f378ccf9c8e1);

/// Control characteristic (Write + Notify). Carries control envelopes:
/// handshake, heartbeats, pings.
pub const CONTROL_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xb5e764d5_4a06_4c96_8c25_f378ccf9c8e1);

/// Audio characteristic (WriteNoResponse + Notify). Carries raw voice frames.
pub const AUDIO_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xb5e764d6_4a06_4c96_8c25_f378ccf9c8e1);

/// Client Characteristic Configuration descriptor used to enable notifications.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Manufacturer id carried in the scan-response data block.
///
/// 0xFFFF is the Bluetooth SIG "reserved for internal use" company id.
pub const MANUFACTURER_ID: u16 = 0xFFFF;

// ─────────────────────────────────────────────────────────────────────────────
// MTU Budget
// ─────────────────────────────────────────────────────────────────────────────

/// Default ATT MTU before negotiation.
///
/// The handshake response (16 B) plus the control envelope (2 B) must fit
/// here, so authentication completes before any MTU upgrade.
pub const DEFAULT_ATT_MTU: usize = 23;

/// MTU requested by the client after connection, sized for voice frames.
pub const NEGOTIATED_MTU: usize = 512;

// ─────────────────────────────────────────────────────────────────────────────
// Wire Format
// ─────────────────────────────────────────────────────────────────────────────

/// Protocol version carried in the high nibble of the envelope flags byte.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum UTF-8 byte length of a group name in the scan response.
pub const MAX_GROUP_NAME_BYTES: usize = 20;

/// Byte length of the advertising service-data payload.
pub const ADV_SERVICE_DATA_LEN: usize = 10;

/// Byte length of the heartbeat payload.
pub const HEARTBEAT_PAYLOAD_LEN: usize = 9;

/// Byte length of the server challenge nonce (ASCII).
pub const NONCE_LEN: usize = 8;

/// Truncated SHA-256 width in the handshake response.
///
/// 12 bytes is what the 23-byte minimum MTU leaves after the envelope and
/// the trailing node id.
pub const RESPONSE_HASH_LEN: usize = 12;

/// Total handshake response payload length: hash plus node id.
pub const RESPONSE_PAYLOAD_LEN: usize = RESPONSE_HASH_LEN + 4;

// ─────────────────────────────────────────────────────────────────────────────
// Tuning Defaults (see MeshConfig)
// ─────────────────────────────────────────────────────────────────────────────

/// Peer count at which the connect policy stops seeking new links.
pub const TARGET_PEERS: usize = 3;

/// Absolute peer budget; the headroom above target is reserved for merges.
pub const MAX_PEERS: usize = 5;

/// Interval between root heartbeat emissions.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Root silence tolerated before a non-root downgrades to self-root.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(6);

/// Bound on connect-to-authenticated, and on per-peer frame silence.
pub const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifetime of a seen-packet fingerprint in the flood cache.
pub const PACKET_CACHE_TIMEOUT: Duration = Duration::from_secs(4);

/// Silence after which a discovered group is evicted from the scan list.
pub const GROUP_ADVERTISEMENT_TIMEOUT: Duration = Duration::from_secs(4);

/// Wall-clock deadline for a join attempt to produce one authenticated peer.
pub const GROUP_JOIN_TIMEOUT: Duration = Duration::from_secs(8);

/// Period of the liveness / cache sweeps.
pub const CLEANUP_PERIOD: Duration = Duration::from_secs(2);

/// Audio lane depth of the per-link operation queue.
///
/// Voice frames are ~20 ms each, so 5 frames is ~100 ms of backlog; beyond
/// that, freshness beats completeness and the oldest frame is dropped.
pub const MAX_AUDIO_QUEUE_CAPACITY: usize = 5;

/// Consecutive control ops after which one waiting audio op is forced.
pub const AUDIO_STARVATION_THRESHOLD: u32 = 8;

/// Watchdog on a single in-flight GATT operation.
pub const BLE_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Scan starts permitted per [`SCAN_WINDOW`] (platform budget).
pub const SCAN_STARTS_PER_WINDOW: usize = 5;

/// Sliding window over which scan starts are counted.
pub const SCAN_WINDOW: Duration = Duration::from_secs(30);
