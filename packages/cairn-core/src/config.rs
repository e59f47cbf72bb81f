//! Mesh configuration.
//!
//! Every timeout and budget the core uses is enumerated here, defaulted from
//! [`crate::protocol_constants`]. Embeddings override fields for tests and
//! simulations; production nodes run the defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol_constants::{
    AUDIO_STARVATION_THRESHOLD, BLE_OPERATION_TIMEOUT, CLEANUP_PERIOD,
    GROUP_ADVERTISEMENT_TIMEOUT, GROUP_JOIN_TIMEOUT, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT,
    MAX_AUDIO_QUEUE_CAPACITY, MAX_PEERS, PACKET_CACHE_TIMEOUT, PEER_CONNECT_TIMEOUT,
    SCAN_STARTS_PER_WINDOW, SCAN_WINDOW, TARGET_PEERS,
};

/// Tunable knobs of the mesh core.
///
/// All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    // Connection budget
    /// Peer count at which the connect policy stops seeking links.
    pub target_peers: usize,
    /// Absolute peer budget; headroom above target is reserved for merges.
    pub max_peers: usize,

    // Topology
    /// Interval between root heartbeat emissions.
    pub heartbeat_interval: Duration,
    /// Root silence tolerated before a non-root downgrades.
    pub heartbeat_timeout: Duration,

    // Liveness
    /// Bound on connect-to-authenticated and on per-peer frame silence.
    pub peer_connect_timeout: Duration,
    /// Period of the liveness and cache sweeps.
    pub cleanup_period: Duration,

    // Discovery
    /// Silence after which a discovered group is evicted.
    pub group_advertisement_timeout: Duration,
    /// Wall-clock deadline for a join attempt.
    pub group_join_timeout: Duration,

    // Flood
    /// Lifetime of a fingerprint in the seen-packet cache.
    pub packet_cache_timeout: Duration,

    // Per-link operation queue
    /// Audio lane depth; overflow head-drops the oldest frame.
    pub max_audio_queue_capacity: usize,
    /// Consecutive control ops after which one audio op is forced.
    pub audio_starvation_threshold: u32,
    /// Watchdog on a single in-flight GATT operation.
    pub ble_operation_timeout: Duration,

    // Scan budget
    /// Scan starts permitted per `scan_window`.
    pub scan_starts_per_window: usize,
    /// Sliding window over which scan starts are counted.
    pub scan_window: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            target_peers: TARGET_PEERS,
            max_peers: MAX_PEERS,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            peer_connect_timeout: PEER_CONNECT_TIMEOUT,
            cleanup_period: CLEANUP_PERIOD,
            group_advertisement_timeout: GROUP_ADVERTISEMENT_TIMEOUT,
            group_join_timeout: GROUP_JOIN_TIMEOUT,
            packet_cache_timeout: PACKET_CACHE_TIMEOUT,
            max_audio_queue_capacity: MAX_AUDIO_QUEUE_CAPACITY,
            audio_starvation_threshold: AUDIO_STARVATION_THRESHOLD,
            ble_operation_timeout: BLE_OPERATION_TIMEOUT,
            scan_starts_per_window: SCAN_STARTS_PER_WINDOW,
            scan_window: SCAN_WINDOW,
        }
    }
}

impl MeshConfig {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.target_peers == 0 {
            return Err("target_peers must be >= 1".to_string());
        }
        if self.max_peers < self.target_peers {
            return Err("max_peers must be >= target_peers".to_string());
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err("heartbeat_timeout must exceed heartbeat_interval".to_string());
        }
        if self.max_audio_queue_capacity == 0 {
            return Err("max_audio_queue_capacity must be >= 1".to_string());
        }
        if self.scan_starts_per_window == 0 {
            return Err("scan_starts_per_window must be >= 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(MeshConfig::default().validate().is_ok());
    }

    #[test]
    fn max_below_target_rejected() {
        let config = MeshConfig {
            target_peers: 3,
            max_peers: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn heartbeat_timeout_must_exceed_interval() {
        let config = MeshConfig {
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
