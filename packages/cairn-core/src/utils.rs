//! General utilities shared across the crate.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::protocol_constants::NONCE_LEN;
use crate::wire::NodeId;

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ─────────────────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Draws a fresh random node id for this process run.
///
/// Zero is excluded so an all-zero advertisement can never alias a live node.
#[must_use]
pub fn random_node_id() -> NodeId {
    loop {
        let id: NodeId = rand::thread_rng().gen();
        if id != 0 {
            return id;
        }
    }
}

/// Generates an 8-byte ASCII alphanumeric challenge nonce.
#[must_use]
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut rng = rand::thread_rng();
    let mut nonce = [0u8; NONCE_LEN];
    for byte in &mut nonce {
        *byte = rng.sample(rand::distributions::Alphanumeric);
    }
    nonce
}
