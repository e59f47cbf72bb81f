//! Challenge-response handshake.
//!
//! The access code is never transmitted. The side that dialed the link is
//! the client; the accepting side challenges it with a one-shot nonce and
//! verifies `SHA-256(accessCode ∥ nonce ∥ decimal(nodeId))`, truncated to
//! the 12 bytes the minimum MTU leaves room for. Each side advances an
//! explicit per-link phase machine; there are no nested callbacks.

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::protocol_constants::{NONCE_LEN, RESPONSE_HASH_LEN, RESPONSE_PAYLOAD_LEN};
use crate::wire::NodeId;

/// Handshake result byte: accepted.
pub const AUTH_ACCEPTED: u8 = 0x01;

/// Handshake result byte: rejected.
pub const AUTH_REJECTED: u8 = 0x00;

/// Per-link handshake progress.
///
/// Servers walk `AwaitHello → AwaitResponse`; clients walk
/// `AwaitChallenge → AwaitResult`. Both end in `Authenticated` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Server: waiting for the client's `CLIENT_HELLO`.
    AwaitHello,
    /// Client: hello sent, waiting for the nonce.
    AwaitChallenge,
    /// Server: nonce sent, waiting for the digest.
    AwaitResponse,
    /// Client: digest sent, waiting for the verdict.
    AwaitResult,
    /// Link is authenticated; data may flow.
    Authenticated,
    /// Handshake failed; the link is being torn down.
    Failed,
}

/// Computes the truncated handshake digest.
fn response_hash(access_code: &str, nonce: &[u8], node_id: NodeId) -> [u8; RESPONSE_HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(access_code.as_bytes());
    hasher.update(nonce);
    hasher.update(node_id.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut hash = [0u8; RESPONSE_HASH_LEN];
    hash.copy_from_slice(&digest[..RESPONSE_HASH_LEN]);
    hash
}

/// Builds the 16-byte `AUTH_RESPONSE` payload: `hash (12) | nodeId (4 LE)`.
#[must_use]
pub fn generate_response(access_code: &str, nonce: &[u8], node_id: NodeId) -> [u8; RESPONSE_PAYLOAD_LEN] {
    let mut payload = [0u8; RESPONSE_PAYLOAD_LEN];
    payload[..RESPONSE_HASH_LEN].copy_from_slice(&response_hash(access_code, nonce, node_id));
    payload[RESPONSE_HASH_LEN..].copy_from_slice(&node_id.to_le_bytes());
    payload
}

/// Verifies an `AUTH_RESPONSE` payload against the expected credentials.
///
/// Returns the claiming node id on a matching digest, `None` on any length
/// or digest mismatch.
#[must_use]
pub fn verify_response(access_code: &str, nonce: &[u8], payload: &[u8]) -> Option<NodeId> {
    if payload.len() != RESPONSE_PAYLOAD_LEN {
        return None;
    }
    let node_id = u32::from_le_bytes(payload[RESPONSE_HASH_LEN..].try_into().expect("length checked"));
    let expected = response_hash(access_code, nonce, node_id);
    if payload[..RESPONSE_HASH_LEN] == expected {
        Some(node_id)
    } else {
        None
    }
}

/// One-shot nonce storage keyed by link address.
///
/// A nonce is consumed by the first `AUTH_RESPONSE` processed for its link;
/// a replayed second response finds nothing and is ignored.
#[derive(Default)]
pub struct NonceStore {
    nonces: DashMap<String, [u8; NONCE_LEN]>,
}

impl NonceStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh nonce for `link_address`, replacing any previous one.
    pub fn issue(&self, link_address: &str) -> [u8; NONCE_LEN] {
        let nonce = crate::utils::random_nonce();
        self.nonces.insert(link_address.to_string(), nonce);
        nonce
    }

    /// Takes the nonce for `link_address`, removing it from the store.
    pub fn take(&self, link_address: &str) -> Option<[u8; NONCE_LEN]> {
        self.nonces.remove(link_address).map(|(_, nonce)| nonce)
    }

    /// Drops any nonce issued for `link_address` (link closed mid-handshake).
    pub fn forget(&self, link_address: &str) {
        self.nonces.remove(link_address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODE: &str = "4829";
    const NONCE: &[u8] = b"a1b2c3d4";

    #[test]
    fn response_is_deterministic() {
        let a = generate_response(CODE, NONCE, 0x0000_0002);
        let b = generate_response(CODE, NONCE, 0x0000_0002);
        assert_eq!(a, b);
    }

    #[test]
    fn verify_accepts_own_response() {
        let payload = generate_response(CODE, NONCE, 0xCAFE_F00D);
        assert_eq!(verify_response(CODE, NONCE, &payload), Some(0xCAFE_F00D));
    }

    #[test]
    fn verify_rejects_wrong_code() {
        let payload = generate_response("0000", NONCE, 3);
        assert_eq!(verify_response(CODE, NONCE, &payload), None);
    }

    #[test]
    fn verify_rejects_wrong_nonce() {
        let payload = generate_response(CODE, b"zzzzzzzz", 3);
        assert_eq!(verify_response(CODE, NONCE, &payload), None);
    }

    #[test]
    fn verify_rejects_tampered_node_id() {
        let mut payload = generate_response(CODE, NONCE, 3);
        payload[RESPONSE_HASH_LEN] ^= 0xFF;
        assert_eq!(verify_response(CODE, NONCE, &payload), None);
    }

    #[test]
    fn verify_rejects_bad_length() {
        assert_eq!(verify_response(CODE, NONCE, &[0u8; 15]), None);
        assert_eq!(verify_response(CODE, NONCE, &[0u8; 17]), None);
    }

    #[test]
    fn payload_layout_is_hash_then_le_node_id() {
        let payload = generate_response(CODE, NONCE, 0x0102_0304);
        assert_eq!(payload.len(), 16);
        assert_eq!(&payload[RESPONSE_HASH_LEN..], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn nonce_is_one_shot() {
        let store = NonceStore::new();
        let issued = store.issue("AA:BB");
        assert_eq!(store.take("AA:BB"), Some(issued));
        assert_eq!(store.take("AA:BB"), None);
    }

    #[test]
    fn reissue_replaces_previous_nonce() {
        let store = NonceStore::new();
        let first = store.issue("AA:BB");
        let second = store.issue("AA:BB");
        // Extremely unlikely to collide; the point is `take` sees the latest.
        let taken = store.take("AA:BB").unwrap();
        assert_eq!(taken, second);
        if first != second {
            assert_ne!(taken, first);
        }
    }
}
