//! Seen-packet cache for flood deduplication.
//!
//! Every flooded frame is fingerprinted by content; a fingerprint is
//! accepted once per [`MeshConfig::packet_cache_timeout`] window. Locally
//! originated frames are pre-marked before transmission so reflections from
//! neighbors are dropped on arrival.

use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Computes the stable 32-bit content fingerprint of a frame.
#[must_use]
pub fn fingerprint(frame: &[u8]) -> u32 {
    let digest = Sha256::digest(frame);
    u32::from_le_bytes(digest[..4].try_into().expect("digest is 32 bytes"))
}

/// Bounded, time-windowed set of packet fingerprints.
///
/// Entries are write-once until the sweep evicts them; concurrent callers
/// race on the map entry, and exactly one wins the insert.
pub struct SeenPacketCache {
    entries: DashMap<u32, Instant>,
    ttl: Duration,
}

impl SeenPacketCache {
    /// Creates a cache whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Marks a frame as seen. Returns `true` iff the fingerprint was newly
    /// inserted (the frame should be processed and relayed).
    pub fn mark(&self, frame: &[u8]) -> bool {
        let mut fresh = false;
        self.entries
            .entry(fingerprint(frame))
            .or_insert_with(|| {
                fresh = true;
                Instant::now()
            });
        fresh
    }

    /// Removes entries older than the cache TTL.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);
    }

    /// Number of live fingerprints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no fingerprints are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
