//! Audio Engine capability.
//!
//! The codec, jitter buffer, and OS audio routing live behind this trait;
//! the core only pushes received voice frames in and wires the engine's
//! outbound frames into [`crate::mesh::MeshController::broadcast_audio`].

use bytes::Bytes;

/// Opaque push-to-talk audio engine.
pub trait AudioEngine: Send + Sync {
    /// Brings the engine up (decoder, jitter buffer, speaker route).
    fn start(&self);

    /// Tears the engine down.
    fn stop(&self);

    /// Opens or mutes the microphone (push-to-talk).
    fn set_mic_enabled(&self, enabled: bool);

    /// Delivers one received voice frame for decode and playout.
    fn push_incoming_packet(&self, frame: Bytes);
}

/// No-op engine for headless embeddings and tests.
pub struct NoopAudioEngine;

impl AudioEngine for NoopAudioEngine {
    fn start(&self) {
        // No-op
    }

    fn stop(&self) {
        // No-op
    }

    fn set_mic_enabled(&self, _enabled: bool) {
        // No-op
    }

    fn push_incoming_packet(&self, _frame: Bytes) {
        // No-op
    }
}
