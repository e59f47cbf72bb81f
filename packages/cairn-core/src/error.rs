//! Centralized error types for the Cairn core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to machine-readable codes for embedding UIs
//! - Fixes the propagation policy: link-scoped errors recover by
//!   disconnecting that link; platform-scoped errors surface through the
//!   controller's public API

use std::time::Duration;

use thiserror::Error;

use crate::link::LinkError;
use crate::wire::{NodeId, WireError};

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for UI surfaces.
    fn code(&self) -> &'static str;
}

impl ErrorCode for LinkError {
    fn code(&self) -> &'static str {
        match self {
            Self::CapabilityUnavailable(_) => "capability_unavailable",
            Self::ConnectFailed(_) => "connect_failed",
            Self::ConnectTimeout => "connect_timeout",
            Self::LinkClosed => "link_closed",
            Self::OperationStalled => "operation_stalled",
        }
    }
}

/// Application-wide error type for the mesh core.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Platform lacks the link layer (radio off, advertising unsupported).
    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Codec rejected inbound bytes. Dropped without disconnecting.
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] WireError),

    /// Handshake digest mismatch.
    #[error("Authentication failed")]
    AuthFailed,

    /// Connect did not authenticate within `PEER_CONNECT_TIMEOUT`.
    #[error("Connect timed out: {0}")]
    ConnectTimeout(String),

    /// A single GATT operation exceeded `BLE_OPERATION_TIMEOUT`.
    #[error("Operation stalled on link to {0:#010x}")]
    OperationStalled(NodeId),

    /// Nothing heard from a peer within `PEER_CONNECT_TIMEOUT`.
    #[error("Peer {0:#010x} timed out")]
    PeerTimeout(NodeId),

    /// Scan-start budget exhausted; scanning resumes when the window drains.
    #[error("Scan rate limited, retry in {retry_after:?}")]
    ScanRateLimited {
        /// Time until the oldest start leaves the sliding window.
        retry_after: Duration,
    },

    /// No authentication completed within `GROUP_JOIN_TIMEOUT`.
    ///
    /// The display string is the exact text surfaced to the caller.
    #[error("Connection Timed Out")]
    JoinTimedOut,

    /// Public API called in a state that does not accept it.
    #[error("Invalid state for {0}")]
    InvalidState(&'static str),

    /// Failure reported by the link driver.
    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

impl MeshError {
    /// Returns a machine-readable error code for UI surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapabilityUnavailable(_) => "capability_unavailable",
            Self::MalformedFrame(_) => "malformed_frame",
            Self::AuthFailed => "auth_failed",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::OperationStalled(_) => "operation_stalled",
            Self::PeerTimeout(_) => "peer_timeout",
            Self::ScanRateLimited { .. } => "scan_rate_limited",
            Self::JoinTimedOut => "join_timed_out",
            Self::InvalidState(_) => "invalid_state",
            Self::Link(_) => "link_error",
        }
    }
}

impl ErrorCode for MeshError {
    fn code(&self) -> &'static str {
        MeshError::code(self)
    }
}

/// Convenient Result alias for mesh-wide operations.
pub type MeshResult<T> = Result<T, MeshError>;
