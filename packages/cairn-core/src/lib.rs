//! Cairn Core - shared library for Cairn.
//!
//! This crate provides the core functionality for Cairn, an offline
//! peer-to-peer voice radio over Bluetooth Low Energy. It is designed to be
//! used by mobile embeddings (which supply a real BLE link driver and an
//! audio engine) and by the headless simulator.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`mesh`]: The controller state machine, connect policy, and flood relay
//! - [`topology`]: Root election, island merge, and downgrade
//! - [`peer`]: Peer registry, transport strategies, per-link op queue
//! - [`link`]: Link Driver capability (and the in-process memory driver)
//! - [`auth`]: Challenge-response handshake
//! - [`wire`]: Advertising and control-frame codecs
//! - [`dedup`]: Seen-packet cache for flood dedup
//! - [`scan`]: Scan-start rate limiting
//! - [`events`]: Event surface for embedders
//! - [`error`]: Centralized error types
//!
//! # Abstraction Traits
//!
//! The crate defines traits to decouple the core from platform specifics:
//!
//! - [`LinkDriver`](link::LinkDriver): the radio (scan/advertise/GATT)
//! - [`AudioEngine`](audio::AudioEngine): codec, jitter buffer, routing
//! - [`EventEmitter`](events::EventEmitter): delivering events to a UI
//!
//! The in-process [`MemoryHub`](link::memory::MemoryHub) implements the
//! link capability for tests and simulations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod audio;
pub mod auth;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod link;
pub mod mesh;
pub mod peer;
pub mod protocol_constants;
pub mod scan;
pub mod topology;
pub mod utils;
pub mod wire;

// Re-export commonly used types at the crate root
pub use audio::{AudioEngine, NoopAudioEngine};
pub use config::MeshConfig;
pub use error::{ErrorCode, MeshError, MeshResult};
pub use events::{
    DiscoveryEvent, EventEmitter, LoggingEventEmitter, MeshEvent, NoopEventEmitter, PeerEvent,
    StateEvent, TopologyEvent,
};
pub use link::{DataType, DiscoveredPeer, LinkDriver, LinkError, LinkEvent};
pub use mesh::{DiscoveredGroupInfo, EngineState, EngineStateSnapshot, MeshController};
pub use topology::{TopologyEngine, TopologySnapshot};
pub use utils::{now_millis, random_node_id};
pub use wire::{AdvertisingConfig, Heartbeat, NodeId};

// Re-export the in-process driver for simulations and tests
pub use link::memory::{MemoryHub, MemoryLinkDriver};
