//! Mesh controller: the single logical owner of the node.
//!
//! The controller drives Idle → Discovering → Joining → RadioActive,
//! consumes the link driver's event stream, and owns every topology and
//! peer decision. All state mutation happens under one mutex that is never
//! held across an await; I/O effects (scan, advertise, connect, broadcast)
//! run outside it. Each state owns a set of background tasks scoped to a
//! cancellation token; entering a state cancels the previous state's tasks
//! and invalidates the advertising cache.

mod groups;

pub use groups::{DiscoveredGroup, DiscoveredGroupInfo, GroupTracker};

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::audio::AudioEngine;
use crate::config::MeshConfig;
use crate::dedup::SeenPacketCache;
use crate::error::{MeshError, MeshResult};
use crate::events::{DiscoveryEvent, EventEmitter, PeerEvent, StateEvent, TopologyEvent};
use crate::link::{DataType, DiscoveredPeer, LinkDriver, LinkEvent, LinkEventReceiver};
use crate::peer::{PeerRegistry, Transport};
use crate::scan::ScanRateLimiter;
use crate::topology::{HeartbeatOutcome, TickOutcome, TopologyEngine, TopologySnapshot};
use crate::utils::now_millis;
use crate::wire::{
    decode_control, decode_heartbeat, encode_heartbeat_frame, encode_ping_frame,
    AdvertisingConfig, Heartbeat, MessageType, NodeId,
};

/// The engine's single active state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    /// Not advertising, not scanning, no transports.
    Idle,
    /// Scanning and aggregating groups; no advertising, no connecting.
    Discovering,
    /// Scanning and dialing peers of one group until the first
    /// authentication.
    Joining {
        /// Group being joined.
        group: String,
    },
    /// Full mesh participation: advertising, topology, connect policy.
    RadioActive {
        /// Group this node participates in.
        group: String,
    },
}

impl EngineState {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Discovering => "discovering",
            Self::Joining { .. } => "joining",
            Self::RadioActive { .. } => "radioActive",
        }
    }

    fn group(&self) -> Option<&str> {
        match self {
            Self::Joining { group } | Self::RadioActive { group } => Some(group),
            _ => None,
        }
    }
}

/// Serializable view of the engine state.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum EngineStateSnapshot {
    /// Nothing running.
    Idle,
    /// Scanning for groups.
    Discovering,
    /// Dialing into a group.
    #[serde(rename_all = "camelCase")]
    Joining {
        /// Group being joined.
        group: String,
    },
    /// Active in the mesh.
    #[serde(rename_all = "camelCase")]
    RadioActive {
        /// Group this node participates in.
        group: String,
        /// Connected peer count.
        peer_count: usize,
    },
}

struct Inner {
    state: EngineState,
    topology: TopologyEngine,
    groups: GroupTracker,
    last_advertising: Option<AdvertisingConfig>,
    /// Addresses with an in-flight connect attempt (one per address).
    connecting: HashSet<String>,
    /// Cancels the current state's background tasks.
    state_tasks: CancellationToken,
    /// Resolves the pending `join_group` call on first authentication.
    join_waiter: Option<oneshot::Sender<()>>,
}

/// Decides whether to dial a discovered peer while RadioActive.
///
/// Merges toward a greater network id are always taken; below the target
/// the node also absorbs available peers and inferior islands; between
/// target and max only inferior islands, keeping burst headroom for merges;
/// at max, never.
fn connect_decision(
    peer: &DiscoveredPeer,
    network_id: NodeId,
    peer_count: usize,
    target_peers: usize,
    max_peers: usize,
) -> bool {
    if peer.network_id > network_id {
        true
    } else if peer_count < target_peers {
        peer.is_available || peer.network_id < network_id
    } else if peer_count < max_peers {
        peer.network_id < network_id
    } else {
        false
    }
}

/// Top-level mesh state machine and event dispatcher.
pub struct MeshController {
    own_node_id: NodeId,
    config: MeshConfig,
    driver: Arc<dyn LinkDriver>,
    registry: Arc<PeerRegistry>,
    seen: SeenPacketCache,
    scan_limiter: ScanRateLimiter,
    audio: Arc<dyn AudioEngine>,
    emitter: Arc<dyn EventEmitter>,
    inner: Mutex<Inner>,
    /// Whether the driver's scanner is currently on.
    scanning: std::sync::atomic::AtomicBool,
    /// Root token; the event pump and every state token descend from it.
    lifetime: CancellationToken,
}

impl MeshController {
    /// Creates a controller. Fails when the config is inconsistent or the
    /// platform lacks the link capability.
    pub fn new(
        own_node_id: NodeId,
        config: MeshConfig,
        driver: Arc<dyn LinkDriver>,
        audio: Arc<dyn AudioEngine>,
        emitter: Arc<dyn EventEmitter>,
    ) -> MeshResult<Arc<Self>> {
        config
            .validate()
            .map_err(MeshError::CapabilityUnavailable)?;
        driver
            .validate_capabilities()
            .map_err(|err| MeshError::CapabilityUnavailable(err.to_string()))?;

        let lifetime = CancellationToken::new();
        Ok(Arc::new(Self {
            own_node_id,
            registry: Arc::new(PeerRegistry::new(own_node_id)),
            seen: SeenPacketCache::new(config.packet_cache_timeout),
            scan_limiter: ScanRateLimiter::new(config.scan_starts_per_window, config.scan_window),
            inner: Mutex::new(Inner {
                state: EngineState::Idle,
                topology: TopologyEngine::new(own_node_id, config.heartbeat_timeout, Instant::now()),
                groups: GroupTracker::new(),
                last_advertising: None,
                connecting: HashSet::new(),
                state_tasks: lifetime.child_token(),
                join_waiter: None,
            }),
            scanning: std::sync::atomic::AtomicBool::new(false),
            config,
            driver,
            audio,
            emitter,
            lifetime,
        }))
    }

    /// Spawns the event pump over the driver's stream.
    pub fn start(self: &Arc<Self>, mut events: LinkEventReceiver) {
        let this = Arc::clone(self);
        let lifetime = self.lifetime.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = lifetime.cancelled() => return,
                    event = events.recv() => match event {
                        None => return,
                        Some(event) => this.handle_link_event(event).await,
                    },
                }
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Public API
    // ─────────────────────────────────────────────────────────────────────

    /// This node's id.
    #[must_use]
    pub fn own_node_id(&self) -> NodeId {
        self.own_node_id
    }

    /// Connected peer count.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    /// Current engine state.
    #[must_use]
    pub fn engine_state(&self) -> EngineStateSnapshot {
        match &self.inner.lock().state {
            EngineState::Idle => EngineStateSnapshot::Idle,
            EngineState::Discovering => EngineStateSnapshot::Discovering,
            EngineState::Joining { group } => EngineStateSnapshot::Joining { group: group.clone() },
            EngineState::RadioActive { group } => EngineStateSnapshot::RadioActive {
                group: group.clone(),
                peer_count: self.registry.len(),
            },
        }
    }

    /// Current topology view.
    #[must_use]
    pub fn topology(&self) -> TopologySnapshot {
        self.inner.lock().topology.snapshot()
    }

    /// Groups heard while Discovering, strongest signal first.
    #[must_use]
    pub fn discovered_groups(&self) -> Vec<DiscoveredGroupInfo> {
        self.inner.lock().groups.snapshot(Instant::now())
    }

    /// Idle → Discovering: scan for nearby groups.
    pub async fn start_group_scan(self: &Arc<Self>) -> MeshResult<()> {
        let token = {
            let mut inner = self.inner.lock();
            if inner.state != EngineState::Idle {
                return Err(MeshError::InvalidState("start_group_scan"));
            }
            self.begin_state(&mut inner, EngineState::Discovering)
        };
        self.emit_state();
        self.spawn_scan_task(token.clone());
        self.spawn_group_sweep(token);
        Ok(())
    }

    /// Discovering → Idle.
    pub async fn stop_group_scan(self: &Arc<Self>) -> MeshResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != EngineState::Discovering {
                return Err(MeshError::InvalidState("stop_group_scan"));
            }
            self.begin_state(&mut inner, EngineState::Idle);
            inner.groups.clear();
        }
        self.driver.stop_scanning().await;
        self.scanning.store(false, std::sync::atomic::Ordering::SeqCst);
        self.emit_state();
        Ok(())
    }

    /// Idle/Discovering → Joining: dial into `group` until one peer
    /// authenticates, then RadioActive. Returns [`MeshError::JoinTimedOut`]
    /// and falls back to Idle when nothing authenticates in time.
    pub async fn join_group(self: &Arc<Self>, group: &str, access_code: &str) -> MeshResult<()> {
        self.driver.set_credentials(access_code, self.own_node_id);
        let (joined_tx, joined_rx) = oneshot::channel();
        let token = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, EngineState::Idle | EngineState::Discovering) {
                return Err(MeshError::InvalidState("join_group"));
            }
            let token = self.begin_state(
                &mut inner,
                EngineState::Joining { group: group.to_string() },
            );
            inner.groups.clear();
            inner.join_waiter = Some(joined_tx);
            token
        };
        self.emit_state();
        self.spawn_scan_task(token);

        match timeout(self.config.group_join_timeout, joined_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(MeshError::InvalidState("join aborted")),
            Err(_) => {
                log::warn!(
                    "[MeshController] Join of '{group}' timed out after {:?}",
                    self.config.group_join_timeout
                );
                self.leave().await;
                Err(MeshError::JoinTimedOut)
            }
        }
    }

    /// Idle → RadioActive as a one-node island (group creator).
    pub async fn create_group(self: &Arc<Self>, group: &str, access_code: &str) -> MeshResult<()> {
        self.driver.set_credentials(access_code, self.own_node_id);
        let token = {
            let mut inner = self.inner.lock();
            if inner.state != EngineState::Idle {
                return Err(MeshError::InvalidState("create_group"));
            }
            let token = self.begin_state(
                &mut inner,
                EngineState::RadioActive { group: group.to_string() },
            );
            inner.topology.reset(Instant::now());
            token
        };
        log::info!(
            "[MeshController] Created group '{group}' as {:#010x}",
            self.own_node_id
        );
        self.audio.start();
        self.emit_state();
        self.emit_topology();
        self.spawn_scan_task(token.clone());
        self.spawn_radio_tasks(token);
        self.refresh_advertising().await;
        Ok(())
    }

    /// Any state → Idle: tear everything down.
    pub async fn leave(self: &Arc<Self>) {
        let was_active = {
            let mut inner = self.inner.lock();
            let was_active = matches!(inner.state, EngineState::RadioActive { .. });
            self.begin_state(&mut inner, EngineState::Idle);
            inner.groups.clear();
            inner.connecting.clear();
            inner.join_waiter = None;
            was_active
        };
        if was_active {
            self.audio.set_mic_enabled(false);
            self.audio.stop();
        }
        self.driver.stop_advertising().await;
        self.driver.stop_scanning().await;
        self.scanning.store(false, std::sync::atomic::Ordering::SeqCst);
        self.registry.disconnect_all().await;
        self.driver.disconnect_all().await;
        self.emit_state();
    }

    /// Permanently shuts the controller down and releases the radio.
    pub async fn shutdown(self: &Arc<Self>) {
        self.leave().await;
        self.lifetime.cancel();
        self.driver.destroy();
    }

    /// Floods one locally captured voice frame to the mesh.
    ///
    /// The frame is pre-marked in the seen cache so reflections from
    /// neighbors are dropped.
    pub async fn broadcast_audio(&self, frame: Bytes) {
        self.seen.mark(&frame);
        self.registry.broadcast(frame, DataType::Audio, None).await;
    }

    // ─────────────────────────────────────────────────────────────────────
    // State plumbing
    // ─────────────────────────────────────────────────────────────────────

    /// Swaps states under the lock: cancels the old state's tasks, issues a
    /// fresh token, and invalidates the advertising cache.
    fn begin_state(&self, inner: &mut Inner, state: EngineState) -> CancellationToken {
        log::info!(
            "[MeshController] {} -> {}",
            inner.state.name(),
            state.name()
        );
        inner.state_tasks.cancel();
        let token = self.lifetime.child_token();
        inner.state_tasks = token.clone();
        inner.last_advertising = None;
        inner.state = state;
        token
    }

    fn emit_state(&self) {
        let (state, group) = {
            let inner = self.inner.lock();
            (inner.state.name(), inner.state.group().map(String::from))
        };
        self.emitter.emit_state(StateEvent::Changed {
            state,
            group,
            timestamp: now_millis(),
        });
    }

    fn emit_topology(&self) {
        let snapshot = self.topology();
        self.emitter.emit_topology(TopologyEvent::Changed {
            network_id: snapshot.network_id,
            hops_to_root: snapshot.hops_to_root,
            is_root: snapshot.is_root,
            timestamp: now_millis(),
        });
    }

    /// Starts (or retries) scanning under the platform's rate budget.
    ///
    /// A no-op when the scanner is already on (Joining and RadioActive
    /// inherit the previous state's scan without burning a rate slot).
    fn spawn_scan_task(self: &Arc<Self>, token: CancellationToken) {
        use std::sync::atomic::Ordering;
        if self.scanning.load(Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if this.scanning.load(Ordering::SeqCst) {
                    return;
                }
                match this.scan_limiter.try_acquire() {
                    Ok(scan_token) => match this.driver.start_scanning().await {
                        Ok(()) => {
                            this.scanning.store(true, Ordering::SeqCst);
                            return;
                        }
                        Err(err) => {
                            this.scan_limiter.rollback(scan_token);
                            log::warn!("[MeshController] Scan start failed: {err}");
                            tokio::select! {
                                _ = token.cancelled() => return,
                                _ = sleep(std::time::Duration::from_secs(1)) => {}
                            }
                        }
                    },
                    Err(retry_after) => {
                        log::debug!(
                            "[MeshController] Scan rate limited, retrying in {retry_after:?}"
                        );
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = sleep(retry_after) => {}
                        }
                    }
                }
            }
        });
    }

    /// Discovering: evict groups that fell silent.
    fn spawn_group_sweep(self: &Arc<Self>, token: CancellationToken) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(this.config.cleanup_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let expired = {
                    let mut inner = this.inner.lock();
                    inner
                        .groups
                        .sweep(this.config.group_advertisement_timeout, Instant::now())
                };
                for group_name in expired {
                    this.emitter.emit_discovery(DiscoveryEvent::GroupExpired {
                        group_name,
                        timestamp: now_millis(),
                    });
                }
            }
        });
    }

    /// RadioActive: heartbeat tick plus the liveness / cache sweep.
    fn spawn_radio_tasks(self: &Arc<Self>, token: CancellationToken) {
        let this = Arc::clone(self);
        let tick_token = token.clone();
        tokio::spawn(async move {
            let mut ticker = interval(this.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick_token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                this.on_heartbeat_tick().await;
            }
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(this.config.cleanup_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                this.on_liveness_sweep().await;
            }
        });
    }

    async fn on_heartbeat_tick(&self) {
        let outcome = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, EngineState::RadioActive { .. }) {
                return;
            }
            inner.topology.on_tick(Instant::now())
        };
        match outcome {
            TickOutcome::Emit(heartbeat) => {
                let frame = encode_heartbeat_frame(&heartbeat);
                self.seen.mark(&frame);
                self.registry.broadcast(frame, DataType::Control, None).await;
            }
            TickOutcome::Downgraded => {
                log::info!(
                    "[MeshController] Root went silent; downgraded to self-root {:#010x}",
                    self.own_node_id
                );
                self.emit_topology();
                self.refresh_advertising().await;
            }
            TickOutcome::Idle => {}
        }
    }

    async fn on_liveness_sweep(&self) {
        self.seen.sweep();

        for node_id in self.registry.idle_peers(self.config.peer_connect_timeout) {
            log::warn!(
                "[MeshController] Peer {node_id:#010x} silent past {:?}, disconnecting",
                self.config.peer_connect_timeout
            );
            if self.registry.disconnect(node_id).await {
                self.emitter.emit_peer(PeerEvent::Left {
                    node_id,
                    peer_count: self.registry.len(),
                    timestamp: now_millis(),
                });
            }
        }

        // Keepalive: any inbound frame refreshes the remote's liveness view
        // of us, so idle links on non-root nodes survive the sweep.
        if !self.registry.is_empty() {
            self.registry
                .broadcast(encode_ping_frame(), DataType::Control, None)
                .await;
        }

        self.refresh_advertising().await;
    }

    /// Rebuilds the advertising config; restarts advertising only when it
    /// differs from the last one handed to the driver.
    pub(crate) async fn refresh_advertising(&self) {
        let config = {
            let mut inner = self.inner.lock();
            let group = match &inner.state {
                EngineState::RadioActive { group } => group.clone(),
                _ => return,
            };
            let topology = inner.topology.state();
            let config = AdvertisingConfig {
                group_name: group,
                own_node_id: self.own_node_id,
                network_id: topology.network_id,
                hops_to_root: topology.hops_to_root,
                is_available: self.registry.len() < self.config.max_peers,
            };
            if inner.last_advertising.as_ref() == Some(&config) {
                return;
            }
            inner.last_advertising = Some(config.clone());
            config
        };
        if let Err(err) = self.driver.start_advertising(&config).await {
            log::warn!("[MeshController] Advertising refresh failed: {err}");
            self.inner.lock().last_advertising = None;
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Link events
    // ─────────────────────────────────────────────────────────────────────

    async fn handle_link_event(self: &Arc<Self>, event: LinkEvent) {
        match event {
            LinkEvent::PeerDiscovered(peer) => self.on_peer_discovered(peer).await,
            LinkEvent::PeerConnected { node_id, transport } => {
                self.on_peer_connected(node_id, transport).await;
            }
            LinkEvent::PeerDisconnected { node_id, link_address, link_id } => {
                self.on_peer_disconnected(node_id, &link_address, link_id).await;
            }
            LinkEvent::DataReceived { from, data, data_type } => {
                self.on_data_received(from, data, data_type).await;
            }
        }
    }

    async fn on_peer_discovered(self: &Arc<Self>, peer: DiscoveredPeer) {
        enum Action {
            None,
            Connect(CancellationToken),
        }

        let action = {
            let mut inner = self.inner.lock();
            match &inner.state {
                EngineState::Discovering => {
                    if inner.groups.observe(&peer.group_name, peer.rssi, Instant::now()) {
                        self.emitter.emit_discovery(DiscoveryEvent::GroupUpdated {
                            group_name: peer.group_name.clone(),
                            highest_rssi: peer.rssi,
                            timestamp: now_millis(),
                        });
                    }
                    Action::None
                }
                EngineState::Joining { group } => {
                    if peer.group_name == *group && self.may_dial(&inner, &peer) {
                        inner.connecting.insert(peer.link_address.clone());
                        Action::Connect(inner.state_tasks.clone())
                    } else {
                        Action::None
                    }
                }
                EngineState::RadioActive { group } => {
                    let should = peer.group_name == *group
                        && self.may_dial(&inner, &peer)
                        && connect_decision(
                            &peer,
                            inner.topology.state().network_id,
                            self.registry.len(),
                            self.config.target_peers,
                            self.config.max_peers,
                        );
                    if should {
                        inner.connecting.insert(peer.link_address.clone());
                        Action::Connect(inner.state_tasks.clone())
                    } else {
                        Action::None
                    }
                }
                EngineState::Idle => Action::None,
            }
        };

        if let Action::Connect(token) = action {
            self.spawn_connect(peer, token);
        }
    }

    /// Common preconditions for dialing: not ourselves, not connected, and
    /// at most one attempt in flight per address.
    fn may_dial(&self, inner: &Inner, peer: &DiscoveredPeer) -> bool {
        peer.node_id != self.own_node_id
            && !self.registry.contains(peer.node_id)
            && !inner.connecting.contains(&peer.link_address)
    }

    fn spawn_connect(self: &Arc<Self>, peer: DiscoveredPeer, token: CancellationToken) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            log::debug!(
                "[MeshController] Dialing {:#010x} at {} (network {:#010x})",
                peer.node_id,
                peer.link_address,
                peer.network_id
            );
            tokio::select! {
                _ = token.cancelled() => {}
                result = this.driver.connect_to(&peer.link_address, peer.node_id) => {
                    if let Err(err) = result {
                        log::info!(
                            "[MeshController] Connect to {} failed: {err}",
                            peer.link_address
                        );
                    }
                }
            }
            this.inner.lock().connecting.remove(&peer.link_address);
        });
    }

    async fn on_peer_connected(self: &Arc<Self>, node_id: NodeId, transport: Arc<dyn Transport>) {
        let reject = node_id == self.own_node_id || {
            let inner = self.inner.lock();
            matches!(inner.state, EngineState::Idle | EngineState::Discovering)
        };
        if reject {
            // Self-connections and stragglers that authenticated after a
            // leave or join timeout hold no place here.
            transport.disconnect().await;
            return;
        }
        let outcome = self.registry.register(node_id, transport).await;
        log::info!(
            "[MeshController] Peer {node_id:#010x} connected ({outcome:?}), {} total",
            self.registry.len()
        );
        if outcome.is_new_peer() {
            self.emitter.emit_peer(PeerEvent::Joined {
                node_id,
                peer_count: self.registry.len(),
                timestamp: now_millis(),
            });
        }

        // First authentication while Joining promotes to RadioActive.
        let promoted = {
            let mut inner = self.inner.lock();
            if let EngineState::Joining { group } = inner.state.clone() {
                let token = self.begin_state(&mut inner, EngineState::RadioActive { group });
                inner.topology.reset(Instant::now());
                if let Some(waiter) = inner.join_waiter.take() {
                    let _ = waiter.send(());
                }
                Some(token)
            } else {
                None
            }
        };
        if let Some(token) = promoted {
            self.audio.start();
            self.emit_state();
            self.emit_topology();
            self.spawn_radio_tasks(token);
        }
        self.refresh_advertising().await;
    }

    async fn on_peer_disconnected(self: &Arc<Self>, node_id: NodeId, link_address: &str, link_id: u64) {
        // Only evict when the dropped link is the peer's current transport;
        // a stale event from a replaced link must not kill the live one.
        match self.registry.unregister_link(link_address, link_id) {
            Some(evicted) => {
                log::info!(
                    "[MeshController] Peer {evicted:#010x} disconnected, {} total",
                    self.registry.len()
                );
                self.emitter.emit_peer(PeerEvent::Left {
                    node_id: evicted,
                    peer_count: self.registry.len(),
                    timestamp: now_millis(),
                });
                self.refresh_advertising().await;
            }
            None => {
                log::debug!(
                    "[MeshController] Stale disconnect for {node_id:#010x} at {link_address} ignored"
                );
            }
        }
    }

    async fn on_data_received(self: &Arc<Self>, from: NodeId, data: Bytes, data_type: DataType) {
        self.registry.touch(from);
        match data_type {
            DataType::Audio => self.on_audio_frame(from, data).await,
            DataType::Control => match decode_control(&data) {
                Ok((MessageType::Ping, _)) => {
                    // Keepalive; the touch above is the whole effect.
                }
                Ok((MessageType::Heartbeat, payload)) => {
                    let payload = payload.to_vec();
                    self.on_heartbeat_frame(from, &data, &payload).await;
                }
                Ok((message_type, _)) => {
                    log::debug!(
                        "[MeshController] Unexpected {message_type:?} on authenticated link, dropping"
                    );
                }
                Err(err) => {
                    log::debug!("[MeshController] Dropping malformed control frame: {err}");
                }
            },
        }
    }

    async fn on_heartbeat_frame(self: &Arc<Self>, from: NodeId, frame: &Bytes, payload: &[u8]) {
        if !self.seen.mark(frame) {
            return;
        }
        let heartbeat = match decode_heartbeat(payload) {
            Ok(heartbeat) => heartbeat,
            Err(err) => {
                log::debug!("[MeshController] Dropping malformed heartbeat: {err}");
                return;
            }
        };
        let outcome = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, EngineState::RadioActive { .. }) {
                return;
            }
            inner.topology.on_heartbeat(&heartbeat, Instant::now())
        };
        if outcome == HeartbeatOutcome::Changed {
            // Relay one hop further out, skipping whoever delivered it.
            let relay = encode_heartbeat_frame(&Heartbeat {
                network_id: heartbeat.network_id,
                sequence: heartbeat.sequence,
                hops: heartbeat.hops.saturating_add(1),
            });
            self.seen.mark(&relay);
            self.registry
                .broadcast(relay, DataType::Control, Some(from))
                .await;
            self.emit_topology();
            self.refresh_advertising().await;
        }
    }

    async fn on_audio_frame(&self, from: NodeId, data: Bytes) {
        if !self.seen.mark(&data) {
            return;
        }
        self.audio.push_incoming_packet(data.clone());
        self.registry.broadcast(data, DataType::Audio, Some(from)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::NoopAudioEngine;
    use crate::events::NoopEventEmitter;
    use crate::link::LinkError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn peer(network_id: NodeId, is_available: bool) -> DiscoveredPeer {
        DiscoveredPeer {
            link_address: "AA".into(),
            group_name: "Hike".into(),
            rssi: -60,
            node_id: 42,
            network_id,
            hops_to_root: 1,
            is_available,
        }
    }

    #[test]
    fn merge_is_always_preferred() {
        // Even a full node dials a superior island.
        assert!(connect_decision(&peer(10, false), 9, 5, 3, 5));
    }

    #[test]
    fn below_target_takes_available_or_inferior() {
        assert!(connect_decision(&peer(9, true), 9, 2, 3, 5));
        assert!(connect_decision(&peer(7, false), 9, 2, 3, 5));
        assert!(!connect_decision(&peer(9, false), 9, 2, 3, 5));
    }

    #[test]
    fn between_target_and_max_only_inferior_islands() {
        assert!(!connect_decision(&peer(9, true), 9, 3, 3, 5));
        assert!(connect_decision(&peer(7, true), 9, 3, 3, 5));
        assert!(connect_decision(&peer(7, false), 9, 4, 3, 5));
    }

    #[test]
    fn at_max_never_connects() {
        assert!(!connect_decision(&peer(7, true), 9, 5, 3, 5));
        assert!(!connect_decision(&peer(9, true), 9, 5, 3, 5));
    }

    /// Driver stub that counts advertising restarts.
    struct CountingDriver {
        advertising_starts: AtomicUsize,
    }

    #[async_trait]
    impl LinkDriver for CountingDriver {
        fn validate_capabilities(&self) -> Result<(), LinkError> {
            Ok(())
        }

        fn set_credentials(&self, _access_code: &str, _own_node_id: NodeId) {}

        async fn start_scanning(&self) -> Result<(), LinkError> {
            Ok(())
        }

        async fn stop_scanning(&self) {}

        async fn start_advertising(&self, _config: &AdvertisingConfig) -> Result<(), LinkError> {
            self.advertising_starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_advertising(&self) {}

        async fn connect_to(&self, _link_address: &str, _node_id: NodeId) -> Result<(), LinkError> {
            Ok(())
        }

        async fn disconnect_all(&self) {}

        fn destroy(&self) {}
    }

    #[tokio::test]
    async fn equal_advertising_config_is_suppressed() {
        let driver = Arc::new(CountingDriver { advertising_starts: AtomicUsize::new(0) });
        let controller = MeshController::new(
            7,
            MeshConfig::default(),
            Arc::clone(&driver) as Arc<dyn LinkDriver>,
            Arc::new(NoopAudioEngine),
            Arc::new(NoopEventEmitter),
        )
        .unwrap();
        let (_tx, rx) = mpsc::channel(8);
        controller.start(rx);

        controller.create_group("Hike", "4829").await.unwrap();
        let after_create = driver.advertising_starts.load(Ordering::SeqCst);
        assert_eq!(after_create, 1);

        // Nothing changed: repeated refreshes must not restart advertising.
        controller.refresh_advertising().await;
        controller.refresh_advertising().await;
        assert_eq!(driver.advertising_starts.load(Ordering::SeqCst), 1);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn create_requires_idle() {
        let driver = Arc::new(CountingDriver { advertising_starts: AtomicUsize::new(0) });
        let controller = MeshController::new(
            7,
            MeshConfig::default(),
            driver as Arc<dyn LinkDriver>,
            Arc::new(NoopAudioEngine),
            Arc::new(NoopEventEmitter),
        )
        .unwrap();
        let (_tx, rx) = mpsc::channel(8);
        controller.start(rx);

        controller.create_group("Hike", "4829").await.unwrap();
        assert!(matches!(
            controller.create_group("Hike", "4829").await,
            Err(MeshError::InvalidState(_))
        ));
        controller.shutdown().await;
    }
}
