//! In-process link driver.
//!
//! A [`MemoryHub`] plays the role of the radio medium for any number of
//! nodes in one process: advertising fans out to scanners on a fixed
//! cadence, connects run the real challenge-response handshake over paired
//! channels, and simultaneous dials produce two genuine links for the
//! registry to collapse. Integration tests and the headless simulator run
//! entire meshes on it; nothing in the core knows it is not a radio.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

use super::{
    DataType, DiscoveredPeer, LinkDriver, LinkError, LinkEvent, LinkEventReceiver,
    LinkEventSender, LINK_EVENT_CHANNEL_CAPACITY,
};
use crate::auth::{self, NonceStore, AUTH_ACCEPTED, AUTH_REJECTED};
use crate::config::MeshConfig;
use crate::peer::{
    OpExecutor, OpQueueConfig, OperationQueue, Transport, TransportKind,
};
use crate::wire::{
    advertised_group_name, decode_control, encode_control, AdvertisingConfig, MessageType, NodeId,
};

/// Cadence at which an advertising node is re-delivered to scanners.
const ADVERTISE_INTERVAL: Duration = Duration::from_millis(500);

/// Frame channel depth of one simulated link direction.
const LINK_CHANNEL_CAPACITY: usize = 64;

struct Credentials {
    access_code: String,
    node_id: NodeId,
}

/// One attached node on the hub.
struct MemoryNode {
    address: String,
    events: LinkEventSender,
    scanning: AtomicBool,
    destroyed: AtomicBool,
    /// Radio-range partition; nodes only hear peers in the same partition.
    partition: AtomicU32,
    advertising: Mutex<Option<AdvertisingConfig>>,
    adv_cancel: Mutex<Option<CancellationToken>>,
    credentials: RwLock<Option<Credentials>>,
    /// Server-side challenge nonces, keyed by dialer address.
    nonces: NonceStore,
    /// Live endpoints by link id, for `disconnect_all` / `destroy`.
    endpoints: DashMap<u64, CancellationToken>,
}

impl MemoryNode {
    fn is_listening(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst)
    }

    fn in_range_of(&self, other: &MemoryNode) -> bool {
        self.partition.load(Ordering::SeqCst) == other.partition.load(Ordering::SeqCst)
    }
}

/// The shared in-process medium.
pub struct MemoryHub {
    config: MeshConfig,
    nodes: DashMap<String, Arc<MemoryNode>>,
    next_link_id: AtomicU64,
    /// RSSI reported for every delivered advertisement (dBm).
    rssi: i16,
}

impl MemoryHub {
    /// Creates a hub; all attached nodes share `config`'s link tunables.
    #[must_use]
    pub fn new(config: MeshConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            nodes: DashMap::new(),
            next_link_id: AtomicU64::new(1),
            rssi: -60,
        })
    }

    /// Attaches a node at `address`, returning its driver and event stream.
    pub fn attach(self: &Arc<Self>, address: &str) -> (Arc<MemoryLinkDriver>, LinkEventReceiver) {
        let (events_tx, events_rx) = mpsc::channel(LINK_EVENT_CHANNEL_CAPACITY);
        let node = Arc::new(MemoryNode {
            address: address.to_string(),
            events: events_tx,
            scanning: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            partition: AtomicU32::new(0),
            advertising: Mutex::new(None),
            adv_cancel: Mutex::new(None),
            credentials: RwLock::new(None),
            nonces: NonceStore::new(),
            endpoints: DashMap::new(),
        });
        self.nodes.insert(address.to_string(), Arc::clone(&node));
        let driver = Arc::new(MemoryLinkDriver {
            hub: Arc::clone(self),
            node,
        });
        (driver, events_rx)
    }

    fn op_queue_config(&self) -> OpQueueConfig {
        OpQueueConfig {
            audio_capacity: self.config.max_audio_queue_capacity,
            starvation_threshold: self.config.audio_starvation_threshold,
            op_timeout: self.config.ble_operation_timeout,
        }
    }

    fn next_link_id(&self) -> u64 {
        self.next_link_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Moves a node into a radio-range partition.
    ///
    /// All nodes start in partition 0. Nodes hear advertisements from, and
    /// dial, only nodes in their own partition; existing links are not
    /// severed by a move. Lets tests stage disjoint islands that later meet.
    pub fn set_partition(&self, address: &str, partition: u32) {
        if let Some(node) = self.nodes.get(address) {
            node.partition.store(partition, Ordering::SeqCst);
        }
    }

    /// Delivers `advertiser`'s current advertisement to every scanner.
    fn fan_out_advertisement(&self, advertiser: &MemoryNode) {
        let Some(config) = advertiser.advertising.lock().clone() else {
            return;
        };
        let discovered = DiscoveredPeer {
            link_address: advertiser.address.clone(),
            group_name: advertised_group_name(&config.group_name).to_string(),
            rssi: self.rssi,
            node_id: config.own_node_id,
            network_id: config.network_id,
            hops_to_root: config.hops_to_root,
            is_available: config.is_available,
        };
        for entry in self.nodes.iter() {
            let scanner = entry.value();
            if scanner.address == advertiser.address
                || !scanner.scanning.load(Ordering::SeqCst)
                || !scanner.is_listening()
                || !scanner.in_range_of(advertiser)
            {
                continue;
            }
            // Lossy like the air: a full event queue just misses this beacon.
            let _ = scanner
                .events
                .try_send(LinkEvent::PeerDiscovered(discovered.clone()));
        }
    }

    /// Delivers every current advertiser to a node that just started scanning.
    fn deliver_current_advertisers(&self, scanner: &MemoryNode) {
        for entry in self.nodes.iter() {
            let advertiser = entry.value();
            if advertiser.address == scanner.address || !scanner.in_range_of(advertiser) {
                continue;
            }
            let Some(config) = advertiser.advertising.lock().clone() else {
                continue;
            };
            let _ = scanner.events.try_send(LinkEvent::PeerDiscovered(DiscoveredPeer {
                link_address: advertiser.address.clone(),
                group_name: advertised_group_name(&config.group_name).to_string(),
                rssi: self.rssi,
                node_id: config.own_node_id,
                network_id: config.network_id,
                hops_to_root: config.hops_to_root,
                is_available: config.is_available,
            }));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Links
// ─────────────────────────────────────────────────────────────────────────────

type FrameSender = mpsc::Sender<(Bytes, DataType)>;
type FrameReceiver = mpsc::Receiver<(Bytes, DataType)>;

/// Writes queued operations into one link direction.
struct EndpointExecutor {
    out_tx: FrameSender,
    /// Cancelling this token fails the whole link (watchdog stall).
    link_cancel: CancellationToken,
}

#[async_trait]
impl OpExecutor for EndpointExecutor {
    async fn execute(&self, frame: Bytes, data_type: DataType) -> Result<(), LinkError> {
        self.out_tx
            .send((frame, data_type))
            .await
            .map_err(|_| LinkError::LinkClosed)
    }

    async fn on_stall(&self) {
        self.link_cancel.cancel();
    }
}

/// Transport strategy over one memory link endpoint.
struct MemoryTransport {
    remote_node_id: NodeId,
    kind: TransportKind,
    remote_address: String,
    link_id: u64,
    queue: OperationQueue,
    /// Cancels the endpoint's collector; fired before the queue closes.
    collector_cancel: CancellationToken,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn node_id(&self) -> NodeId {
        self.remote_node_id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn link_address(&self) -> &str {
        &self.remote_address
    }

    fn link_id(&self) -> u64 {
        self.link_id
    }

    async fn send(&self, frame: Bytes, data_type: DataType) -> Result<(), LinkError> {
        self.queue.enqueue(frame, data_type)
    }

    async fn disconnect(&self) {
        // Collector first, then the queue; the remote side observes the
        // channel close and emits its own PeerDisconnected.
        self.collector_cancel.cancel();
        self.queue.close();
    }
}

/// Everything one endpoint task needs.
struct EndpointContext {
    local: Arc<MemoryNode>,
    remote_address: String,
    link_id: u64,
    out_tx: FrameSender,
    cancel: CancellationToken,
    queue_config: OpQueueConfig,
}

impl EndpointContext {
    async fn send_control(&self, message_type: MessageType, payload: &[u8]) -> Result<(), ()> {
        self.out_tx
            .send((encode_control(message_type, payload), DataType::Control))
            .await
            .map_err(|_| ())
    }

    /// Builds the transport once the handshake succeeded and announces it.
    async fn promote(&self, remote_node_id: NodeId, kind: TransportKind) -> Arc<dyn Transport> {
        let queue = OperationQueue::new(self.queue_config.clone());
        queue.start(Arc::new(EndpointExecutor {
            out_tx: self.out_tx.clone(),
            link_cancel: self.cancel.clone(),
        }));
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport {
            remote_node_id,
            kind,
            remote_address: self.remote_address.clone(),
            link_id: self.link_id,
            queue,
            collector_cancel: self.cancel.clone(),
        });
        self.local
            .endpoints
            .insert(self.link_id, self.cancel.clone());
        let _ = self
            .local
            .events
            .send(LinkEvent::PeerConnected {
                node_id: remote_node_id,
                transport: Arc::clone(&transport),
            })
            .await;
        transport
    }

    /// Tears down after the data phase: announce the loss and forget state.
    async fn demote(&self, remote_node_id: NodeId) {
        self.local.endpoints.remove(&self.link_id);
        let _ = self
            .local
            .events
            .send(LinkEvent::PeerDisconnected {
                node_id: remote_node_id,
                link_address: self.remote_address.clone(),
                link_id: self.link_id,
            })
            .await;
    }

    /// Forwards authenticated traffic until the link dies.
    async fn pump_data(&self, remote_node_id: NodeId, in_rx: &mut FrameReceiver) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = in_rx.recv() => match frame {
                    None => break,
                    Some((data, data_type)) => {
                        let _ = self
                            .local
                            .events
                            .send(LinkEvent::DataReceived {
                                from: remote_node_id,
                                data,
                                data_type,
                            })
                            .await;
                    }
                },
            }
        }
        self.demote(remote_node_id).await;
    }
}

/// Server (they-dialed) side of a link: challenge, verify, then pump.
async fn run_server_endpoint(ctx: EndpointContext, mut in_rx: FrameReceiver) {
    let authenticated = loop {
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => break None,
            frame = in_rx.recv() => frame,
        };
        let Some((data, data_type)) = frame else {
            break None;
        };
        if data_type != DataType::Control {
            continue;
        }
        let Ok((message_type, payload)) = decode_control(&data) else {
            continue;
        };
        match message_type {
            MessageType::ClientHello => {
                let nonce = ctx.local.nonces.issue(&ctx.remote_address);
                if ctx.send_control(MessageType::AuthChallenge, &nonce).await.is_err() {
                    break None;
                }
            }
            MessageType::AuthResponse => {
                // One-shot: a replayed response finds no nonce and is ignored.
                let Some(nonce) = ctx.local.nonces.take(&ctx.remote_address) else {
                    continue;
                };
                let verified = {
                    let credentials = ctx.local.credentials.read();
                    credentials.as_ref().and_then(|c| {
                        auth::verify_response(&c.access_code, &nonce, payload)
                    })
                };
                match verified {
                    Some(node_id) => {
                        if ctx.send_control(MessageType::AuthResult, &[AUTH_ACCEPTED]).await.is_err() {
                            break None;
                        }
                        break Some(node_id);
                    }
                    None => {
                        log::info!(
                            "[MemoryLink] Rejecting {}: bad handshake digest",
                            ctx.remote_address
                        );
                        // Flush the verdict, then drop the link.
                        let _ = ctx.send_control(MessageType::AuthResult, &[AUTH_REJECTED]).await;
                        break None;
                    }
                }
            }
            _ => continue,
        }
    };

    match authenticated {
        Some(remote_node_id) => {
            ctx.promote(remote_node_id, TransportKind::Incoming).await;
            ctx.pump_data(remote_node_id, &mut in_rx).await;
        }
        None => ctx.local.nonces.forget(&ctx.remote_address),
    }
}

/// Client (we-dialed) side of a link: hello, respond, await verdict, pump.
async fn run_client_endpoint(
    ctx: EndpointContext,
    mut in_rx: FrameReceiver,
    remote_node_id: NodeId,
    done: oneshot::Sender<Result<(), LinkError>>,
) {
    let mut done = Some(done);
    if ctx.send_control(MessageType::ClientHello, &[]).await.is_err() {
        if let Some(done) = done.take() {
            let _ = done.send(Err(LinkError::ConnectFailed("link closed".into())));
        }
        return;
    }

    let authenticated = loop {
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => break false,
            frame = in_rx.recv() => frame,
        };
        let Some((data, data_type)) = frame else {
            break false;
        };
        if data_type != DataType::Control {
            continue;
        }
        let Ok((message_type, payload)) = decode_control(&data) else {
            continue;
        };
        match message_type {
            MessageType::AuthChallenge => {
                let response = {
                    let credentials = ctx.local.credentials.read();
                    credentials
                        .as_ref()
                        .map(|c| auth::generate_response(&c.access_code, payload, c.node_id))
                };
                let Some(response) = response else {
                    break false;
                };
                if ctx.send_control(MessageType::AuthResponse, &response).await.is_err() {
                    break false;
                }
            }
            MessageType::AuthResult => {
                break payload.first().copied() == Some(AUTH_ACCEPTED);
            }
            _ => continue,
        }
    };

    if authenticated {
        ctx.promote(remote_node_id, TransportKind::Outgoing).await;
        if let Some(done) = done.take() {
            let _ = done.send(Ok(()));
        }
        ctx.pump_data(remote_node_id, &mut in_rx).await;
    } else if let Some(done) = done.take() {
        let _ = done.send(Err(LinkError::ConnectFailed(
            "authentication rejected".into(),
        )));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver
// ─────────────────────────────────────────────────────────────────────────────

/// [`LinkDriver`] over the in-process hub.
pub struct MemoryLinkDriver {
    hub: Arc<MemoryHub>,
    node: Arc<MemoryNode>,
}

#[async_trait]
impl LinkDriver for MemoryLinkDriver {
    fn validate_capabilities(&self) -> Result<(), LinkError> {
        if self.node.destroyed.load(Ordering::SeqCst) {
            return Err(LinkError::CapabilityUnavailable("driver destroyed".into()));
        }
        Ok(())
    }

    fn set_credentials(&self, access_code: &str, own_node_id: NodeId) {
        *self.node.credentials.write() = Some(Credentials {
            access_code: access_code.to_string(),
            node_id: own_node_id,
        });
    }

    async fn start_scanning(&self) -> Result<(), LinkError> {
        self.validate_capabilities()?;
        if !self.node.scanning.swap(true, Ordering::SeqCst) {
            log::debug!("[MemoryLink] {} scanning", self.node.address);
        }
        self.hub.deliver_current_advertisers(&self.node);
        Ok(())
    }

    async fn stop_scanning(&self) {
        self.node.scanning.store(false, Ordering::SeqCst);
    }

    async fn start_advertising(&self, config: &AdvertisingConfig) -> Result<(), LinkError> {
        self.validate_capabilities()?;
        *self.node.advertising.lock() = Some(config.clone());

        let mut adv_cancel = self.node.adv_cancel.lock();
        if adv_cancel.is_none() {
            // One beacon task per node; it always reads the latest config.
            let token = CancellationToken::new();
            let hub = Arc::clone(&self.hub);
            let node = Arc::clone(&self.node);
            let task_token = token.clone();
            tokio::spawn(async move {
                loop {
                    hub.fan_out_advertisement(&node);
                    tokio::select! {
                        _ = task_token.cancelled() => return,
                        _ = sleep(ADVERTISE_INTERVAL) => {}
                    }
                }
            });
            *adv_cancel = Some(token);
        }
        Ok(())
    }

    async fn stop_advertising(&self) {
        *self.node.advertising.lock() = None;
        if let Some(token) = self.node.adv_cancel.lock().take() {
            token.cancel();
        }
    }

    async fn connect_to(&self, link_address: &str, node_id: NodeId) -> Result<(), LinkError> {
        self.validate_capabilities()?;
        let remote = self
            .hub
            .nodes
            .get(link_address)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|node| node.is_listening() && node.in_range_of(&self.node))
            .ok_or_else(|| LinkError::ConnectFailed(format!("no node in range at {link_address}")))?;

        let link_id = self.hub.next_link_id();
        let link_cancel = CancellationToken::new();
        let (dial_tx, dial_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let (accept_tx, accept_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let queue_config = self.hub.op_queue_config();

        tokio::spawn(run_server_endpoint(
            EndpointContext {
                local: remote,
                remote_address: self.node.address.clone(),
                link_id,
                out_tx: accept_tx,
                cancel: link_cancel.clone(),
                queue_config: queue_config.clone(),
            },
            dial_rx,
        ));

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(run_client_endpoint(
            EndpointContext {
                local: Arc::clone(&self.node),
                remote_address: link_address.to_string(),
                link_id,
                out_tx: dial_tx,
                cancel: link_cancel.clone(),
                queue_config,
            },
            accept_rx,
            node_id,
            done_tx,
        ));

        match timeout(self.hub.config.peer_connect_timeout, done_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::ConnectFailed("handshake task died".into())),
            Err(_) => {
                link_cancel.cancel();
                Err(LinkError::ConnectTimeout)
            }
        }
    }

    async fn disconnect_all(&self) {
        for entry in self.node.endpoints.iter() {
            entry.value().cancel();
        }
    }

    fn destroy(&self) {
        self.node.destroyed.store(true, Ordering::SeqCst);
        self.node.scanning.store(false, Ordering::SeqCst);
        *self.node.advertising.lock() = None;
        if let Some(token) = self.node.adv_cancel.lock().take() {
            token.cancel();
        }
        for entry in self.node.endpoints.iter() {
            entry.value().cancel();
        }
        self.hub.nodes.remove(&self.node.address);
    }
}
