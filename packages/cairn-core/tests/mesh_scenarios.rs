//! End-to-end mesh scenarios over the in-process hub.
//!
//! Every test runs whole nodes (controller + memory link driver) under a
//! paused clock, so timers fire deterministically and the scenarios match
//! their real-time shapes exactly.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::sleep;

use cairn_core::audio::AudioEngine;
use cairn_core::events::NoopEventEmitter;
use cairn_core::link::{LinkEvent, LinkEventReceiver};
use cairn_core::peer::{PeerRegistry, TransportKind};
use cairn_core::{
    EngineStateSnapshot, LinkDriver, MemoryHub, MeshConfig, MeshController, MeshError, NodeId,
};

/// Audio engine that records every delivered frame.
#[derive(Default)]
struct RecordingAudioEngine {
    frames: Mutex<Vec<Bytes>>,
}

impl RecordingAudioEngine {
    fn delivered(&self) -> usize {
        self.frames.lock().len()
    }
}

impl AudioEngine for RecordingAudioEngine {
    fn start(&self) {}
    fn stop(&self) {}
    fn set_mic_enabled(&self, _enabled: bool) {}

    fn push_incoming_packet(&self, frame: Bytes) {
        self.frames.lock().push(frame);
    }
}

struct TestNode {
    controller: Arc<MeshController>,
    audio: Arc<RecordingAudioEngine>,
}

fn spawn_node(hub: &Arc<MemoryHub>, address: &str, node_id: NodeId) -> TestNode {
    let (driver, events) = hub.attach(address);
    let audio = Arc::new(RecordingAudioEngine::default());
    let controller = MeshController::new(
        node_id,
        MeshConfig::default(),
        driver as Arc<dyn LinkDriver>,
        Arc::clone(&audio) as Arc<dyn AudioEngine>,
        Arc::new(NoopEventEmitter),
    )
    .expect("controller construction");
    controller.start(events);
    TestNode { controller, audio }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario 1: two-node create + join
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn two_node_create_and_join() {
    let hub = MemoryHub::new(MeshConfig::default());
    let a = spawn_node(&hub, "mem:a", 0x0000_0001);
    let b = spawn_node(&hub, "mem:b", 0x0000_0002);

    a.controller.create_group("Hike", "4829").await.unwrap();
    b.controller.join_group("Hike", "4829").await.unwrap();

    // Give A's event pump a beat to process its side of the handshake.
    sleep(Duration::from_millis(50)).await;

    assert_eq!(
        a.controller.engine_state(),
        EngineStateSnapshot::RadioActive { group: "Hike".into(), peer_count: 1 }
    );
    assert_eq!(
        b.controller.engine_state(),
        EngineStateSnapshot::RadioActive { group: "Hike".into(), peer_count: 1 }
    );

    // B has the greater node id: within two heartbeat intervals A adopts it.
    sleep(Duration::from_secs(2)).await;

    let topo_a = a.controller.topology();
    assert_eq!(topo_a.network_id, 0x0000_0002);
    assert_eq!(topo_a.hops_to_root, 1);
    assert!(topo_a.root_sequence >= 1);
    assert!(!topo_a.is_root);

    let topo_b = b.controller.topology();
    assert!(topo_b.is_root);
    assert_eq!(topo_b.network_id, 0x0000_0002);

    a.controller.shutdown().await;
    b.controller.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario 2: wrong access code
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn wrong_access_code_times_out_without_registering() {
    let hub = MemoryHub::new(MeshConfig::default());
    let a = spawn_node(&hub, "mem:a", 0x0000_0001);
    let c = spawn_node(&hub, "mem:c", 0x0000_0003);

    a.controller.create_group("Hike", "4829").await.unwrap();

    let err = c.controller.join_group("Hike", "0000").await.unwrap_err();
    assert!(matches!(err, MeshError::JoinTimedOut));
    assert_eq!(err.to_string(), "Connection Timed Out");

    // Neither side holds a peer; the joiner fell back to Idle.
    assert_eq!(a.controller.peer_count(), 0);
    assert_eq!(c.controller.peer_count(), 0);
    assert_eq!(c.controller.engine_state(), EngineStateSnapshot::Idle);

    a.controller.shutdown().await;
    c.controller.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario 3: island merge
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn disjoint_islands_merge_to_the_greater_root() {
    let hub = MemoryHub::new(MeshConfig::default());
    let a = spawn_node(&hub, "mem:a", 5);
    let b = spawn_node(&hub, "mem:b", 9);
    let c = spawn_node(&hub, "mem:c", 3);
    let d = spawn_node(&hub, "mem:d", 7);

    // Two ridges out of radio range of each other.
    hub.set_partition("mem:a", 1);
    hub.set_partition("mem:b", 1);
    hub.set_partition("mem:c", 2);
    hub.set_partition("mem:d", 2);

    a.controller.create_group("Hike", "4829").await.unwrap();
    b.controller.join_group("Hike", "4829").await.unwrap();
    c.controller.create_group("Hike", "4829").await.unwrap();
    d.controller.join_group("Hike", "4829").await.unwrap();

    sleep(Duration::from_secs(3)).await;
    assert_eq!(a.controller.topology().network_id, 9);
    assert_eq!(b.controller.topology().network_id, 9);
    assert_eq!(c.controller.topology().network_id, 7);
    assert_eq!(d.controller.topology().network_id, 7);

    // The ridges meet: X={5,9} advertises network 9, Y={3,7} network 7.
    for address in ["mem:a", "mem:b", "mem:c", "mem:d"] {
        hub.set_partition(address, 1);
    }

    sleep(Duration::from_secs(4)).await;
    for node in [&a, &b, &c, &d] {
        let topo = node.controller.topology();
        assert_eq!(topo.network_id, 9, "every node adopts the greater root");
    }
    assert!(b.controller.topology().is_root);

    for node in [a, b, c, d] {
        node.controller.shutdown().await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario 4: flood dedup
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn audio_flood_delivers_exactly_once() {
    let hub = MemoryHub::new(MeshConfig::default());
    let a = spawn_node(&hub, "mem:a", 1);
    let b = spawn_node(&hub, "mem:b", 2);
    let c = spawn_node(&hub, "mem:c", 3);

    a.controller.create_group("Hike", "4829").await.unwrap();
    b.controller.join_group("Hike", "4829").await.unwrap();
    c.controller.join_group("Hike", "4829").await.unwrap();

    // Let the connect policy close the triangle (everyone under target).
    sleep(Duration::from_secs(3)).await;
    assert_eq!(a.controller.peer_count(), 2);
    assert_eq!(b.controller.peer_count(), 2);
    assert_eq!(c.controller.peer_count(), 2);

    let frame = Bytes::from_static(&[0x5A; 48]);
    a.controller.broadcast_audio(frame).await;

    // B and C relay to each other (excluding A); dedup stops the echo.
    sleep(Duration::from_secs(1)).await;
    assert_eq!(a.audio.delivered(), 0, "sender never hears itself");
    assert_eq!(b.audio.delivered(), 1, "B delivers exactly once");
    assert_eq!(c.audio.delivered(), 1, "C delivers exactly once");

    // No late reflections either.
    sleep(Duration::from_secs(2)).await;
    assert_eq!(b.audio.delivered(), 1);
    assert_eq!(c.audio.delivered(), 1);

    for node in [a, b, c] {
        node.controller.shutdown().await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario 5: simultaneous connect
// ─────────────────────────────────────────────────────────────────────────────

async fn drain_connected(
    registry: &PeerRegistry,
    events: &mut LinkEventReceiver,
    expected_links: usize,
) {
    let mut seen = 0;
    while seen < expected_links {
        match events.recv().await.expect("event stream open") {
            LinkEvent::PeerConnected { node_id, transport } => {
                registry.register(node_id, transport).await;
                seen += 1;
            }
            _ => continue,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn simultaneous_connect_collapses_to_one_link() {
    let hub = MemoryHub::new(MeshConfig::default());
    let (driver_a, mut events_a) = hub.attach("mem:a");
    let (driver_b, mut events_b) = hub.attach("mem:b");
    driver_a.set_credentials("4829", 1);
    driver_b.set_credentials("4829", 2);

    // Both sides dial at once; both dials authenticate.
    let (dial_ab, dial_ba) =
        tokio::join!(driver_a.connect_to("mem:b", 2), driver_b.connect_to("mem:a", 1));
    dial_ab.unwrap();
    dial_ba.unwrap();

    let registry_a = PeerRegistry::new(1);
    let registry_b = PeerRegistry::new(2);
    drain_connected(&registry_a, &mut events_a, 2).await;
    drain_connected(&registry_b, &mut events_b, 2).await;

    // Exactly one link survives, and it is the one B (the greater id)
    // dialed: Outgoing at B, Incoming at A.
    assert_eq!(registry_a.len(), 1);
    assert_eq!(registry_b.len(), 1);
    assert_eq!(registry_a.node_ids(), vec![2]);
    assert_eq!(registry_b.node_ids(), vec![1]);

    let kept_at_a = registry_a.get(2).unwrap().transport().unwrap();
    let kept_at_b = registry_b.get(1).unwrap().transport().unwrap();
    assert_eq!(kept_at_a.kind(), TransportKind::Incoming);
    assert_eq!(kept_at_b.kind(), TransportKind::Outgoing);

    // The losing link's disconnect events must not evict the winner.
    sleep(Duration::from_millis(100)).await;
    while let Ok(event) = events_a.try_recv() {
        if let LinkEvent::PeerDisconnected { link_address, link_id, .. } = event {
            registry_a.unregister_link(&link_address, link_id);
        }
    }
    while let Ok(event) = events_b.try_recv() {
        if let LinkEvent::PeerDisconnected { link_address, link_id, .. } = event {
            registry_b.unregister_link(&link_address, link_id);
        }
    }
    assert_eq!(registry_a.len(), 1, "stale disconnects spare the winner");
    assert_eq!(registry_b.len(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenario 6: root timeout downgrade
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn silent_root_downgrades_and_readvertises() {
    let hub = MemoryHub::new(MeshConfig::default());
    let a = spawn_node(&hub, "mem:a", 9);
    let b = spawn_node(&hub, "mem:b", 5);

    a.controller.create_group("Hike", "4829").await.unwrap();
    b.controller.join_group("Hike", "4829").await.unwrap();

    sleep(Duration::from_secs(2)).await;
    assert_eq!(b.controller.topology().network_id, 9);
    assert!(!b.controller.topology().is_root);

    // The root vanishes.
    a.controller.shutdown().await;

    // After HEARTBEAT_TIMEOUT of silence B is its own one-node island again.
    sleep(Duration::from_secs(8)).await;
    let topo = b.controller.topology();
    assert!(topo.is_root);
    assert_eq!(topo.network_id, 5);
    assert_eq!(topo.hops_to_root, 0);
    assert!(topo.root_sequence >= 1, "downgraded root beats again");

    // Advertising reflects the new network id: a bystander scanning the
    // hub sees B advertising network 5.
    let (observer, mut observer_events) = hub.attach("mem:e");
    observer.start_scanning().await.unwrap();
    loop {
        match observer_events.recv().await.expect("event stream open") {
            LinkEvent::PeerDiscovered(peer) if peer.link_address == "mem:b" => {
                assert_eq!(peer.network_id, 5);
                assert_eq!(peer.hops_to_root, 0);
                break;
            }
            _ => continue,
        }
    }

    b.controller.shutdown().await;
}
