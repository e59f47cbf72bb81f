//! Cairn Node - headless mesh simulator.
//!
//! Spins up N in-process nodes on the memory hub: the first creates the
//! group, the rest join, one node floods voice frames, and the binary
//! reports topology convergence and per-node delivery counts. The same
//! core drives real BLE hardware in the mobile embeddings; only the link
//! driver differs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use cairn_core::audio::AudioEngine;
use cairn_core::{
    random_node_id, LinkDriver, LoggingEventEmitter, MemoryHub, MeshConfig, MeshController, NodeId,
};
use clap::Parser;
use parking_lot::Mutex;
use tokio::signal;
use tokio::time::sleep;

/// Cairn Node - headless multi-node mesh simulation.
#[derive(Parser, Debug)]
#[command(name = "cairn-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nodes to simulate.
    #[arg(short, long, default_value_t = 3, env = "CAIRN_NODES")]
    nodes: usize,

    /// Group name the nodes share.
    #[arg(short, long, default_value = "Hike", env = "CAIRN_GROUP")]
    group: String,

    /// Pre-shared access code.
    #[arg(short, long, default_value = "4829", env = "CAIRN_ACCESS_CODE")]
    access_code: String,

    /// Voice frames the talker floods into the mesh.
    #[arg(short = 'f', long, default_value_t = 50, env = "CAIRN_TALK_FRAMES")]
    talk_frames: usize,

    /// Seconds to keep the mesh running after the talk burst.
    #[arg(short = 'd', long, default_value_t = 5, env = "CAIRN_LINGER_SECS")]
    linger_secs: u64,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "CAIRN_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

/// Audio engine that counts deliveries per node.
#[derive(Default)]
struct CountingAudioEngine {
    delivered: Mutex<u64>,
}

impl CountingAudioEngine {
    fn delivered(&self) -> u64 {
        *self.delivered.lock()
    }
}

impl AudioEngine for CountingAudioEngine {
    fn start(&self) {}
    fn stop(&self) {}
    fn set_mic_enabled(&self, _enabled: bool) {}

    fn push_incoming_packet(&self, _frame: Bytes) {
        *self.delivered.lock() += 1;
    }
}

struct SimNode {
    node_id: NodeId,
    address: String,
    controller: Arc<MeshController>,
    audio: Arc<CountingAudioEngine>,
}

fn spawn_sim_node(hub: &Arc<MemoryHub>, index: usize) -> Result<SimNode> {
    let node_id = random_node_id();
    let address = format!("mem:{index:02}");
    let (driver, events) = hub.attach(&address);
    let audio = Arc::new(CountingAudioEngine::default());
    let controller = MeshController::new(
        node_id,
        MeshConfig::default(),
        driver as Arc<dyn LinkDriver>,
        Arc::clone(&audio) as Arc<dyn AudioEngine>,
        Arc::new(LoggingEventEmitter),
    )
    .context("controller construction failed")?;
    controller.start(events);
    Ok(SimNode { node_id, address, controller, audio })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Cairn Node v{}", env!("CARGO_PKG_VERSION"));
    anyhow::ensure!(args.nodes >= 2, "a mesh needs at least 2 nodes");

    let hub = MemoryHub::new(MeshConfig::default());
    let mut nodes = Vec::with_capacity(args.nodes);
    for index in 0..args.nodes {
        nodes.push(spawn_sim_node(&hub, index)?);
    }

    let creator = &nodes[0];
    log::info!(
        "Node {:#010x} creating group '{}'",
        creator.node_id,
        args.group
    );
    creator
        .controller
        .create_group(&args.group, &args.access_code)
        .await
        .context("create_group failed")?;

    for node in &nodes[1..] {
        log::info!("Node {:#010x} joining '{}'", node.node_id, args.group);
        node.controller
            .join_group(&args.group, &args.access_code)
            .await
            .with_context(|| format!("node {:#010x} failed to join", node.node_id))?;
    }

    // Let the connect policy and heartbeats settle.
    sleep(Duration::from_secs(3)).await;
    for node in &nodes {
        let topo = node.controller.topology();
        log::info!(
            "{}: node={:#010x} network={:#010x} hops={} peers={}{}",
            node.address,
            node.node_id,
            topo.network_id,
            topo.hops_to_root,
            node.controller.peer_count(),
            if topo.is_root { " (root)" } else { "" },
        );
    }

    // One node talks; every other node should hear each frame exactly once.
    let talker = &nodes[0];
    log::info!(
        "Node {:#010x} flooding {} voice frames",
        talker.node_id,
        args.talk_frames
    );
    for sequence in 0..args.talk_frames {
        // A realistic 48-byte opus-sized frame, unique per sequence.
        let mut frame = vec![0u8; 48];
        frame[..8].copy_from_slice(&(sequence as u64).to_le_bytes());
        talker.controller.broadcast_audio(Bytes::from(frame)).await;
        sleep(Duration::from_millis(20)).await;
    }

    log::info!(
        "Talk burst done; lingering {}s (ctrl-c to stop early)",
        args.linger_secs
    );
    tokio::select! {
        _ = sleep(Duration::from_secs(args.linger_secs)) => {}
        _ = signal::ctrl_c() => log::info!("Interrupted"),
    }

    let summary: Vec<serde_json::Value> = nodes
        .iter()
        .map(|node| {
            let topo = node.controller.topology();
            serde_json::json!({
                "address": node.address,
                "nodeId": format!("{:#010x}", node.node_id),
                "networkId": format!("{:#010x}", topo.network_id),
                "isRoot": topo.is_root,
                "hopsToRoot": topo.hops_to_root,
                "peers": node.controller.peer_count(),
                "framesHeard": node.audio.delivered(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&summary)?);

    for node in &nodes {
        node.controller.shutdown().await;
    }
    log::info!("Shutdown complete");
    Ok(())
}
