//! OGM Mesh Demo
//!
//! Runs a small line of nodes over the in-process loopback medium, waits for
//! the advertisements to converge and sends one unicast end to end.
//!
//! Usage: `ogm-mesh [NODES] [CONFIG.json]`

use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use ogm_mesh::{
    ChannelCallback, DeviceId, LoopbackNetwork, MeshConfig, MeshEvent, MeshHandler,
};

const DEFAULT_NODES: usize = 4;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("=== OGM Mesh: self-organizing mesh routing demo ===");

    let mut args = std::env::args().skip(1);
    let node_count = match args.next() {
        Some(raw) => raw.parse::<usize>().context("Invalid node count")?,
        None => DEFAULT_NODES,
    };
    if node_count < 2 {
        bail!("Need at least 2 nodes, got {}", node_count);
    }
    let config = match args.next() {
        Some(path) => MeshConfig::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => MeshConfig::default(),
    };

    let network = LoopbackNetwork::new();
    let mut nodes = Vec::with_capacity(node_count);
    let mut inboxes = Vec::with_capacity(node_count);

    for index in 0..node_count {
        let uuid = DeviceId::new(format!("node-{}", index))?;
        let handler = MeshHandler::new(uuid.clone(), config.clone())
            .with_context(|| format!("Failed to create {}", uuid))?;
        let (callback, events) = ChannelCallback::new();
        handler.register_callback(Arc::new(callback));
        network.attach(uuid.clone(), uuid.to_string(), Arc::new(handler.clone()))?;
        handler.start().context("Failed to start mesh handler")?;
        nodes.push(handler);
        inboxes.push(events);
    }

    for pair in nodes.windows(2) {
        network.connect(pair[0].uuid(), pair[1].uuid())?;
    }

    let settle = config.ogm_interval() * (node_count as u32 + 2);
    info!("Waiting {:?} for route convergence", settle);
    tokio::time::sleep(settle).await;

    let first = &nodes[0];
    let last = &nodes[node_count - 1];
    for device in first.devices() {
        info!(
            "{} sees {} (tq {}, neighbour: {})",
            first.uuid(),
            device.uuid,
            device.tq,
            device.is_neighbour
        );
    }

    let payload = format!("hello from {}", first.uuid());
    if !first.send_message(payload.as_bytes(), last.uuid()) {
        bail!("{} has no route to {}", first.uuid(), last.uuid());
    }

    let inbox = &mut inboxes[node_count - 1];
    match wait_for_delivery(inbox, Duration::from_secs(5)).await {
        Some((body, source)) => info!(
            "{} received {:?} from {}",
            last.uuid(),
            String::from_utf8_lossy(&body),
            source
        ),
        None => warn!("Message did not arrive at {}", last.uuid()),
    }

    info!(
        "Status: {}",
        serde_json::to_string_pretty(&first.status()).context("Failed to encode status")?
    );

    for node in &nodes {
        node.stop();
    }
    Ok(())
}

async fn wait_for_delivery(
    inbox: &mut UnboundedReceiver<MeshEvent>,
    timeout: Duration,
) -> Option<(Vec<u8>, DeviceId)> {
    let wait = async {
        while let Some(event) = inbox.recv().await {
            if let MeshEvent::MessageReceived { payload, source } = event {
                return Some((payload, source.uuid));
            }
        }
        None
    };
    tokio::time::timeout(timeout, wait).await.ok().flatten()
}
