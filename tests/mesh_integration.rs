//! Multi-Node Mesh Integration Tests
//!
//! Several handlers wired together through the loopback medium, with the
//! periodic tasks running on a paused clock.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use ogm_mesh::{
    ChannelCallback, DeviceId, LoopbackNetwork, MeshConfig, MeshEvent, MeshHandler,
};

struct Node {
    handler: MeshHandler,
    events: UnboundedReceiver<MeshEvent>,
}

impl Node {
    fn drain(&mut self) -> Vec<MeshEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn deliveries(&mut self) -> Vec<(Vec<u8>, DeviceId)> {
        self.drain()
            .into_iter()
            .filter_map(|event| match event {
                MeshEvent::MessageReceived { payload, source } => Some((payload, source.uuid)),
                _ => None,
            })
            .collect()
    }
}

fn id(s: &str) -> DeviceId {
    DeviceId::new(s).unwrap()
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Attach and start one handler per name, then connect consecutive names
fn line(network: &LoopbackNetwork, names: &[&str]) -> Vec<Node> {
    let nodes: Vec<Node> = names
        .iter()
        .map(|name| {
            let handler = MeshHandler::new(id(name), MeshConfig::default()).unwrap();
            let (callback, events) = ChannelCallback::new();
            handler.register_callback(Arc::new(callback));
            network
                .attach(id(name), name.to_string(), Arc::new(handler.clone()))
                .unwrap();
            handler.start().unwrap();
            Node { handler, events }
        })
        .collect();

    for pair in names.windows(2) {
        network.connect(&id(pair[0]), &id(pair[1])).unwrap();
    }
    nodes
}

async fn converge() {
    tokio::time::sleep(Duration::from_secs(20)).await;
}

#[tokio::test(start_paused = true)]
async fn test_line_topology_learns_every_node() {
    init_logging();
    let network = LoopbackNetwork::new();
    let nodes = line(&network, &["A", "B", "C", "D"]);
    converge().await;

    let a = &nodes[0].handler;
    let known: Vec<DeviceId> = a.devices().into_iter().map(|d| d.uuid).collect();
    assert_eq!(known, vec![id("B"), id("C"), id("D")]);

    let neighbours: Vec<DeviceId> = a.neighbours().into_iter().map(|d| d.uuid).collect();
    assert_eq!(neighbours, vec![id("B")]);

    // middle nodes see both ends as reachable
    let b_known: Vec<DeviceId> = nodes[1].handler.devices().into_iter().map(|d| d.uuid).collect();
    assert_eq!(b_known, vec![id("A"), id("C"), id("D")]);
}

#[tokio::test(start_paused = true)]
async fn test_unicast_crosses_multiple_hops() {
    init_logging();
    let network = LoopbackNetwork::new();
    let mut nodes = line(&network, &["A", "B", "C", "D"]);
    converge().await;
    for node in nodes.iter_mut() {
        node.drain();
    }

    assert!(nodes[0].handler.send_message(b"over the hills", &id("D")));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        nodes[3].deliveries(),
        vec![(b"over the hills".to_vec(), id("A"))]
    );
    // relays forward without delivering
    assert!(nodes[1].deliveries().is_empty());
    assert!(nodes[2].deliveries().is_empty());

    // each hop transmitted the unicast exactly once
    for relay in &nodes[..3] {
        assert_eq!(relay.handler.ucm_stats().outgoing_stat().total_messages(), 1);
    }
    assert_eq!(nodes[3].handler.ucm_stats().incoming_stat().total_messages(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_to_unknown_device_fails() {
    init_logging();
    let network = LoopbackNetwork::new();
    let nodes = line(&network, &["A", "B"]);
    converge().await;

    assert!(!nodes[0].handler.send_message(b"nobody", &id("Z")));
    assert_eq!(nodes[0].handler.ucm_stats().outgoing_stat().total_messages(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_branch_is_purged() {
    init_logging();
    let network = LoopbackNetwork::new();
    let mut nodes = line(&network, &["A", "B", "C"]);
    converge().await;
    assert!(nodes[0].handler.device(&id("C")).is_some());

    network.disconnect(&id("B"), &id("C"));
    // B had no other route to C
    assert!(nodes[1].handler.device(&id("C")).is_none());
    assert!(nodes[1]
        .drain()
        .iter()
        .any(|e| matches!(e, MeshEvent::DeviceRemoved(d) if d.uuid == id("C"))));

    // A only forgets C once it expires
    assert!(nodes[0].handler.device(&id("C")).is_some());
    tokio::time::sleep(Duration::from_secs(201)).await;
    nodes[0].handler.purge_expired();

    assert!(nodes[0].handler.device(&id("C")).is_none());
    assert!(nodes[0].handler.device(&id("B")).is_some());
    assert!(!nodes[0].handler.send_message(b"gone", &id("C")));
}

#[tokio::test(start_paused = true)]
async fn test_stats_are_published_periodically() {
    init_logging();
    let network = LoopbackNetwork::new();
    let mut nodes = line(&network, &["A", "B"]);
    converge().await;

    let stats: Vec<_> = nodes[0]
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            MeshEvent::NetworkStatsUpdated(stats) => Some(stats),
            _ => None,
        })
        .collect();
    assert!(stats.len() >= 15);

    let latest = stats.last().unwrap();
    assert!(latest.ogm_incoming.total_messages() > 0);
    assert!(latest.ogm_outgoing.total_messages() > 0);
    assert!(latest.ogm_incoming.items.len() <= MeshConfig::default().sliding_window_size);
}

#[tokio::test(start_paused = true)]
async fn test_total_loss_prevents_discovery() {
    init_logging();
    let network = LoopbackNetwork::new();
    network.set_loss_rate(1.0);
    let nodes = line(&network, &["A", "B", "C"]);
    converge().await;

    // direct neighbours come from the link layer, C is never advertised to A
    let known: Vec<DeviceId> = nodes[0].handler.devices().into_iter().map(|d| d.uuid).collect();
    assert_eq!(known, vec![id("B")]);
    assert!(!nodes[0].handler.send_message(b"lost", &id("C")));
}

#[tokio::test(start_paused = true)]
async fn test_stop_closes_links() {
    init_logging();
    let network = LoopbackNetwork::new();
    let nodes = line(&network, &["A", "B"]);
    converge().await;

    nodes[0].handler.stop();
    assert!(!nodes[0].handler.is_running());
    assert!(nodes[0].handler.neighbours().is_empty());
    let sent_before = nodes[0].handler.ogm_stats().outgoing_stat().total_messages();

    tokio::time::sleep(Duration::from_secs(10)).await;
    let sent_after = nodes[0].handler.ogm_stats().outgoing_stat().total_messages();
    assert_eq!(sent_after, sent_before);
    assert!(nodes[1].handler.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_reconnected_neighbours_keep_talking() {
    init_logging();
    let network = LoopbackNetwork::new();
    let mut nodes = line(&network, &["A", "B"]);
    converge().await;

    // the link layer reports the same peer again with a new handle
    network.connect(&id("A"), &id("B")).unwrap();
    for node in nodes.iter_mut() {
        node.drain();
    }

    assert!(nodes[0].handler.send_message(b"still here", &id("B")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(nodes[1].deliveries(), vec![(b"still here".to_vec(), id("A"))]);

    // both directions moved to the new links
    converge().await;
    nodes[0].drain();
    assert!(nodes[1].handler.send_message(b"and back", &id("A")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(nodes[0].deliveries(), vec![(b"and back".to_vec(), id("B"))]);
    assert_eq!(nodes[0].handler.neighbours().len(), 1);
}
