//! In-Process Loopback Medium
//!
//! Connects several mesh nodes inside one process. Every attached node gets
//! an inbox drained by its own task, so a send never re-enters the receiving
//! node on the sender's stack.

use dashmap::DashMap;
use log::{debug, info, trace};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Link;
use crate::error::{Error, LinkError, Result};
use crate::mesh::LayerCallback;
use crate::protocol::DeviceId;

/// One direction of a loopback connection
#[derive(Debug)]
pub struct LoopbackLink {
    from: DeviceId,
    to: DeviceId,
    inbox: mpsc::UnboundedSender<Vec<u8>>,
    closed: AtomicBool,
    loss_rate: Arc<AtomicU64>,
}

impl LoopbackLink {
    pub fn local(&self) -> &DeviceId {
        &self.from
    }

    pub fn remote(&self) -> &DeviceId {
        &self.to
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Link for LoopbackLink {
    fn send(&self, frame: Vec<u8>) -> std::result::Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }

        let loss_rate = f64::from_bits(self.loss_rate.load(Ordering::Relaxed));
        if loss_rate > 0.0 && rand::thread_rng().gen_bool(loss_rate.min(1.0)) {
            trace!("Lost frame {} -> {} ({} bytes)", self.from, self.to, frame.len());
            return Ok(());
        }

        self.inbox.send(frame).map_err(|_| LinkError::Closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct Node {
    name: String,
    layer: Arc<dyn LayerCallback>,
    inbox: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

/// Shared medium between attached nodes
pub struct LoopbackNetwork {
    nodes: DashMap<DeviceId, Node>,
    links: DashMap<(DeviceId, DeviceId), Arc<LoopbackLink>>,
    loss_rate: Arc<AtomicU64>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            links: DashMap::new(),
            loss_rate: Arc::new(AtomicU64::new(0f64.to_bits())),
        }
    }

    /// Attach a node. Frames sent to it are handed to `layer` from a task
    /// on the current runtime.
    pub fn attach(
        &self,
        uuid: DeviceId,
        name: impl Into<String>,
        layer: Arc<dyn LayerCallback>,
    ) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        self.detach(&uuid);

        let (inbox, mut frames) = mpsc::unbounded_channel::<Vec<u8>>();
        let receiver = layer.clone();
        let task = runtime.spawn(async move {
            while let Some(frame) = frames.recv().await {
                receiver.on_message_received(&frame);
            }
        });

        info!("Attached {} to loopback network", uuid);
        self.nodes.insert(
            uuid,
            Node {
                name: name.into(),
                layer,
                inbox,
                task,
            },
        );
        Ok(())
    }

    /// Remove a node and tear down every connection it had
    pub fn detach(&self, uuid: &DeviceId) {
        let peers: Vec<DeviceId> = self
            .links
            .iter()
            .filter(|entry| &entry.key().0 == uuid)
            .map(|entry| entry.key().1.clone())
            .collect();
        for peer in peers {
            self.disconnect(uuid, &peer);
        }

        if let Some((_, node)) = self.nodes.remove(uuid) {
            node.task.abort();
            info!("Detached {} from loopback network", uuid);
        }
    }

    /// Bring up a bidirectional connection and report it to both nodes
    pub fn connect(&self, a: &DeviceId, b: &DeviceId) -> Result<()> {
        let (a_name, a_layer, a_inbox) = self.node_parts(a)?;
        let (b_name, b_layer, b_inbox) = self.node_parts(b)?;

        let a_to_b = self.new_link(a, b, b_inbox);
        let b_to_a = self.new_link(b, a, a_inbox);
        self.replace_link(a_to_b.clone());
        self.replace_link(b_to_a.clone());

        debug!("Connected {} <-> {}", a, b);
        a_layer.on_device_added(b.clone(), b_name, a_to_b);
        b_layer.on_device_added(a.clone(), a_name, b_to_a);
        Ok(())
    }

    /// Tear down the connection between `a` and `b` in both directions
    pub fn disconnect(&self, a: &DeviceId, b: &DeviceId) {
        for (from, to) in [(a, b), (b, a)] {
            let Some((_, link)) = self.links.remove(&(from.clone(), to.clone())) else {
                continue;
            };
            link.close();
            let layer = self.nodes.get(from).map(|node| node.layer.clone());
            if let Some(layer) = layer {
                layer.on_device_removed(to);
            }
        }
        debug!("Disconnected {} <-> {}", a, b);
    }

    /// Report a delivery failure on `from -> to` to the sending node
    pub fn fail_link(&self, from: &DeviceId, to: &DeviceId) {
        let layer = self.nodes.get(from).map(|node| node.layer.clone());
        if let Some(layer) = layer {
            layer.on_link_failure(to);
        }
    }

    /// Probability in `[0, 1]` that any frame is silently dropped
    pub fn set_loss_rate(&self, loss_rate: f64) {
        let loss_rate = loss_rate.clamp(0.0, 1.0);
        self.loss_rate.store(loss_rate.to_bits(), Ordering::Relaxed);
    }

    pub fn loss_rate(&self) -> f64 {
        f64::from_bits(self.loss_rate.load(Ordering::Relaxed))
    }

    pub fn is_connected(&self, a: &DeviceId, b: &DeviceId) -> bool {
        self.links.contains_key(&(a.clone(), b.clone()))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn node_parts(
        &self,
        uuid: &DeviceId,
    ) -> Result<(String, Arc<dyn LayerCallback>, mpsc::UnboundedSender<Vec<u8>>)> {
        let node = self
            .nodes
            .get(uuid)
            .ok_or_else(|| LinkError::Rejected(format!("{} is not attached", uuid)))?;
        Ok((node.name.clone(), node.layer.clone(), node.inbox.clone()))
    }

    fn new_link(
        &self,
        from: &DeviceId,
        to: &DeviceId,
        inbox: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Arc<LoopbackLink> {
        Arc::new(LoopbackLink {
            from: from.clone(),
            to: to.clone(),
            inbox,
            closed: AtomicBool::new(false),
            loss_rate: self.loss_rate.clone(),
        })
    }

    fn replace_link(&self, link: Arc<LoopbackLink>) {
        let key = (link.from.clone(), link.to.clone());
        if let Some(previous) = self.links.insert(key, link) {
            previous.close();
        }
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LoopbackNetwork {
    fn drop(&mut self) {
        for node in self.nodes.iter() {
            node.task.abort();
        }
    }
}
