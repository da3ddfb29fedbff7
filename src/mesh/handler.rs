//! Mesh Handler
//!
//! Orchestrates one mesh node: owns the routing table, router and OGM
//! sequence behind a single lock, runs the periodic OGM, purge and stats
//! tasks, and bridges link-layer frames and application sends.

use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::callback::{LayerCallback, MeshHandlerCallback};
use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::link::Link;
use crate::protocol::{DeviceId, Message, MessageType};
use crate::routing::{MeshDevice, RemoteDevice, Router, RoutingTable};
use crate::stats::{NetworkStats, StatsResult};

/// Upper bound of the random initial OGM sequence
const INITIAL_SEQUENCE_RANGE: u32 = 1024;

/// Mutable routing state, always accessed as one critical section
struct Core {
    routing_table: RoutingTable,
    router: Router,
    sequence: u32,
}

struct Inner {
    uuid: DeviceId,
    config: MeshConfig,
    core: Mutex<Core>,
    ogm_stats: Arc<NetworkStats>,
    ucm_stats: Arc<NetworkStats>,
    callback: RwLock<Option<Arc<dyn MeshHandlerCallback>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// One node of the mesh. Cheap to clone; clones share the same node.
#[derive(Clone)]
pub struct MeshHandler {
    inner: Arc<Inner>,
}

impl MeshHandler {
    pub fn new(uuid: DeviceId, config: MeshConfig) -> Result<Self> {
        config.validate()?;

        let ogm_stats = Arc::new(NetworkStats::new(config.sliding_window_size));
        let ucm_stats = Arc::new(NetworkStats::new(config.sliding_window_size));
        let now = Utc::now();
        ogm_stats.update_ts(now);
        ucm_stats.update_ts(now);

        let router = Router::new(uuid.clone(), &config, ogm_stats.clone(), ucm_stats.clone());
        let core = Core {
            routing_table: RoutingTable::new(config.device_expiration()),
            router,
            sequence: rand::thread_rng().gen_range(0..INITIAL_SEQUENCE_RANGE),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                uuid,
                config,
                core: Mutex::new(core),
                ogm_stats,
                ucm_stats,
                callback: RwLock::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Set the single application observer. Last registration wins.
    pub fn register_callback(&self, callback: Arc<dyn MeshHandlerCallback>) {
        *self.inner.callback.write() = Some(callback.clone());
        self.inner
            .core
            .lock()
            .routing_table
            .register_mesh_handler_callback(callback);
    }

    fn callback(&self) -> Option<Arc<dyn MeshHandlerCallback>> {
        self.inner.callback.read().clone()
    }

    /// Spawn the OGM, purge and stats tasks on the current tokio runtime
    pub fn start(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }

        info!("Starting mesh handler {}", self.inner.uuid);
        let config = &self.inner.config;

        let ogm_interval = config.ogm_interval();
        tasks.push(self.spawn_periodic(&runtime, jitter(ogm_interval), ogm_interval, |handler| {
            handler.originate_ogm();
        }));

        let purge_interval = config.purge_interval();
        tasks.push(self.spawn_periodic(&runtime, jitter(purge_interval), purge_interval, |handler| {
            handler.purge_expired();
        }));

        let stats_interval = config.network_stat_update_interval();
        tasks.push(self.spawn_periodic(&runtime, stats_interval, stats_interval, |handler| {
            handler.publish_stats();
        }));

        info!("Mesh handler {} started", self.inner.uuid);
        Ok(())
    }

    fn spawn_periodic<F>(
        &self,
        runtime: &Handle,
        first_delay: Duration,
        period: Duration,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn(&MeshHandler) + Send + 'static,
    {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            let mut interval = time::interval_at(Instant::now() + first_delay, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                tick(&MeshHandler { inner });
            }
        })
    }

    /// Cancel the periodic tasks, release every neighbour and close its link.
    /// Devices only reachable through those neighbours are forgotten too, so a
    /// later [`start`](Self::start) waits for the link layer to report them again.
    pub fn stop(&self) {
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }

        info!("Stopping mesh handler {}", self.inner.uuid);
        for task in tasks {
            task.abort();
        }

        let links = self.inner.core.lock().routing_table.release_neighbours();
        for link in links {
            link.close();
        }
        info!("Mesh handler {} stopped", self.inner.uuid);
    }

    pub fn is_running(&self) -> bool {
        !self.inner.tasks.lock().is_empty()
    }

    /// Send `payload` to `destination` as a unicast message.
    ///
    /// Returns false without sending when the destination is unknown, and false
    /// when no live route remains or the ttl is spent.
    pub fn send_message(&self, payload: &[u8], destination: &DeviceId) -> bool {
        let config = &self.inner.config;
        let mut guard = self.inner.core.lock();
        let core = &mut *guard;

        if !core.routing_table.contains(destination) {
            debug!("Not sending to unknown device {}", destination);
            return false;
        }

        let message = Message::ucm(
            self.inner.uuid.clone(),
            destination.clone(),
            0,
            config.initial_message_tq,
            config.initial_message_ttl,
            payload.to_vec(),
        );
        match core.router.route_message(&mut core.routing_table, message) {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to send message to {}: {}", destination, e);
                false
            }
        }
    }

    /// Advertise this node to every neighbour once. Returns the sequence used.
    pub fn originate_ogm(&self) -> u32 {
        let config = &self.inner.config;
        let mut guard = self.inner.core.lock();
        let core = &mut *guard;

        let sequence = core.sequence;
        let ogm = Message::ogm(
            self.inner.uuid.clone(),
            sequence,
            config.initial_message_tq,
            config.initial_message_ttl,
        );
        if let Err(e) = core.router.route_message(&mut core.routing_table, ogm) {
            warn!("Failed to originate OGM {}: {}", sequence, e);
        }
        core.routing_table.slide_neighbour_windows(sequence);
        core.sequence = sequence.wrapping_add(1);
        sequence
    }

    /// Remove every device not heard from within its expiration and close
    /// the links of purged neighbours. Returns the purged identities.
    pub fn purge_expired(&self) -> Vec<DeviceId> {
        let mut links = Vec::new();
        let expired = {
            let mut core = self.inner.core.lock();
            let expired = core.routing_table.expired_remote_devices();
            for uuid in &expired {
                if let Some(mut device) = core.routing_table.remove(uuid) {
                    links.extend(device.release_link());
                }
            }
            expired
        };

        for link in links {
            link.close();
        }
        if !expired.is_empty() {
            info!("Purged {} expired device(s)", expired.len());
        }
        expired
    }

    /// Snapshot the four stats windows, hand them to the observer and roll the windows
    pub fn publish_stats(&self) -> StatsResult {
        let result = StatsResult {
            generated_at: Utc::now(),
            ogm_incoming: self.inner.ogm_stats.incoming_stat(),
            ogm_outgoing: self.inner.ogm_stats.outgoing_stat(),
            ucm_incoming: self.inner.ucm_stats.incoming_stat(),
            ucm_outgoing: self.inner.ucm_stats.outgoing_stat(),
        };

        if let Some(callback) = self.callback() {
            callback.on_network_stats_updated(&result);
        }

        let now = Utc::now();
        self.inner.ogm_stats.update_ts(now);
        self.inner.ucm_stats.update_ts(now);
        result
    }

    fn stats_for(&self, message_type: MessageType) -> &NetworkStats {
        match message_type {
            MessageType::Ogm => &self.inner.ogm_stats,
            MessageType::Ucm => &self.inner.ucm_stats,
        }
    }

    pub fn uuid(&self) -> &DeviceId {
        &self.inner.uuid
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    /// Next OGM sequence number
    pub fn sequence(&self) -> u32 {
        self.inner.core.lock().sequence
    }

    /// Every known device, ordered by identity
    pub fn devices(&self) -> Vec<MeshDevice> {
        self.inner.core.lock().routing_table.reachable_mesh_devices()
    }

    /// Direct neighbours, ordered by identity
    pub fn neighbours(&self) -> Vec<MeshDevice> {
        self.inner
            .core
            .lock()
            .routing_table
            .neighbours()
            .iter()
            .map(|device| device.mesh_device())
            .collect()
    }

    pub fn device(&self, uuid: &DeviceId) -> Option<MeshDevice> {
        self.inner.core.lock().routing_table.get(uuid).map(|d| d.mesh_device())
    }

    pub fn ogm_stats(&self) -> &NetworkStats {
        &self.inner.ogm_stats
    }

    pub fn ucm_stats(&self) -> &NetworkStats {
        &self.inner.ucm_stats
    }

    /// Get handler status
    pub fn status(&self) -> Value {
        let (sequence, device_count, neighbour_count) = {
            let core = self.inner.core.lock();
            let neighbour_count = core.routing_table.neighbours().len();
            (core.sequence, core.routing_table.len(), neighbour_count)
        };

        serde_json::json!({
            "uuid": self.inner.uuid,
            "is_running": self.is_running(),
            "sequence": sequence,
            "devices": device_count,
            "neighbours": neighbour_count,
            "ogm_received": self.inner.ogm_stats.incoming_stat().total_messages(),
            "ucm_received": self.inner.ucm_stats.incoming_stat().total_messages(),
            "config": self.inner.config.to_json()
        })
    }
}

impl LayerCallback for MeshHandler {
    fn on_device_added(&self, uuid: DeviceId, name: String, link: Arc<dyn Link>) {
        if uuid == self.inner.uuid {
            warn!("Ignoring link to own identity {}", uuid);
            return;
        }

        let device = RemoteDevice::new(uuid.clone(), name, self.inner.config.sliding_window_size)
            .with_link(link);
        let replaced = self
            .inner
            .core
            .lock()
            .routing_table
            .ensure_connection(device, &uuid);
        if let Some(stale) = replaced {
            stale.close();
        }
    }

    fn on_device_removed(&self, uuid: &DeviceId) {
        let link = self.inner.core.lock().routing_table.remove_as_neighbour(uuid);
        if let Some(link) = link {
            link.close();
        }
    }

    fn on_message_received(&self, bytes: &[u8]) {
        let message = match Message::parse(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping malformed frame ({} bytes): {}", bytes.len(), e);
                return;
            }
        };
        self.stats_for(message.message_type()).add_incoming_message(&message);

        let source = message.source().clone();
        let from_self = source == self.inner.uuid;

        let delivery = {
            let mut guard = self.inner.core.lock();
            let core = &mut *guard;

            let routed = match core.router.route_message(&mut core.routing_table, message) {
                Ok(routed) => routed,
                Err(e) => {
                    warn!("Dropping message from {}: {}", source, e);
                    return;
                }
            };

            let projection = if from_self {
                None
            } else {
                core.routing_table.record_received(&source, bytes.len())
            };

            match routed {
                Some(message)
                    if message.message_type() == MessageType::Ucm
                        && message.is_addressed_to(&self.inner.uuid) =>
                {
                    let device = projection.unwrap_or_else(|| MeshDevice::unknown(source.clone()));
                    Some((message, device))
                }
                _ => None,
            }
        };

        if let Some((message, device)) = delivery {
            debug!("Delivering {} bytes from {}", message.body().len(), device.uuid);
            if let Some(callback) = self.callback() {
                callback.on_message_received(message.body(), &device);
            }
        }
    }

    fn on_link_failure(&self, uuid: &DeviceId) {
        if let Some(device) = self.inner.core.lock().routing_table.get_mut(uuid) {
            device.note_link_failure();
            debug!("Link failure hint for {} ({})", uuid, device.link_failures());
        }
    }
}

/// Random first-fire delay in `[0, period)`
fn jitter(period: Duration) -> Duration {
    let millis = period.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..millis))
}
