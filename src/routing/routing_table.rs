//! Routing Table
//!
//! Authoritative map from device identity to [`RemoteDevice`], with the
//! neighbour and reachable views derived from it. Every change to the visible
//! device set is reported to the registered observer before the call returns.

use log::{debug, info};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::remote_device::{MeshDevice, RemoteDevice};
use crate::link::Link;
use crate::mesh::MeshHandlerCallback;
use crate::protocol::DeviceId;

enum DeviceEvent {
    Added,
    Updated,
    Removed,
}

pub struct RoutingTable {
    devices: HashMap<DeviceId, RemoteDevice>,
    device_expiration: Duration,
    callback: Option<Arc<dyn MeshHandlerCallback>>,
}

impl RoutingTable {
    pub fn new(device_expiration: Duration) -> Self {
        Self {
            devices: HashMap::new(),
            device_expiration,
            callback: None,
        }
    }

    /// Subscribe the single observer of add/update/remove events. Last registration wins.
    pub fn register_mesh_handler_callback(&mut self, callback: Arc<dyn MeshHandlerCallback>) {
        self.callback = Some(callback);
    }

    fn notify(&self, event: DeviceEvent, device: &MeshDevice) {
        if let Some(callback) = &self.callback {
            match event {
                DeviceEvent::Added => callback.on_device_added(device),
                DeviceEvent::Updated => callback.on_device_updated(device),
                DeviceEvent::Removed => callback.on_device_removed(device),
            }
        }
    }

    pub(crate) fn notify_updated(&self, uuid: &DeviceId) {
        if let Some(device) = self.devices.get(uuid) {
            self.notify(DeviceEvent::Updated, &device.mesh_device());
        }
    }

    /// Register `remote` as reachable via `via`. When `remote` is `via` it becomes a
    /// direct neighbour and its link is adopted, replacing any link already held.
    /// Returns the replaced link so the caller can close it. Repeated calls
    /// otherwise only refresh last-seen.
    pub fn ensure_connection(
        &mut self,
        mut remote: RemoteDevice,
        via: &DeviceId,
    ) -> Option<Arc<dyn Link>> {
        let direct = remote.uuid() == via;

        match self.devices.entry(remote.uuid().clone()) {
            Entry::Occupied(entry) => {
                let device = entry.into_mut();
                device.touch();
                if !direct {
                    return None;
                }
                let link = remote.release_link()?;
                let replaced = device.release_link();
                device.adopt_link(link.clone());
                match replaced {
                    None => {
                        info!("Device {} is now a direct neighbour", device.uuid());
                        let projection = device.mesh_device();
                        self.notify(DeviceEvent::Updated, &projection);
                        None
                    }
                    Some(old) if Arc::ptr_eq(&old, &link) => None,
                    Some(old) => {
                        debug!("Replaced link to neighbour {}", device.uuid());
                        Some(old)
                    }
                }
            }
            Entry::Vacant(entry) => {
                if !direct {
                    // only neighbours keep a link handle
                    remote.release_link();
                }
                let device = entry.insert(remote);
                info!(
                    "Added {} {}",
                    if direct { "neighbour" } else { "reachable device" },
                    device.uuid()
                );
                let projection = device.mesh_device();
                self.notify(DeviceEvent::Added, &projection);
                None
            }
        }
    }

    pub fn get(&self, uuid: &DeviceId) -> Option<&RemoteDevice> {
        self.devices.get(uuid)
    }

    pub fn get_mut(&mut self, uuid: &DeviceId) -> Option<&mut RemoteDevice> {
        self.devices.get_mut(uuid)
    }

    pub fn contains(&self, uuid: &DeviceId) -> bool {
        self.devices.contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Refresh last-seen of a known device
    pub fn touch(&mut self, uuid: &DeviceId) {
        if let Some(device) = self.devices.get_mut(uuid) {
            device.touch();
        }
    }

    /// Mark a received sequence in the device's echo window
    pub fn add_sequence(&mut self, uuid: &DeviceId, sequence: u32) -> Option<u8> {
        let device = self.devices.get_mut(uuid)?;
        let changed = device.add_sequence(sequence);
        let tq = device.current_tq();
        if changed {
            self.notify_updated(uuid);
        }
        Some(tq)
    }

    /// Open `sequence` in every neighbour's echo window
    pub fn slide_neighbour_windows(&mut self, sequence: u32) {
        let mut changed = Vec::new();
        for device in self.devices.values_mut().filter(|d| d.is_neighbour()) {
            if device.slide_sequence(sequence) {
                changed.push(device.uuid().clone());
            }
        }
        for uuid in changed {
            self.notify_updated(&uuid);
        }
    }

    /// Add inbound byte counters to a device; returns its updated projection
    pub fn record_received(&mut self, uuid: &DeviceId, bytes: usize) -> Option<MeshDevice> {
        let device = self.devices.get_mut(uuid)?;
        device.record_received(bytes);
        let projection = device.mesh_device();
        self.notify(DeviceEvent::Updated, &projection);
        Some(projection)
    }

    /// Offer path quality `tq` toward `dest` through neighbour `via`.
    /// Returns true when the best route switched.
    pub fn offer_route(&mut self, dest: &DeviceId, via: &DeviceId, tq: u8) -> bool {
        if !self.devices.get(via).map_or(false, |d| d.is_neighbour()) {
            return false;
        }
        match self.devices.get_mut(dest) {
            Some(device) => {
                let switched = device.offer_route(via, tq);
                if switched {
                    debug!("Best route to {} now via {} (tq {})", dest, via, tq);
                }
                switched
            }
            None => false,
        }
    }

    /// The live neighbour to hand a message for `dest` to
    pub fn best_next_hop(&self, dest: &DeviceId) -> Option<&RemoteDevice> {
        let device = self.devices.get(dest)?;
        let via = match device.best_route() {
            Some(route) => &route.via,
            None if device.is_neighbour() => dest,
            None => return None,
        };
        self.devices.get(via).filter(|hop| hop.is_neighbour())
    }

    /// Delete a device entirely, along with every route through it
    pub fn remove(&mut self, uuid: &DeviceId) -> Option<RemoteDevice> {
        let removed = self.devices.remove(uuid)?;
        for device in self.devices.values_mut() {
            device.drop_routes_via(uuid);
        }
        info!("Removed device {}", uuid);
        self.notify(DeviceEvent::Removed, &removed.mesh_device());
        Some(removed)
    }

    /// Demote a neighbour whose link went away. The device stays known while some
    /// other neighbour still advertises a route to it; otherwise it is removed.
    /// Returns the released link so the caller can close it.
    pub fn remove_as_neighbour(&mut self, uuid: &DeviceId) -> Option<Arc<dyn Link>> {
        let link = self.devices.get_mut(uuid)?.release_link();

        for device in self.devices.values_mut() {
            device.drop_routes_via(uuid);
        }

        let still_reachable = self.devices.get(uuid).map_or(false, |d| d.has_route());
        if still_reachable {
            info!("Device {} demoted from neighbour, still reachable", uuid);
            self.notify_updated(uuid);
        } else {
            self.remove(uuid);
        }
        link
    }

    /// Demote every neighbour and forget the devices only they led to.
    /// Returns the released links so the caller can close them.
    pub fn release_neighbours(&mut self) -> Vec<Arc<dyn Link>> {
        let ids: Vec<DeviceId> = self.neighbours().iter().map(|d| d.uuid().clone()).collect();
        let links = ids.iter().filter_map(|uuid| self.remove_as_neighbour(uuid)).collect();

        let stranded: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|d| !d.has_route())
            .map(|d| d.uuid().clone())
            .collect();
        for uuid in &stranded {
            self.remove(uuid);
        }
        links
    }

    /// Direct links only, ordered by identity
    pub fn neighbours(&self) -> Vec<&RemoteDevice> {
        let mut neighbours: Vec<_> = self.devices.values().filter(|d| d.is_neighbour()).collect();
        neighbours.sort_by(|a, b| a.uuid().cmp(b.uuid()));
        neighbours
    }

    pub fn remote_devices(&self) -> impl Iterator<Item = &RemoteDevice> {
        self.devices.values()
    }

    pub fn reachable_mesh_devices(&self) -> Vec<MeshDevice> {
        let mut devices: Vec<_> = self.devices.values().map(|d| d.mesh_device()).collect();
        devices.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        devices
    }

    /// Devices not heard from within their expiration. Does not mutate.
    pub fn expired_remote_devices(&self) -> Vec<DeviceId> {
        let now = Instant::now();
        self.devices
            .values()
            .filter(|d| d.is_expired(now, self.device_expiration))
            .map(|d| d.uuid().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct NullLink;

    impl Link for NullLink {
        fn send(&self, _frame: Vec<u8>) -> Result<(), LinkError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl MeshHandlerCallback for Recorder {
        fn on_device_added(&self, device: &MeshDevice) {
            self.events.lock().push(format!("added {}", device.uuid));
        }

        fn on_device_updated(&self, device: &MeshDevice) {
            self.events.lock().push(format!("updated {}", device.uuid));
        }

        fn on_device_removed(&self, device: &MeshDevice) {
            self.events.lock().push(format!("removed {}", device.uuid));
        }
    }

    fn id(s: &str) -> DeviceId {
        DeviceId::new(s).unwrap()
    }

    fn neighbour(s: &str) -> RemoteDevice {
        RemoteDevice::new(id(s), s, 12).with_link(Arc::new(NullLink))
    }

    fn table_with_recorder() -> (RoutingTable, Arc<Recorder>) {
        let mut table = RoutingTable::new(Duration::from_secs(200));
        let recorder = Arc::new(Recorder::default());
        table.register_mesh_handler_callback(recorder.clone());
        (table, recorder)
    }

    #[test]
    fn test_ensure_connection_is_idempotent() {
        let (mut table, recorder) = table_with_recorder();
        table.ensure_connection(neighbour("B"), &id("B"));
        table.ensure_connection(neighbour("B"), &id("B"));

        assert_eq!(table.len(), 1);
        assert_eq!(table.neighbours().len(), 1);
        assert_eq!(*recorder.events.lock(), vec!["added B".to_string()]);
    }

    #[test]
    fn test_reconnect_swaps_neighbour_link() {
        let (mut table, recorder) = table_with_recorder();
        let first: Arc<dyn Link> = Arc::new(NullLink);
        let second: Arc<dyn Link> = Arc::new(NullLink);

        let device = RemoteDevice::new(id("B"), "B", 12).with_link(first.clone());
        assert!(table.ensure_connection(device, &id("B")).is_none());

        let device = RemoteDevice::new(id("B"), "B", 12).with_link(second.clone());
        let replaced = table.ensure_connection(device, &id("B")).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));

        let held = table.get(&id("B")).and_then(|d| d.link()).unwrap();
        assert!(Arc::ptr_eq(held, &second));
        // same handle again is not a replacement
        let device = RemoteDevice::new(id("B"), "B", 12).with_link(second);
        assert!(table.ensure_connection(device, &id("B")).is_none());
        assert_eq!(*recorder.events.lock(), vec!["added B".to_string()]);
    }

    #[test]
    fn test_release_neighbours_empties_table() {
        let (mut table, recorder) = table_with_recorder();
        table.ensure_connection(neighbour("B"), &id("B"));
        table.ensure_connection(neighbour("C"), &id("C"));
        table.ensure_connection(RemoteDevice::new(id("D"), "D", 12), &id("B"));
        table.offer_route(&id("D"), &id("B"), 200);
        recorder.events.lock().clear();

        let links = table.release_neighbours();
        assert_eq!(links.len(), 2);
        assert!(table.is_empty());
        assert!(table.neighbours().is_empty());

        let events = recorder.events.lock();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.starts_with("removed")));
    }

    #[test]
    fn test_indirect_device_is_not_neighbour() {
        let (mut table, _) = table_with_recorder();
        table.ensure_connection(neighbour("B"), &id("B"));
        table.ensure_connection(neighbour("D"), &id("B"));

        assert!(table.contains(&id("D")));
        assert!(!table.get(&id("D")).unwrap().is_neighbour());
        let names: Vec<_> = table.neighbours().iter().map(|d| d.uuid().clone()).collect();
        assert_eq!(names, vec![id("B")]);
    }

    #[test]
    fn test_best_next_hop_prefers_strictly_better_route() {
        let (mut table, _) = table_with_recorder();
        table.ensure_connection(neighbour("B"), &id("B"));
        table.ensure_connection(neighbour("C"), &id("C"));
        table.ensure_connection(RemoteDevice::new(id("D"), "D", 12), &id("B"));

        assert!(table.offer_route(&id("D"), &id("B"), 80));
        assert!(!table.offer_route(&id("D"), &id("C"), 80));
        assert_eq!(table.best_next_hop(&id("D")).unwrap().uuid(), &id("B"));

        assert!(table.offer_route(&id("D"), &id("C"), 90));
        assert_eq!(table.best_next_hop(&id("D")).unwrap().uuid(), &id("C"));

        // direct neighbour without advertisements routes to itself
        assert_eq!(table.best_next_hop(&id("B")).unwrap().uuid(), &id("B"));
    }

    #[test]
    fn test_offer_route_requires_live_neighbour() {
        let (mut table, _) = table_with_recorder();
        table.ensure_connection(RemoteDevice::new(id("D"), "D", 12), &id("X"));
        assert!(!table.offer_route(&id("D"), &id("X"), 200));
        assert!(table.best_next_hop(&id("D")).is_none());
    }

    #[test]
    fn test_remove_fires_once_and_drops_routes() {
        let (mut table, recorder) = table_with_recorder();
        table.ensure_connection(neighbour("B"), &id("B"));
        table.ensure_connection(RemoteDevice::new(id("D"), "D", 12), &id("B"));
        table.offer_route(&id("D"), &id("B"), 100);

        assert!(table.remove(&id("B")).is_some());
        assert!(table.remove(&id("B")).is_none());

        let removals = recorder
            .events
            .lock()
            .iter()
            .filter(|e| e.as_str() == "removed B")
            .count();
        assert_eq!(removals, 1);
        assert!(table.contains(&id("D")));
        assert!(table.best_next_hop(&id("D")).is_none());
    }

    #[test]
    fn test_remove_as_neighbour_keeps_device_with_alternate_route() {
        let (mut table, recorder) = table_with_recorder();
        table.ensure_connection(neighbour("B"), &id("B"));
        table.ensure_connection(neighbour("C"), &id("C"));
        table.offer_route(&id("B"), &id("B"), 200);
        table.offer_route(&id("B"), &id("C"), 100);

        assert!(table.remove_as_neighbour(&id("B")).is_some());
        let b = table.get(&id("B")).unwrap();
        assert!(!b.is_neighbour());
        assert_eq!(b.best_route().unwrap().via, id("C"));
        assert_eq!(table.best_next_hop(&id("B")).unwrap().uuid(), &id("C"));

        assert!(table.remove_as_neighbour(&id("C")).is_some());
        assert!(!table.contains(&id("C")));
        assert!(recorder.events.lock().contains(&"removed C".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_devices() {
        let (mut table, _) = table_with_recorder();
        table.ensure_connection(neighbour("B"), &id("B"));
        tokio::time::advance(Duration::from_secs(150)).await;
        table.ensure_connection(neighbour("C"), &id("C"));
        assert!(table.expired_remote_devices().is_empty());

        tokio::time::advance(Duration::from_secs(51)).await;
        assert_eq!(table.expired_remote_devices(), vec![id("B")]);
        // read-only
        assert!(table.contains(&id("B")));
    }
}
