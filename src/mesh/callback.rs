//! Mesh Callbacks
//!
//! The two seams around the routing core: [`LayerCallback`] is what a link
//! layer drives, [`MeshHandlerCallback`] is what the application observes.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::link::Link;
use crate::protocol::DeviceId;
use crate::routing::MeshDevice;
use crate::stats::StatsResult;

/// Application observer of the mesh.
///
/// All methods default to no-ops. Device notifications are delivered while the
/// routing core is locked, so implementations must not call back into the
/// handler synchronously; hand work off to a channel or task instead.
pub trait MeshHandlerCallback: Send + Sync {
    /// A unicast payload addressed to this node arrived
    fn on_message_received(&self, _payload: &[u8], _source: &MeshDevice) {}

    fn on_device_added(&self, _device: &MeshDevice) {}

    fn on_device_updated(&self, _device: &MeshDevice) {}

    fn on_device_removed(&self, _device: &MeshDevice) {}

    fn on_network_stats_updated(&self, _stats: &StatsResult) {}
}

/// Events a link layer reports to the routing core
pub trait LayerCallback: Send + Sync {
    /// A direct connection came up; `link` sends to that neighbour
    fn on_device_added(&self, uuid: DeviceId, name: String, link: Arc<dyn Link>);

    /// A direct connection went away
    fn on_device_removed(&self, uuid: &DeviceId);

    /// One raw frame arrived from any neighbour
    fn on_message_received(&self, bytes: &[u8]);

    /// The transport could not deliver to `uuid`
    fn on_link_failure(&self, uuid: &DeviceId);
}

/// Owned copy of a [`MeshHandlerCallback`] notification
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    MessageReceived { payload: Vec<u8>, source: MeshDevice },
    DeviceAdded(MeshDevice),
    DeviceUpdated(MeshDevice),
    DeviceRemoved(MeshDevice),
    NetworkStatsUpdated(StatsResult),
}

/// Forwards every notification into an unbounded channel.
///
/// Sending never blocks, so it is safe to register while the core lock is held.
/// Events are discarded once the receiver is dropped.
#[derive(Debug, Clone)]
pub struct ChannelCallback {
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl ChannelCallback {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.tx.send(event);
    }
}

impl MeshHandlerCallback for ChannelCallback {
    fn on_message_received(&self, payload: &[u8], source: &MeshDevice) {
        self.emit(MeshEvent::MessageReceived {
            payload: payload.to_vec(),
            source: source.clone(),
        });
    }

    fn on_device_added(&self, device: &MeshDevice) {
        self.emit(MeshEvent::DeviceAdded(device.clone()));
    }

    fn on_device_updated(&self, device: &MeshDevice) {
        self.emit(MeshEvent::DeviceUpdated(device.clone()));
    }

    fn on_device_removed(&self, device: &MeshDevice) {
        self.emit(MeshEvent::DeviceRemoved(device.clone()));
    }

    fn on_network_stats_updated(&self, stats: &StatsResult) {
        self.emit(MeshEvent::NetworkStatsUpdated(stats.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;

    impl MeshHandlerCallback for Silent {}

    #[test]
    fn test_default_methods_are_no_ops() {
        let device = MeshDevice::unknown(DeviceId::new("A").unwrap());
        let callback: Arc<dyn MeshHandlerCallback> = Arc::new(Silent);
        callback.on_device_added(&device);
        callback.on_message_received(b"hi", &device);
    }

    #[test]
    fn test_channel_callback_forwards_events() {
        let (callback, mut rx) = ChannelCallback::new();
        let device = MeshDevice::unknown(DeviceId::new("A").unwrap());

        callback.on_device_added(&device);
        callback.on_message_received(b"hello", &device);

        assert_eq!(rx.try_recv().unwrap(), MeshEvent::DeviceAdded(device.clone()));
        assert_eq!(
            rx.try_recv().unwrap(),
            MeshEvent::MessageReceived {
                payload: b"hello".to_vec(),
                source: device,
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_callback_survives_dropped_receiver() {
        let (callback, rx) = ChannelCallback::new();
        drop(rx);
        callback.on_device_removed(&MeshDevice::unknown(DeviceId::new("A").unwrap()));
    }
}
