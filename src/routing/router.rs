//! Message Router
//!
//! Routing decisions for inbound and locally originated messages:
//! OGM flooding with TTL and TQ decay, echo tracking, best-route bookkeeping
//! and unicast forwarding toward the best next hop.

use log::{debug, trace, warn};
use std::sync::Arc;

use super::remote_device::RemoteDevice;
use super::routing_table::RoutingTable;
use crate::config::MeshConfig;
use crate::error::RoutingError;
use crate::protocol::{Destination, DeviceId, Message, MessageType};
use crate::stats::NetworkStats;

pub struct Router {
    uuid: DeviceId,
    hop_penalty: u8,
    window_size: usize,
    ogm_stats: Arc<NetworkStats>,
    ucm_stats: Arc<NetworkStats>,
}

impl Router {
    pub fn new(
        uuid: DeviceId,
        config: &MeshConfig,
        ogm_stats: Arc<NetworkStats>,
        ucm_stats: Arc<NetworkStats>,
    ) -> Self {
        Self {
            uuid,
            hop_penalty: config.hop_penalty,
            window_size: config.sliding_window_size,
            ogm_stats,
            ucm_stats,
        }
    }

    pub fn uuid(&self) -> &DeviceId {
        &self.uuid
    }

    /// Route one message against the table.
    ///
    /// * OGM: `Some(forwarded)` when the advertisement was propagated, `None` when
    ///   it was absorbed (echo, ttl or tq exhausted). Never for local delivery.
    /// * UCM: the unchanged message when addressed to this node, otherwise the
    ///   forwarded copy already handed to the next hop.
    pub fn route_message(
        &self,
        table: &mut RoutingTable,
        message: Message,
    ) -> Result<Option<Message>, RoutingError> {
        match message.message_type() {
            MessageType::Ogm => self.route_ogm(table, message),
            MessageType::Ucm => self.route_ucm(table, message),
        }
    }

    fn route_ogm(
        &self,
        table: &mut RoutingTable,
        message: Message,
    ) -> Result<Option<Message>, RoutingError> {
        if message.source() == &self.uuid {
            if message.previous_hop() == &self.uuid {
                self.broadcast(table, &message, None);
                return Ok(Some(message));
            }
            self.handle_echo(table, &message)?;
            return Ok(None);
        }

        let via = message.previous_hop().clone();
        if !table.get(&via).map_or(false, |d| d.is_neighbour()) {
            return Err(RoutingError::UnknownPreviousHop(via));
        }
        table.touch(&via);

        let source = message.source().clone();
        table.ensure_connection(
            RemoteDevice::new(source.clone(), source.to_string(), self.window_size),
            &via,
        );
        table.add_sequence(&source, message.sequence());

        let link_tq = table.get(&via).map_or(0, |d| d.current_tq());
        let path_tq = (u16::from(message.tq()) * u16::from(link_tq) / 255) as u8;
        table.offer_route(&source, &via, path_tq);

        let forwarded_tq = message.tq().saturating_sub(self.hop_penalty);
        if forwarded_tq == 0 {
            trace!("Dropping {}: tq exhausted", message);
            return Ok(None);
        }
        let Some(forwarded) = message.forwarded(&self.uuid, forwarded_tq) else {
            trace!("Dropping {}: ttl exhausted", message);
            return Ok(None);
        };

        self.broadcast(table, &forwarded, Some(&via));
        Ok(Some(forwarded))
    }

    /// Our own advertisement came back through neighbour `previous_hop`
    fn handle_echo(&self, table: &mut RoutingTable, message: &Message) -> Result<(), RoutingError> {
        let via = message.previous_hop();
        match table.add_sequence(via, message.sequence()) {
            Some(tq) => {
                table.touch(via);
                debug!("Echo of seq {} via {}, link tq {}", message.sequence(), via, tq);
                Ok(())
            }
            None => Err(RoutingError::UnknownPreviousHop(via.clone())),
        }
    }

    fn route_ucm(
        &self,
        table: &mut RoutingTable,
        message: Message,
    ) -> Result<Option<Message>, RoutingError> {
        let destination = match message.destination() {
            Destination::Device(id) => id.clone(),
            Destination::Broadcast => return Err(RoutingError::UnsupportedDestination),
        };

        if message.source() != &self.uuid {
            table.touch(message.source());
            table.touch(message.previous_hop());
        }

        if destination == self.uuid {
            return Ok(Some(message));
        }

        let next_hop = table
            .best_next_hop(&destination)
            .ok_or_else(|| RoutingError::NoRoute(destination.clone()))?;
        let forwarded = message
            .forwarded(&self.uuid, message.tq())
            .ok_or_else(|| RoutingError::TtlExhausted(destination.clone()))?;

        let hop = next_hop.uuid().clone();
        debug!("Forwarding {} to next hop {}", forwarded, hop);
        if !self.transmit(next_hop, &forwarded) {
            if let Some(device) = table.get_mut(&hop) {
                device.note_link_failure();
            }
        }
        Ok(Some(forwarded))
    }

    /// Send to every neighbour except `exclude`
    fn broadcast(&self, table: &mut RoutingTable, message: &Message, exclude: Option<&DeviceId>) {
        let failed: Vec<DeviceId> = table
            .neighbours()
            .into_iter()
            .filter(|n| Some(n.uuid()) != exclude)
            .filter(|n| !self.transmit(n, message))
            .map(|n| n.uuid().clone())
            .collect();

        for uuid in failed {
            if let Some(device) = table.get_mut(&uuid) {
                device.note_link_failure();
            }
        }
    }

    fn transmit(&self, device: &RemoteDevice, message: &Message) -> bool {
        match device.send_message(message) {
            Ok(_) => {
                self.stats_for(message.message_type()).add_outgoing_message(message);
                true
            }
            Err(e) => {
                warn!("Link to {} failed: {}", device.uuid(), e);
                false
            }
        }
    }

    fn stats_for(&self, message_type: MessageType) -> &NetworkStats {
        match message_type {
            MessageType::Ogm => &self.ogm_stats,
            MessageType::Ucm => &self.ucm_stats,
        }
    }
}
