//! Remote Device State
//!
//! Per-device bookkeeping for every node this one can reach, directly or
//! through neighbours: last-seen time, echo window, TQ and route candidates.

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::sliding_window::EchoSlidingWindow;
use crate::error::LinkError;
use crate::link::Link;
use crate::protocol::{DeviceId, Message};

/// Link failures beyond this count no longer shorten expiry
pub const MAX_LINK_FAILURES: u32 = 4;

/// Application-facing projection of a remote device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshDevice {
    pub uuid: DeviceId,
    pub name: String,
    pub tq: u8,
    pub is_neighbour: bool,
    pub received_size: u64,
    pub received_messages: u64,
    pub last_seen: DateTime<Utc>,
}

impl MeshDevice {
    /// Projection for a sender the routing table does not (or no longer) know
    pub fn unknown(uuid: DeviceId) -> Self {
        Self {
            name: uuid.to_string(),
            uuid,
            tq: 0,
            is_neighbour: false,
            received_size: 0,
            received_messages: 0,
            last_seen: Utc::now(),
        }
    }
}

/// Path quality toward a device through one direct neighbour
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub via: DeviceId,
    pub tq: u8,
}

/// A node reachable from here
#[derive(Debug, Clone)]
pub struct RemoteDevice {
    uuid: DeviceId,
    name: String,
    last_seen: Instant,
    last_seen_at: DateTime<Utc>,
    echo_window: EchoSlidingWindow,
    current_tq: u8,
    routes: Vec<Route>,
    best_via: Option<DeviceId>,
    received_size: u64,
    received_messages: u64,
    link_failures: u32,
    link: Option<Arc<dyn Link>>,
}

impl RemoteDevice {
    pub fn new(uuid: DeviceId, name: impl Into<String>, window_size: usize) -> Self {
        Self {
            uuid,
            name: name.into(),
            last_seen: Instant::now(),
            last_seen_at: Utc::now(),
            echo_window: EchoSlidingWindow::new(window_size),
            current_tq: 0,
            routes: Vec::new(),
            best_via: None,
            received_size: 0,
            received_messages: 0,
            link_failures: 0,
            link: None,
        }
    }

    /// Attach the send capability of a direct neighbour
    pub fn with_link(mut self, link: Arc<dyn Link>) -> Self {
        self.link = Some(link);
        self
    }

    pub fn uuid(&self) -> &DeviceId {
        &self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn current_tq(&self) -> u8 {
        self.current_tq
    }

    pub fn echo_window(&self) -> &EchoSlidingWindow {
        &self.echo_window
    }

    /// Directly linked devices carry a link handle
    pub fn is_neighbour(&self) -> bool {
        self.link.is_some()
    }

    pub fn link_failures(&self) -> u32 {
        self.link_failures
    }

    /// Refresh last-seen; inbound traffic also clears link failure hints
    pub fn touch(&mut self) {
        let now = Instant::now();
        if now > self.last_seen {
            self.last_seen = now;
        }
        self.last_seen_at = Utc::now();
        self.link_failures = 0;
    }

    /// Record a received sequence. Returns true when the TQ changed.
    pub fn add_sequence(&mut self, sequence: u32) -> bool {
        self.echo_window.add_sequence(sequence);
        self.refresh_tq()
    }

    /// Open the slot for a sequence we expect to hear echoed. Returns true when the TQ changed.
    pub fn slide_sequence(&mut self, sequence: u32) -> bool {
        self.echo_window.slide_sequence(sequence);
        self.refresh_tq()
    }

    fn refresh_tq(&mut self) -> bool {
        let tq = self.echo_window.tq();
        let changed = tq != self.current_tq;
        self.current_tq = tq;
        changed
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.received_size += bytes as u64;
        self.received_messages += 1;
    }

    pub fn note_link_failure(&mut self) {
        self.link_failures = (self.link_failures + 1).min(MAX_LINK_FAILURES);
    }

    /// Expiration shortened by recent link failures
    pub fn effective_expiration(&self, base: Duration) -> Duration {
        base / (self.link_failures + 1)
    }

    pub fn is_expired(&self, now: Instant, base: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > self.effective_expiration(base)
    }

    pub(crate) fn adopt_link(&mut self, link: Arc<dyn Link>) {
        self.link = Some(link);
    }

    pub(crate) fn release_link(&mut self) -> Option<Arc<dyn Link>> {
        self.link.take()
    }

    pub fn link(&self) -> Option<&Arc<dyn Link>> {
        self.link.as_ref()
    }

    /// Encode and hand the message to this neighbour's link. Returns bytes sent.
    pub fn send_message(&self, message: &Message) -> Result<usize, LinkError> {
        let link = self.link.as_ref().ok_or(LinkError::Closed)?;
        let frame = message.to_bytes();
        let len = frame.len();
        link.send(frame).map_err(|e| {
            warn!("Failed to send {} to {}: {}", message, self.uuid, e);
            e
        })?;
        Ok(len)
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn best_route(&self) -> Option<&Route> {
        let via = self.best_via.as_ref()?;
        self.routes.iter().find(|route| &route.via == via)
    }

    pub fn has_route(&self) -> bool {
        self.best_via.is_some()
    }

    /// Record path quality via `via`. The best route only switches to a strictly
    /// better candidate; ties keep the current route. Returns true when it switched.
    pub fn offer_route(&mut self, via: &DeviceId, tq: u8) -> bool {
        match self.routes.iter_mut().find(|route| &route.via == via) {
            Some(route) => route.tq = tq,
            None => self.routes.push(Route { via: via.clone(), tq }),
        }

        let current = self.best_route().map(|route| (route.via.clone(), route.tq));
        match current {
            None => {
                self.best_via = Some(via.clone());
                true
            }
            Some((best, best_tq)) if &best != via && tq > best_tq => {
                self.best_via = Some(via.clone());
                true
            }
            _ => false,
        }
    }

    /// Forget every route through `via`. Returns true when the best route changed.
    pub fn drop_routes_via(&mut self, via: &DeviceId) -> bool {
        let before = self.routes.len();
        self.routes.retain(|route| &route.via != via);
        if self.routes.len() == before || self.best_via.as_ref() != Some(via) {
            return false;
        }

        // first maximum wins so the choice is stable
        let mut best: Option<&Route> = None;
        for route in &self.routes {
            if best.map_or(true, |b| route.tq > b.tq) {
                best = Some(route);
            }
        }
        self.best_via = best.map(|route| route.via.clone());
        true
    }

    pub fn mesh_device(&self) -> MeshDevice {
        MeshDevice {
            uuid: self.uuid.clone(),
            name: self.name.clone(),
            tq: self.current_tq,
            is_neighbour: self.is_neighbour(),
            received_size: self.received_size,
            received_messages: self.received_messages,
            last_seen: self.last_seen_at,
        }
    }
}
