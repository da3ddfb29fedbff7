//! Network Statistics
//!
//! Rolling per-direction message counters. Each direction keeps at most
//! `capacity` time buckets; rolling the window opens a fresh bucket and
//! evicts the oldest, whose counts are lost.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::protocol::Message;

/// Counts for one time bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsItem {
    pub timestamp: DateTime<Utc>,
    pub message_count: u64,
    pub message_size: u64,
}

impl StatsItem {
    fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            message_count: 0,
            message_size: 0,
        }
    }
}

/// Immutable copy of one direction's window, oldest bucket first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub items: Vec<StatsItem>,
}

impl StatsSnapshot {
    pub fn total_messages(&self) -> u64 {
        self.items.iter().map(|item| item.message_count).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.items.iter().map(|item| item.message_size).sum()
    }

    /// The bucket currently being filled
    pub fn latest(&self) -> Option<&StatsItem> {
        self.items.last()
    }
}

/// Snapshot of all four windows, delivered to the application every stats interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsResult {
    pub generated_at: DateTime<Utc>,
    pub ogm_incoming: StatsSnapshot,
    pub ogm_outgoing: StatsSnapshot,
    pub ucm_incoming: StatsSnapshot,
    pub ucm_outgoing: StatsSnapshot,
}

#[derive(Debug)]
struct StatsWindow {
    items: VecDeque<StatsItem>,
    capacity: usize,
}

impl StatsWindow {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn update_ts(&mut self, timestamp: DateTime<Utc>) {
        self.items.push_back(StatsItem::new(timestamp));
        while self.items.len() > self.capacity {
            self.items.pop_front();
        }
    }

    fn add(&mut self, bytes: usize) {
        if self.items.is_empty() {
            self.update_ts(Utc::now());
        }
        if let Some(item) = self.items.back_mut() {
            item.message_count += 1;
            item.message_size += bytes as u64;
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            items: self.items.iter().copied().collect(),
        }
    }
}

#[derive(Debug)]
struct Directions {
    incoming: StatsWindow,
    outgoing: StatsWindow,
}

/// Incoming and outgoing counters for one message class
#[derive(Debug)]
pub struct NetworkStats {
    inner: Mutex<Directions>,
}

impl NetworkStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Directions {
                incoming: StatsWindow::new(capacity),
                outgoing: StatsWindow::new(capacity),
            }),
        }
    }

    pub fn add_incoming_message(&self, message: &Message) {
        self.inner.lock().incoming.add(message.wire_len());
    }

    pub fn add_outgoing_message(&self, message: &Message) {
        self.inner.lock().outgoing.add(message.wire_len());
    }

    /// Roll both windows forward, opening a bucket stamped `timestamp`
    pub fn update_ts(&self, timestamp: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.incoming.update_ts(timestamp);
        inner.outgoing.update_ts(timestamp);
    }

    pub fn incoming_stat(&self) -> StatsSnapshot {
        self.inner.lock().incoming.snapshot()
    }

    pub fn outgoing_stat(&self) -> StatsSnapshot {
        self.inner.lock().outgoing.snapshot()
    }
}
