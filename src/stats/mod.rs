//! Traffic Statistics Module

pub mod network_stats;

pub use network_stats::{NetworkStats, StatsItem, StatsResult, StatsSnapshot};
