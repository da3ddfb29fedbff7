//! Link Layer Boundary
//!
//! The routing core never talks to a radio directly. Each direct neighbour
//! is reached through a [`Link`] handed over by the transport when the
//! connection comes up.

pub mod loopback;

pub use loopback::{LoopbackLink, LoopbackNetwork};

use std::fmt::Debug;

use crate::error::LinkError;

/// Send capability for one direct neighbour.
///
/// Sends are fire-and-forget: implementations queue the frame and return
/// immediately, owning retry and backpressure themselves. A failure is a hint
/// that the neighbour may be stale, never a fatal error.
pub trait Link: Send + Sync + Debug {
    /// Queue one encoded frame for transmission
    fn send(&self, frame: Vec<u8>) -> Result<(), LinkError>;

    /// Release transport resources. Called once when the neighbour is purged or dropped.
    fn close(&self) {}
}
