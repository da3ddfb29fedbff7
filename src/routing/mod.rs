//! Routing Module
//!
//! Originator-message routing: per-device state, the routing table and the
//! router that makes forwarding decisions against it.

pub mod remote_device;
pub mod router;
pub mod routing_table;
pub mod sliding_window;

pub use remote_device::{MeshDevice, RemoteDevice, Route, MAX_LINK_FAILURES};
pub use router::Router;
pub use routing_table::RoutingTable;
pub use sliding_window::EchoSlidingWindow;
