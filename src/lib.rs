//! OGM Mesh - Self-Organizing Mesh Routing Core
//!
//! Originator-message (BATMAN-style) routing for short-range peer links.
//! Each node periodically floods a small advertisement; neighbours rebroadcast
//! it with a decremented ttl and a penalised transmit quality, so every node
//! learns which direct neighbour is the best next hop toward every other node.
//! Unicast payloads then travel hop by hop along those routes.
//!
//! The transport is pluggable: a link layer reports neighbours and raw frames
//! through [`LayerCallback`] and sends through [`Link`]. Applications observe
//! the mesh through [`MeshHandlerCallback`].

pub mod config;
pub mod error;
pub mod link;
pub mod mesh;
pub mod protocol;
pub mod routing;
pub mod stats;

pub use config::MeshConfig;
pub use error::{ConfigError, Error, LinkError, ParseError, Result, RoutingError};
pub use link::{Link, LoopbackLink, LoopbackNetwork};
pub use mesh::{ChannelCallback, LayerCallback, MeshEvent, MeshHandler, MeshHandlerCallback};
pub use protocol::{Destination, DeviceId, Message, MessageType};
pub use routing::{MeshDevice, RemoteDevice, Router, RoutingTable};
pub use stats::{NetworkStats, StatsItem, StatsResult, StatsSnapshot};
