//! Wire Protocol Module
//!
//! Device identities and the binary frame format exchanged between mesh nodes.

pub mod device_id;
pub mod message;

pub use device_id::DeviceId;
pub use message::{Destination, Message, MessageType, MAX_TTL, MIN_HEADER_SIZE};
