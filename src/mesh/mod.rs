//! Mesh Node Module
//!
//! The orchestrating handler plus the callback seams toward the link layer
//! and the application.

pub mod callback;
pub mod handler;

pub use callback::{ChannelCallback, LayerCallback, MeshEvent, MeshHandlerCallback};
pub use handler::MeshHandler;
