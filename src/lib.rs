//! Native meeting signaling client.
//!
//! Protocol logic lives in [`chimecore`], which has no runtime. This crate adds
//! the tokio pieces around it: the websocket connector, the client actor that
//! drives the signaling state machine, the file-backed media pipeline and the
//! session controller the binary runs.

pub use chimecore;

pub mod client;
pub mod connector;
pub mod controller;
pub mod media;
pub mod transport;
