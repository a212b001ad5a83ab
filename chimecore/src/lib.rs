pub use chimeproto as proto;

pub mod backoff;
pub mod envelope;
pub mod error;
pub mod media;
pub mod net;
pub mod sdp;
pub mod session;
pub mod signaling;
pub mod state;

/// Version string reported in the JOIN client details.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Client source reported in the JOIN client details.
pub const CLIENT_SOURCE: &str = "amazon-chime-sdk-rust";
