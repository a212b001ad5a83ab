//! Protobuf frames of the meeting signaling protocol.
//!
//! The generated module is kept in version control; see `build.rs`.

pub mod signal_rtc;

pub use prost::Message;
