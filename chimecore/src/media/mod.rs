//! Codec-level media processing. Everything here is synchronous and
//! allocation-light so the runtime tasks in the binary can drive it.

pub mod codec;
pub mod frame;
pub mod jitter;
pub mod packetizer;
pub mod resample;
pub mod rtp;

pub use frame::{Codec, MediaFrame};
pub use jitter::{JitterBuffer, JitterBufferConfig, JitterStats};
pub use packetizer::Packetizer;
pub use rtp::{RtpHeader, RtpPacket};

use std::time::Duration;

/// Duration of audio carried by one media frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
