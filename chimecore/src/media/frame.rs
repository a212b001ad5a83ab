use bytes::Bytes;

use super::FRAME_DURATION;

/// Audio codecs the client can send and receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Codec {
    /// G.711 μ-law, 8 kHz.
    #[default]
    Pcmu,
    /// G.711 A-law, 8 kHz.
    Pcma,
    /// Linear 16-bit big-endian PCM, 16 kHz mono.
    L16,
}

impl Codec {
    /// Offer order: most preferred first.
    pub const ALL: [Codec; 3] = [Codec::Pcmu, Codec::Pcma, Codec::L16];

    pub const fn payload_type(self) -> u8 {
        match self {
            Self::Pcmu => 0,
            Self::Pcma => 8,
            Self::L16 => 96,
        }
    }

    pub const fn clock_rate(self) -> u32 {
        match self {
            Self::Pcmu | Self::Pcma => 8_000,
            Self::L16 => 16_000,
        }
    }

    pub const fn encoding_name(self) -> &'static str {
        match self {
            Self::Pcmu => "PCMU",
            Self::Pcma => "PCMA",
            Self::L16 => "L16",
        }
    }

    pub fn from_encoding(name: &str, clock_rate: u32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.encoding_name().eq_ignore_ascii_case(name) && c.clock_rate() == clock_rate)
    }

    /// Samples in one [`FRAME_DURATION`] at this codec's clock rate.
    pub fn samples_per_frame(self) -> usize {
        (self.clock_rate() as u128 * FRAME_DURATION.as_millis() / 1000) as usize
    }
}

impl TryFrom<u8> for Codec {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pcmu),
            8 => Ok(Self::Pcma),
            96 => Ok(Self::L16),
            _ => Err(value),
        }
    }
}

/// One encoded audio frame moving along the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub sequence: u16,
    /// RTP timestamp in codec clock units.
    pub timestamp: u32,
    pub ssrc: u32,
    pub codec: Codec,
    pub payload: Bytes,
}
