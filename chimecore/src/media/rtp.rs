//! RTP (RFC 3550) packets as carried inside media envelopes.

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::{Codec, MediaFrame};
use crate::error::ProtocolError;

pub const RTP_VERSION: u8 = 2;

/// Fixed header size without CSRCs or extensions.
pub const RTP_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
        }
    }

    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    pub fn size(&self) -> usize {
        RTP_HEADER_LEN + self.csrc.len() * 4
    }

    fn write(&self, buf: &mut BytesMut) {
        // V=2, no padding, no extension.
        buf.put_u8((RTP_VERSION << 6) | (self.csrc.len() as u8 & 0x0F));
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.size() + self.payload.len());
        self.header.write(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parses a packet, skipping header extensions and trailing padding.
    pub fn decode(buf: Bytes) -> Result<Self, ProtocolError> {
        if buf.len() < RTP_HEADER_LEN {
            return Err(ProtocolError::Rtp("shorter than fixed header"));
        }
        let version = buf[0] >> 6;
        if version != RTP_VERSION {
            return Err(ProtocolError::Rtp("unsupported rtp version"));
        }
        let padding = buf[0] & 0x20 != 0;
        let extension = buf[0] & 0x10 != 0;
        let csrc_count = (buf[0] & 0x0F) as usize;

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if buf.len() < offset {
            return Err(ProtocolError::Rtp("truncated csrc list"));
        }
        let csrc = buf[RTP_HEADER_LEN..offset]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        if extension {
            if buf.len() < offset + 4 {
                return Err(ProtocolError::Rtp("truncated extension header"));
            }
            let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            offset += 4 + words * 4;
            if buf.len() < offset {
                return Err(ProtocolError::Rtp("truncated extension"));
            }
        }

        let mut end = buf.len();
        if padding {
            let pad = buf[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(ProtocolError::Rtp("invalid padding"));
            }
            end -= pad;
        }

        let header = RtpHeader {
            marker: buf[1] & 0x80 != 0,
            payload_type: buf[1] & 0x7F,
            sequence_number: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            csrc,
        };
        Ok(Self {
            header,
            payload: buf.slice(offset..end),
        })
    }

    /// Converts into a pipeline frame if the payload type is one we decode.
    pub fn into_frame(self) -> Result<MediaFrame, u8> {
        let codec = Codec::try_from(self.header.payload_type)?;
        Ok(MediaFrame {
            sequence: self.header.sequence_number,
            timestamp: self.header.timestamp,
            ssrc: self.header.ssrc,
            codec,
            payload: self.payload,
        })
    }
}

impl From<&MediaFrame> for RtpPacket {
    fn from(frame: &MediaFrame) -> Self {
        let header = RtpHeader::new(
            frame.codec.payload_type(),
            frame.sequence,
            frame.timestamp,
            frame.ssrc,
        );
        Self::new(header, frame.payload.clone())
    }
}
