//! One-byte kind prefix carried by every websocket binary message.

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

use crate::error::ProtocolError;
use crate::proto::signal_rtc::SignalFrame;

/// Prefix of a protobuf `SignalFrame`.
pub const SIGNAL_KIND: u8 = 0x02;
/// Prefix of an RTP packet.
pub const MEDIA_KIND: u8 = 0x05;

/// Shortest message worth looking at: a kind byte plus one body byte.
pub const MIN_MESSAGE_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Signal(SignalFrame),
    Media(Bytes),
}

pub fn decode(message: Bytes) -> Result<Inbound, ProtocolError> {
    if message.len() < MIN_MESSAGE_LEN {
        return Err(ProtocolError::TooShort(message.len()));
    }
    let kind = message[0];
    let body = message.slice(1..);
    match kind {
        SIGNAL_KIND => Ok(Inbound::Signal(SignalFrame::decode(body)?)),
        MEDIA_KIND => Ok(Inbound::Media(body)),
        other => Err(ProtocolError::UnsupportedVersion(other)),
    }
}

/// Stamps `timestamp_ms` and serializes the frame behind [`SIGNAL_KIND`].
pub fn encode_signal(frame: &mut SignalFrame, now_ms: u64) -> Bytes {
    frame.timestamp_ms = now_ms;
    let mut buf = BytesMut::with_capacity(1 + frame.encoded_len());
    buf.put_u8(SIGNAL_KIND);
    // BytesMut grows on demand, so encoding cannot run out of space.
    let _ = frame.encode(&mut buf);
    buf.freeze()
}

pub fn encode_media(packet: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + packet.len());
    buf.put_u8(MEDIA_KIND);
    buf.put_slice(packet);
    buf.freeze()
}
