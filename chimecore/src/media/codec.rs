//! G.711 and L16 sample codecs.

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::Codec;
use crate::error::MediaError;

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32_635;

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign: u8 = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    let segment = (pcm >> 7) as u32;
    let exponent = if segment == 0 { 0 } else { 31 - segment.leading_zeros() } as i32;
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !(sign | ((exponent << 4) | mantissa) as u8)
}

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Upper bounds of the 13-bit A-law segments.
const ALAW_SEGMENT_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];

pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut pcm = (sample as i32) >> 3;
    let mask: u8 = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    let Some(segment) = ALAW_SEGMENT_END.iter().position(|end| pcm <= *end) else {
        return 0x7F ^ mask;
    };
    let shift = if segment < 2 { 1 } else { segment };
    let value = ((segment as i32) << 4) | ((pcm >> shift) & 0x0F);
    value as u8 ^ mask
}

pub fn alaw_to_linear(byte: u8) -> i16 {
    let byte = byte ^ 0x55;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0F) as i32;
    let magnitude = if exponent == 0 {
        (mantissa << 4) + 8
    } else {
        ((mantissa << 4) + 0x108) << (exponent - 1)
    };
    if byte & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

/// Encodes mono samples already at `codec`'s clock rate.
pub fn encode(codec: Codec, samples: &[i16]) -> Bytes {
    match codec {
        Codec::Pcmu => samples.iter().map(|s| linear_to_ulaw(*s)).collect(),
        Codec::Pcma => samples.iter().map(|s| linear_to_alaw(*s)).collect(),
        Codec::L16 => {
            let mut buf = BytesMut::with_capacity(samples.len() * 2);
            for s in samples {
                buf.put_i16(*s);
            }
            buf.freeze()
        }
    }
}

pub fn decode(codec: Codec, payload: &[u8]) -> Result<Vec<i16>, MediaError> {
    if payload.is_empty() {
        return Err(MediaError::Decode("empty payload".to_string()));
    }
    match codec {
        Codec::Pcmu => Ok(payload.iter().map(|b| ulaw_to_linear(*b)).collect()),
        Codec::Pcma => Ok(payload.iter().map(|b| alaw_to_linear(*b)).collect()),
        Codec::L16 => {
            if payload.len() % 2 != 0 {
                return Err(MediaError::Decode(format!(
                    "odd L16 payload length {}",
                    payload.len()
                )));
            }
            Ok(payload
                .chunks_exact(2)
                .map(|c| i16::from_be_bytes([c[0], c[1]]))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ulaw_reference_values() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(linear_to_ulaw(-1), 0x7F);
        assert_eq!(linear_to_ulaw(i16::MAX), 0x80);
        assert_eq!(linear_to_ulaw(i16::MIN), 0x00);
        assert_eq!(ulaw_to_linear(0xFF), 0);
        assert_eq!(ulaw_to_linear(0x80), 32_124);
        assert_eq!(ulaw_to_linear(0x00), -32_124);
    }

    #[test]
    fn test_alaw_reference_values() {
        assert_eq!(linear_to_alaw(0), 0xD5);
        assert_eq!(linear_to_alaw(-1), 0x55);
        assert_eq!(linear_to_alaw(i16::MAX), 0xAA);
        assert_eq!(alaw_to_linear(0xD5), 8);
        assert_eq!(alaw_to_linear(0x55), -8);
        assert_eq!(alaw_to_linear(0xAA), 32_256);
    }

    #[test]
    fn test_g711_quantization_error_is_bounded() {
        for sample in (-32_000i16..32_000).step_by(97) {
            let u = ulaw_to_linear(linear_to_ulaw(sample)) as i32;
            let a = alaw_to_linear(linear_to_alaw(sample)) as i32;
            let tolerance = (sample as i32).abs() / 16 + 16;
            assert!((u - sample as i32).abs() <= tolerance, "ulaw {sample} -> {u}");
            assert!((a - sample as i32).abs() <= tolerance, "alaw {sample} -> {a}");
        }
    }

    #[test]
    fn test_l16_is_big_endian() {
        let payload = encode(Codec::L16, &[0x0102, -2]);
        assert_eq!(&payload[..], &[0x01, 0x02, 0xFF, 0xFE]);
        assert_eq!(decode(Codec::L16, &payload).unwrap(), vec![0x0102, -2]);
        assert!(decode(Codec::L16, &[1, 2, 3]).is_err());
        assert!(decode(Codec::Pcmu, &[]).is_err());
    }
}
