//! Minimal SDP handling: media sections, audio codecs and the local offer.

use std::fmt::Write;

use crate::media::Codec;

const MID_PREFIX: &str = "a=mid:";
const RTPMAP_PREFIX: &str = "a=rtpmap:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    fn from_attribute(line: &str) -> Option<Self> {
        match line {
            "a=sendrecv" => Some(Self::SendRecv),
            "a=sendonly" => Some(Self::SendOnly),
            "a=recvonly" => Some(Self::RecvOnly),
            "a=inactive" => Some(Self::Inactive),
            _ => None,
        }
    }

    pub fn is_sending(self) -> bool {
        matches!(self, Self::SendOnly | Self::SendRecv)
    }

    fn as_attribute(self) -> &'static str {
        match self {
            Self::SendRecv => "a=sendrecv",
            Self::SendOnly => "a=sendonly",
            Self::RecvOnly => "a=recvonly",
            Self::Inactive => "a=inactive",
        }
    }
}

/// One `m=` section, recorded when its direction attribute is seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub kind: MediaKind,
    pub mid: String,
    pub direction: MediaDirection,
}

fn lines(sdp: &str) -> impl Iterator<Item = &str> {
    sdp.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l))
}

pub fn parse_media_sections(sdp: &str) -> Vec<MediaSection> {
    let mut sections = Vec::new();
    let mut kind = MediaKind::Video;
    let mut mid = String::new();

    for line in lines(sdp) {
        if line.starts_with("m=audio") {
            kind = MediaKind::Audio;
        } else if line.starts_with("m=video") {
            kind = MediaKind::Video;
        } else if let Some(value) = line.strip_prefix(MID_PREFIX) {
            mid = value.to_string();
        } else if let Some(direction) = MediaDirection::from_attribute(line) {
            sections.push(MediaSection {
                kind,
                mid: mid.clone(),
                direction,
            });
        }
    }
    sections
}

/// An audio payload type and what it maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
}

/// Audio payload types of the first `m=audio` section, in preference order.
pub fn audio_rtpmaps(sdp: &str) -> Vec<RtpMap> {
    let mut order: Vec<u8> = Vec::new();
    let mut maps: Vec<RtpMap> = Vec::new();
    let mut in_audio = false;
    let mut seen_audio = false;

    for line in lines(sdp) {
        if let Some(rest) = line.strip_prefix("m=") {
            in_audio = rest.starts_with("audio") && !seen_audio;
            if in_audio {
                seen_audio = true;
                order = rest
                    .split_whitespace()
                    .skip(3)
                    .filter_map(|pt| pt.parse().ok())
                    .collect();
            }
            continue;
        }
        if !in_audio {
            continue;
        }
        if let Some(map) = line.strip_prefix(RTPMAP_PREFIX).and_then(parse_rtpmap) {
            maps.push(map);
        }
    }

    order
        .into_iter()
        .filter_map(|pt| {
            maps.iter()
                .find(|m| m.payload_type == pt)
                .cloned()
                .or_else(|| {
                    Codec::try_from(pt).ok().map(|codec| RtpMap {
                        payload_type: pt,
                        encoding: codec.encoding_name().to_string(),
                        clock_rate: codec.clock_rate(),
                    })
                })
        })
        .collect()
}

fn parse_rtpmap(value: &str) -> Option<RtpMap> {
    let (pt, encoding) = value.split_once(' ')?;
    let mut parts = encoding.split('/');
    let name = parts.next()?;
    let clock_rate = parts.next()?.parse().ok()?;
    Some(RtpMap {
        payload_type: pt.parse().ok()?,
        encoding: name.to_string(),
        clock_rate,
    })
}

/// First audio codec in the answer that the client can handle.
pub fn negotiated_codec(sdp: &str) -> Option<Codec> {
    audio_rtpmaps(sdp)
        .iter()
        .find_map(|m| Codec::from_encoding(&m.encoding, m.clock_rate))
}

/// Builds the local audio-only offer sent in SUBSCRIBE.
pub fn build_audio_offer(session_id: u64, direction: MediaDirection, codecs: &[Codec]) -> String {
    let payload_types: Vec<String> = codecs
        .iter()
        .map(|c| c.payload_type().to_string())
        .collect();

    let mut sdp = String::new();
    // Writing into a String cannot fail.
    let _ = write!(
        sdp,
        "v=0\r\no=- {session_id} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=group:BUNDLE 0\r\n\
         m=audio 9 UDP/TLS/RTP/SAVPF {}\r\nc=IN IP4 0.0.0.0\r\na=mid:0\r\n{}\r\n",
        payload_types.join(" "),
        direction.as_attribute(),
    );
    for codec in codecs {
        let _ = write!(
            sdp,
            "a=rtpmap:{} {}/{}\r\n",
            codec.payload_type(),
            codec.encoding_name(),
            codec.clock_rate()
        );
    }
    sdp
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANSWER: &str = "v=0\r\n\
        o=- 1 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111 96 0\r\n\
        a=mid:0\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=rtpmap:96 L16/16000\r\n\
        a=sendrecv\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 102\r\n\
        a=mid:1\r\n\
        a=recvonly\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 102\r\n\
        a=mid:2\r\n\
        a=inactive\r\n";

    #[test]
    fn test_parse_media_sections() {
        let sections = parse_media_sections(ANSWER);
        assert_eq!(
            sections,
            vec![
                MediaSection {
                    kind: MediaKind::Audio,
                    mid: "0".into(),
                    direction: MediaDirection::SendRecv
                },
                MediaSection {
                    kind: MediaKind::Video,
                    mid: "1".into(),
                    direction: MediaDirection::RecvOnly
                },
                MediaSection {
                    kind: MediaKind::Video,
                    mid: "2".into(),
                    direction: MediaDirection::Inactive
                },
            ]
        );
    }

    #[test]
    fn test_empty_sdp_has_no_sections() {
        assert!(parse_media_sections("").is_empty());
        assert!(audio_rtpmaps("").is_empty());
        assert_eq!(negotiated_codec(""), None);
    }

    #[test]
    fn test_audio_rtpmaps_follow_payload_order() {
        let maps = audio_rtpmaps(ANSWER);
        let pts: Vec<u8> = maps.iter().map(|m| m.payload_type).collect();
        assert_eq!(pts, vec![111, 96, 0]);
        // Static payload type without an rtpmap line.
        assert_eq!(maps[2].encoding, "PCMU");
        assert_eq!(maps[2].clock_rate, 8000);
    }

    #[test]
    fn test_negotiated_codec_skips_unsupported() {
        assert_eq!(negotiated_codec(ANSWER), Some(Codec::L16));
        let pcma_only = "m=audio 9 RTP/AVP 8\r\na=rtpmap:8 PCMA/8000\r\na=sendrecv\r\n";
        assert_eq!(negotiated_codec(pcma_only), Some(Codec::Pcma));
        let opus_only = "m=audio 9 RTP/AVP 111\r\na=rtpmap:111 opus/48000/2\r\n";
        assert_eq!(negotiated_codec(opus_only), None);
    }

    #[test]
    fn test_offer_round_trips_through_parser() {
        let offer = build_audio_offer(42, MediaDirection::SendRecv, &Codec::ALL);
        let sections = parse_media_sections(&offer);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].kind, MediaKind::Audio);
        assert_eq!(sections[0].mid, "0");
        assert!(sections[0].direction.is_sending());
        assert_eq!(negotiated_codec(&offer), Some(Codec::Pcmu));
    }
}
