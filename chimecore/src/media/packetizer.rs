//! Turns raw PCM into fixed-duration encoded media frames.

use super::codec;
use super::frame::{Codec, MediaFrame};
use super::resample::{LinearResampler, downmix};

/// Stateful sender side of one RTP stream.
#[derive(Debug)]
pub struct Packetizer {
    codec: Codec,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    input_rate: u32,
    input_channels: u16,
    resampler: LinearResampler,
    pending: Vec<i16>,
}

impl Packetizer {
    /// Starts a stream with a random SSRC, sequence number and timestamp.
    pub fn new(codec: Codec, input_rate: u32, input_channels: u16) -> Self {
        Self::with_start(
            codec,
            input_rate,
            input_channels,
            rand::random(),
            rand::random(),
            rand::random(),
        )
    }

    pub fn with_start(
        codec: Codec,
        input_rate: u32,
        input_channels: u16,
        ssrc: u32,
        sequence: u16,
        timestamp: u32,
    ) -> Self {
        Self {
            codec,
            ssrc,
            sequence,
            timestamp,
            input_rate,
            input_channels,
            resampler: LinearResampler::new(input_rate, codec.clock_rate()),
            pending: Vec::new(),
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Switches codec mid-stream. Buffered audio at the old rate is discarded.
    pub fn set_codec(&mut self, codec: Codec) {
        if codec == self.codec {
            return;
        }
        self.codec = codec;
        self.resampler = LinearResampler::new(self.input_rate, codec.clock_rate());
        self.pending.clear();
    }

    /// Feeds interleaved samples and returns every complete frame.
    pub fn push_samples(&mut self, interleaved: &[i16]) -> Vec<MediaFrame> {
        let mono = downmix(interleaved, self.input_channels);
        let resampled = self.resampler.process(&mono);
        self.pending.extend_from_slice(&resampled);

        let frame_len = self.codec.samples_per_frame();
        let pending = std::mem::take(&mut self.pending);
        let chunks = pending.chunks_exact(frame_len);
        self.pending = chunks.remainder().to_vec();
        chunks.map(|chunk| self.next_frame(chunk)).collect()
    }

    /// Emits whatever is buffered, padded with silence to a full frame.
    pub fn flush(&mut self) -> Option<MediaFrame> {
        if self.pending.is_empty() {
            return None;
        }
        let mut chunk = std::mem::take(&mut self.pending);
        chunk.resize(self.codec.samples_per_frame(), 0);
        Some(self.next_frame(&chunk))
    }

    fn next_frame(&mut self, samples: &[i16]) -> MediaFrame {
        let frame = MediaFrame {
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
            codec: self.codec,
            payload: codec::encode(self.codec, samples),
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples.len() as u32);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_48k_stereo_to_pcmu_frames() {
        let mut packetizer = Packetizer::with_start(Codec::Pcmu, 48_000, 2, 99, 65_535, 1000);
        // 40ms of stereo audio at 48 kHz.
        let input = vec![0i16; 48 * 40 * 2];
        let frames = packetizer.push_samples(&input);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload.len(), 160);
        assert_eq!(frames[0].sequence, 65_535);
        assert_eq!(frames[0].timestamp, 1000);
        assert_eq!(frames[0].ssrc, 99);
        assert_eq!(frames[1].sequence, 0);
        assert_eq!(frames[1].timestamp, 1160);
    }

    #[test]
    fn test_partial_frame_carries_into_next_push() {
        let mut packetizer = Packetizer::with_start(Codec::L16, 16_000, 1, 7, 10, 0);
        assert!(packetizer.push_samples(&[1; 200]).is_empty());
        let frames = packetizer.push_samples(&[2; 500]);
        // 700 samples buffered: two 320-sample frames, 60 left over.
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].sequence, 10);
        assert_eq!(frames[1].sequence, 11);
        assert_eq!(frames[1].timestamp, 320);
        assert_eq!(&frames[0].payload[..2], &1i16.to_be_bytes());
        assert_eq!(&frames[0].payload[400..402], &2i16.to_be_bytes());
        let tail = packetizer.flush().unwrap();
        assert_eq!(tail.sequence, 12);
        assert_eq!(&tail.payload[..2], &2i16.to_be_bytes());
        assert_eq!(&tail.payload[120..122], &0i16.to_be_bytes());
    }

    #[test]
    fn test_flush_pads_partial_frame() {
        let mut packetizer = Packetizer::with_start(Codec::L16, 16_000, 1, 1, 0, 0);
        assert!(packetizer.push_samples(&[100; 100]).is_empty());
        let frame = packetizer.flush().unwrap();
        assert_eq!(frame.payload.len(), 320 * 2);
        assert!(packetizer.flush().is_none());
    }

    #[test]
    fn test_codec_switch_changes_frame_size() {
        let mut packetizer = Packetizer::with_start(Codec::Pcmu, 16_000, 1, 1, 0, 0);
        packetizer.set_codec(Codec::L16);
        let frames = packetizer.push_samples(&[0; 320]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].codec, Codec::L16);
        assert_eq!(frames[0].payload.len(), 640);
    }
}
