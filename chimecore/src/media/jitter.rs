//! Jitter buffer for RTP reordering.
//!
//! Frames are held by extended sequence number and released in order once
//! the buffer has built up `target_depth` frames. A missing frame is given up
//! on as soon as the buffer is that deep again, so a lost packet costs at most
//! `target_depth` frames of delay.

use std::collections::BTreeMap;

use super::frame::MediaFrame;

#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    /// Frames buffered before playout starts, and before a gap is skipped.
    pub target_depth: usize,
    /// Hard cap; the oldest frame is dropped beyond it.
    pub max_packets: usize,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            target_depth: 3, // 60ms at 20ms frames
            max_packets: 50, // ~1 second
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitterStats {
    pub packets_received: u64,
    pub packets_played: u64,
    /// Arrived after their slot was played, or evicted by overflow.
    pub packets_dropped: u64,
    pub packets_reordered: u64,
    pub packets_duplicate: u64,
    /// Sequence numbers skipped over because they never arrived.
    pub packets_lost: u64,
    pub buffer_depth: usize,
}

pub struct JitterBuffer {
    config: JitterBufferConfig,
    buffer: BTreeMap<i64, MediaFrame>,
    /// Extended sequence number of the next frame to play.
    next_seq: Option<i64>,
    highest_seq: Option<i64>,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(config: JitterBufferConfig) -> Self {
        Self {
            config,
            buffer: BTreeMap::new(),
            next_seq: None,
            highest_seq: None,
            stats: JitterStats::default(),
        }
    }

    /// Unwraps a 16-bit sequence number to the value closest to the highest seen.
    fn extend(&self, seq: u16) -> i64 {
        let Some(highest) = self.highest_seq else {
            return seq as i64;
        };
        let candidate = (highest & !0xFFFF) | seq as i64;
        if candidate - highest > 0x8000 {
            candidate - 0x1_0000
        } else if highest - candidate > 0x8000 {
            candidate + 0x1_0000
        } else {
            candidate
        }
    }

    pub fn push(&mut self, frame: MediaFrame) {
        self.stats.packets_received += 1;
        let seq = self.extend(frame.sequence);

        if self.next_seq.is_some_and(|next| seq < next) {
            self.stats.packets_dropped += 1;
            return;
        }
        if self.buffer.contains_key(&seq) {
            self.stats.packets_duplicate += 1;
            return;
        }
        if self.highest_seq.is_some_and(|highest| seq < highest) {
            self.stats.packets_reordered += 1;
        }
        self.highest_seq = Some(self.highest_seq.map_or(seq, |h| h.max(seq)));
        self.buffer.insert(seq, frame);

        if self.buffer.len() > self.config.max_packets
            && let Some((oldest, _)) = self.buffer.pop_first()
        {
            self.stats.packets_dropped += 1;
            if self.next_seq.is_some_and(|next| next <= oldest) {
                self.next_seq = Some(oldest + 1);
            }
        }
        self.stats.buffer_depth = self.buffer.len();
    }

    /// Releases the next frame in sequence order, if one is due.
    pub fn pop(&mut self) -> Option<MediaFrame> {
        let deep_enough = self.buffer.len() >= self.config.target_depth.max(1);
        let next = match self.next_seq {
            Some(next) => next,
            None if deep_enough => *self.buffer.keys().next()?,
            None => return None,
        };

        let seq = if self.buffer.contains_key(&next) {
            next
        } else if deep_enough {
            let first = *self.buffer.keys().next()?;
            self.stats.packets_lost += (first - next).max(0) as u64;
            first
        } else {
            return None;
        };

        let frame = self.buffer.remove(&seq)?;
        self.next_seq = Some(seq + 1);
        self.stats.packets_played += 1;
        self.stats.buffer_depth = self.buffer.len();
        Some(frame)
    }

    /// Empties the buffer in sequence order, ignoring the target depth.
    pub fn drain(&mut self) -> Vec<MediaFrame> {
        let frames: Vec<MediaFrame> = std::mem::take(&mut self.buffer).into_values().collect();
        if let Some(last) = self.highest_seq {
            self.next_seq = Some(last + 1);
        }
        self.stats.packets_played += frames.len() as u64;
        self.stats.buffer_depth = 0;
        frames
    }

    pub fn stats(&self) -> &JitterStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new(JitterBufferConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Codec;
    use bytes::Bytes;

    fn frame(sequence: u16) -> MediaFrame {
        MediaFrame {
            sequence,
            timestamp: sequence as u32 * 160,
            ssrc: 7,
            codec: Codec::Pcmu,
            payload: Bytes::from_static(&[0xFF]),
        }
    }

    fn pop_all(jb: &mut JitterBuffer) -> Vec<u16> {
        std::iter::from_fn(|| jb.pop()).map(|f| f.sequence).collect()
    }

    #[test]
    fn test_reorders_within_target_depth() {
        let mut jb = JitterBuffer::default();
        jb.push(frame(12));
        jb.push(frame(10));
        assert!(jb.pop().is_none(), "still building up");
        jb.push(frame(11));
        assert_eq!(pop_all(&mut jb), vec![10, 11, 12]);
        assert_eq!(jb.stats().packets_reordered, 2);
    }

    #[test]
    fn test_late_and_duplicate_packets_are_dropped() {
        let mut jb = JitterBuffer::default();
        for seq in [1, 2, 3] {
            jb.push(frame(seq));
        }
        jb.push(frame(3));
        assert_eq!(jb.stats().packets_duplicate, 1);

        assert_eq!(jb.pop().map(|f| f.sequence), Some(1));
        assert_eq!(jb.pop().map(|f| f.sequence), Some(2));
        jb.push(frame(1));
        assert_eq!(jb.stats().packets_dropped, 1);
    }

    #[test]
    fn test_gap_is_skipped_once_buffer_is_deep() {
        let mut jb = JitterBuffer::default();
        for seq in [1, 2, 3] {
            jb.push(frame(seq));
        }
        assert_eq!(pop_all(&mut jb), vec![1, 2, 3]);

        // 4 never arrives.
        jb.push(frame(5));
        jb.push(frame(6));
        assert!(jb.pop().is_none());
        jb.push(frame(7));
        assert_eq!(pop_all(&mut jb), vec![5, 6, 7]);
        assert_eq!(jb.stats().packets_lost, 1);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut jb = JitterBuffer::default();
        for seq in [65_534, 0, 65_535, 1] {
            jb.push(frame(seq));
        }
        assert_eq!(pop_all(&mut jb), vec![65_534, 65_535, 0, 1]);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut jb = JitterBuffer::new(JitterBufferConfig {
            target_depth: 10,
            max_packets: 4,
        });
        for seq in 0..6 {
            jb.push(frame(seq));
        }
        assert_eq!(jb.len(), 4);
        assert_eq!(jb.stats().packets_dropped, 2);
        let drained: Vec<u16> = jb.drain().into_iter().map(|f| f.sequence).collect();
        assert_eq!(drained, vec![2, 3, 4, 5]);
        assert!(jb.is_empty());
    }
}
