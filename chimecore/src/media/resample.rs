//! Channel downmix and streaming linear resampling.

/// Averages interleaved channels into mono. Trailing partial frames are dropped.
pub fn downmix(samples: &[i16], channels: u16) -> Vec<i16> {
    match channels {
        0 | 1 => samples.to_vec(),
        n => samples
            .chunks_exact(n as usize)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|s| *s as i32).sum();
                (sum / n as i32) as i16
            })
            .collect(),
    }
}

/// Linear interpolation resampler that keeps its phase across calls, so a
/// stream can be fed in arbitrary chunks.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    step: f64,
    /// Read position relative to the start of the next chunk; `-1.0` means
    /// halfway through `previous` and the chunk's first sample.
    position: f64,
    previous: i16,
}

impl LinearResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            step: input_rate as f64 / output_rate.max(1) as f64,
            position: 0.0,
            previous: 0,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < f64::EPSILON
    }

    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        if self.is_passthrough() || input.is_empty() {
            return input.to_vec();
        }

        let len = input.len() as f64;
        let mut out = Vec::with_capacity((len / self.step) as usize + 1);
        let sample_at = |index: isize| -> f64 {
            if index < 0 {
                self.previous as f64
            } else {
                input[index as usize] as f64
            }
        };

        while self.position.floor() + 1.0 < len {
            let base = self.position.floor();
            let frac = self.position - base;
            let a = sample_at(base as isize);
            let b = sample_at(base as isize + 1);
            out.push((a + (b - a) * frac).round() as i16);
            self.position += self.step;
        }

        self.position -= len;
        self.previous = input[input.len() - 1];
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_averages_channels() {
        assert_eq!(downmix(&[100, 300, -50, 50, 7], 2), vec![200, 0]);
        assert_eq!(downmix(&[1, 2, 3], 1), vec![1, 2, 3]);
    }

    #[test]
    fn test_downsample_48k_to_8k() {
        let mut resampler = LinearResampler::new(48_000, 8_000);
        let input = vec![1000i16; 960];
        let out = resampler.process(&input);
        assert_eq!(out.len(), 160);
        assert!(out.iter().all(|s| *s == 1000));
        assert_eq!(resampler.process(&input).len(), 160);
    }

    #[test]
    fn test_upsample_keeps_phase_across_chunks() {
        let mut resampler = LinearResampler::new(8_000, 16_000);
        let ramp: Vec<i16> = (0..160).map(|i| i * 10).collect();
        let first = resampler.process(&ramp);
        assert_eq!(first.len(), 318);
        assert_eq!(first[1], 5);

        let second = resampler.process(&ramp);
        assert_eq!(second.len(), 320);
        // The tail of the first chunk is emitted once the next chunk arrives.
        assert_eq!(second[0], 1590);
        assert_eq!(second[1], 795);
    }

    #[test]
    fn test_same_rate_is_passthrough() {
        let mut resampler = LinearResampler::new(16_000, 16_000);
        assert!(resampler.is_passthrough());
        assert_eq!(resampler.process(&[1, 2, 3]), vec![1, 2, 3]);
    }
}
