//! Audio file input for the send path.
//!
//! `.wav` files are read with `hound` (16-bit integer PCM only). Anything
//! else is taken as raw 48 kHz stereo s16le, the format the launcher hands
//! over as `.pcm`.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chimecore::error::MediaError;
use hound::{SampleFormat, WavReader};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Layout of headerless `.pcm` input.
pub const RAW_PCM_FORMAT: SourceFormat = SourceFormat {
    sample_rate: 48_000,
    channels: 2,
};

enum Reader {
    Wav(WavReader<BufReader<File>>),
    Raw(BufReader<File>),
}

pub struct FileAudioSource {
    path: PathBuf,
    format: SourceFormat,
    reader: Reader,
}

impl FileAudioSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MediaError> {
        let path = path.as_ref();
        let is_wav = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));

        let (format, reader) = if is_wav {
            let wav = WavReader::open(path)
                .map_err(|e| MediaError::Source(format!("{}: {e}", path.display())))?;
            let spec = wav.spec();
            if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
                return Err(MediaError::Source(format!(
                    "{}: only 16-bit integer WAV is supported, got {} bit {:?}",
                    path.display(),
                    spec.bits_per_sample,
                    spec.sample_format
                )));
            }
            let format = SourceFormat {
                sample_rate: spec.sample_rate,
                channels: spec.channels,
            };
            (format, Reader::Wav(wav))
        } else {
            let file = File::open(path)
                .map_err(|e| MediaError::Source(format!("{}: {e}", path.display())))?;
            (RAW_PCM_FORMAT, Reader::Raw(BufReader::new(file)))
        };

        if format.channels == 0 || format.sample_rate == 0 {
            return Err(MediaError::Source(format!("{}: empty audio format", path.display())));
        }
        info!(
            target: "Media/Send",
            "Opened {} ({} Hz, {} channels)",
            path.display(),
            format.sample_rate,
            format.channels
        );
        Ok(Self {
            path: path.to_path_buf(),
            format,
            reader,
        })
    }

    pub fn format(&self) -> SourceFormat {
        self.format
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads up to `frames` interleaved sample frames. Empty at end of file.
    pub fn read_chunk(&mut self, frames: usize) -> Result<Vec<i16>, MediaError> {
        let wanted = frames * usize::from(self.format.channels);
        match &mut self.reader {
            Reader::Wav(wav) => wav
                .samples::<i16>()
                .take(wanted)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| MediaError::Source(e.to_string())),
            Reader::Raw(file) => {
                let mut bytes = vec![0u8; wanted * 2];
                let mut filled = 0;
                while filled < bytes.len() {
                    match file.read(&mut bytes[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(MediaError::Source(e.to_string())),
                    }
                }
                // A trailing odd byte is not a sample.
                bytes.truncate(filled - filled % 2);
                Ok(bytes
                    .chunks_exact(2)
                    .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                    .collect())
            }
        }
    }

    fn frames_per(&self, duration: Duration) -> usize {
        (u128::from(self.format.sample_rate) * duration.as_millis() / 1000) as usize
    }
}

/// Reads `source` on the blocking pool in `chunk`-sized pieces.
///
/// The bounded channel paces the reader. It stops at end of file or when the
/// receiver is dropped, and resolves to the number of chunks sent.
pub fn spawn_reader(
    mut source: FileAudioSource,
    chunk: Duration,
    tx: mpsc::Sender<Vec<i16>>,
) -> JoinHandle<Result<u64, MediaError>> {
    tokio::task::spawn_blocking(move || {
        let frames = source.frames_per(chunk).max(1);
        let mut chunks = 0u64;
        loop {
            let samples = source.read_chunk(frames)?;
            if samples.is_empty() {
                info!(target: "Media/Send", "Reached end of {}", source.path().display());
                return Ok(chunks);
            }
            if tx.blocking_send(samples).is_err() {
                debug!(target: "Media/Send", "Send path gone, stopping reader");
                return Ok(chunks);
            }
            chunks += 1;
        }
    })
}

/// Opens the configured source, or logs why the send path stays idle.
pub fn open_optional(path: Option<&Path>) -> Option<FileAudioSource> {
    let path = path?;
    match FileAudioSource::open(path) {
        Ok(source) => Some(source),
        Err(e) => {
            warn!(target: "Media/Send", "Not sending audio: {e}");
            None
        }
    }
}
