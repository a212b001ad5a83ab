//! Writes decoded remote audio as raw s16le mono PCM, one file per SSRC.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chimecore::error::{MediaError, ShutdownError};
use log::{debug, info};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

pub struct PcmFileSink {
    dir: PathBuf,
    writers: HashMap<u32, BufWriter<File>>,
    // Streams whose file was created by this sink; reopening them appends.
    created: HashSet<u32>,
    bytes_written: u64,
}

impl PcmFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writers: HashMap::new(),
            created: HashSet::new(),
            bytes_written: 0,
        }
    }

    pub fn path_for(&self, ssrc: u32) -> PathBuf {
        self.dir.join(format!("remote_audio_{ssrc}.pcm"))
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn open_files(&self) -> usize {
        self.writers.len()
    }

    pub async fn write(&mut self, ssrc: u32, samples: &[i16]) -> Result<(), MediaError> {
        if !self.writers.contains_key(&ssrc) {
            fs::create_dir_all(&self.dir).await?;
            let path = self.path_for(ssrc);
            let file = if self.created.contains(&ssrc) {
                debug!(target: "Media/Recv", "Reopening {}", path.display());
                OpenOptions::new().append(true).open(&path).await?
            } else {
                let file = File::create(&path).await?;
                info!(target: "Media/Recv", "Writing remote audio to {}", path.display());
                self.created.insert(ssrc);
                file
            };
            self.writers.insert(ssrc, BufWriter::new(file));
        }
        let Some(writer) = self.writers.get_mut(&ssrc) else {
            return Ok(());
        };

        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        writer.write_all(&bytes).await?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Flushes and closes the file of one stream. A later write reopens it.
    pub async fn close(&mut self, ssrc: u32) -> Result<(), MediaError> {
        if let Some(mut writer) = self.writers.remove(&ssrc) {
            writer.flush().await?;
        }
        Ok(())
    }

    /// Flushes every open file. All are attempted even if one fails.
    pub async fn flush(&mut self) -> Result<(), ShutdownError> {
        let mut first_error = None;
        for (ssrc, writer) in &mut self.writers {
            if let Err(e) = writer.flush().await {
                debug!(target: "Media/Recv", "Flush of stream {ssrc} failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(ShutdownError::Flush(e)),
            None => Ok(()),
        }
    }
}
