//! Send and receive tasks of the media pipeline.
//!
//! Both paths share one switch: the published connection state. Frames only
//! move while it reads Joined.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chimecore::error::{MediaError, ShutdownError};
use chimecore::media::{
    Codec, FRAME_DURATION, JitterBuffer, JitterBufferConfig, MediaFrame, Packetizer, RtpPacket,
    codec,
};
use chimecore::state::ConnectionState;
use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::sink::PcmFileSink;
use super::source::{self, FileAudioSource};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Outbound packets queued for the transport before new ones are dropped.
    pub send_queue_depth: usize,
    /// Consecutive undecodable frames before a renegotiation is requested.
    pub max_consecutive_decode_failures: u32,
    pub jitter: JitterBufferConfig,
    /// Remote streams buffered at once; the least recently heard is evicted.
    pub max_remote_streams: usize,
    pub media_out: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            send_queue_depth: 50,
            max_consecutive_decode_failures: 25,
            jitter: JitterBufferConfig::default(),
            max_remote_streams: 16,
            media_out: PathBuf::from("media_out"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub frames_received: u64,
    pub decode_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    frames_received: AtomicU64,
    decode_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> MediaStats {
        MediaStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// Channels connecting the pipeline to the signaling client.
pub struct PipelineIo {
    /// RTP packets for the transport.
    pub media_out: mpsc::Sender<Bytes>,
    /// RTP packets off the transport.
    pub media_in: mpsc::Receiver<Bytes>,
    pub state: watch::Receiver<ConnectionState>,
    pub codec: watch::Receiver<Codec>,
}

pub struct MediaPipeline {
    send: JoinHandle<Result<(), MediaError>>,
    receive: JoinHandle<Result<(), MediaError>>,
    counters: Arc<Counters>,
    alerts: mpsc::Receiver<MediaError>,
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl MediaPipeline {
    /// Spawns both paths. With no `source` the send path idles until shutdown.
    pub fn start(
        config: PipelineConfig,
        source: Option<FileAudioSource>,
        io: PipelineIo,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let counters = Arc::new(Counters::default());
        let (alert_tx, alerts) = mpsc::channel(4);

        let send = tokio::spawn(run_send_path(
            source,
            io.media_out,
            io.state.clone(),
            io.codec,
            counters.clone(),
            shutdown.clone(),
        ));
        let receive = tokio::spawn(
            ReceivePath {
                sink: PcmFileSink::new(config.media_out.clone()),
                streams: HashMap::new(),
                config,
                counters: counters.clone(),
                packets: 0,
                consecutive_failures: 0,
                sink_failing: false,
                alerts: alert_tx,
            }
            .run(io.media_in, io.state, shutdown),
        );

        Self {
            send,
            receive,
            counters,
            alerts,
        }
    }

    /// Recoverable conditions the controller should act on.
    pub async fn next_alert(&mut self) -> Option<MediaError> {
        self.alerts.recv().await
    }

    pub fn stats(&self) -> MediaStats {
        self.counters.snapshot()
    }

    /// Waits for both paths after shutdown was signaled.
    pub async fn join(self) -> (MediaStats, Vec<ShutdownError>) {
        let mut errors = Vec::new();
        for (name, task) in [("send", self.send), ("receive", self.receive)] {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(target: "Media", "{name} path ended with error: {e}");
                    errors.push(ShutdownError::Task(format!("{name} path: {e}")));
                }
                Err(e) => errors.push(ShutdownError::Task(format!("{name} path: {e}"))),
            }
        }
        (self.counters.snapshot(), errors)
    }
}

async fn run_send_path(
    source: Option<FileAudioSource>,
    out: mpsc::Sender<Bytes>,
    state: watch::Receiver<ConnectionState>,
    codec: watch::Receiver<Codec>,
    counters: Arc<Counters>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), MediaError> {
    let Some(source) = source else {
        debug!(target: "Media/Send", "No audio source, send path idle");
        wait_for_shutdown(&mut shutdown).await;
        return Ok(());
    };

    let format = source.format();
    let (chunk_tx, mut chunks) = mpsc::channel(4);
    let reader = source::spawn_reader(source, FRAME_DURATION, chunk_tx);
    let mut packetizer = Packetizer::new(*codec.borrow(), format.sample_rate, format.channels);
    info!(
        target: "Media/Send",
        "Sending audio as {} (ssrc {})",
        packetizer.codec().encoding_name(),
        packetizer.ssrc()
    );

    let mut tick = tokio::time::interval(FRAME_DURATION);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = tick.tick() => {}
        }
        let Some(samples) = chunks.recv().await else {
            if let Some(frame) = packetizer.flush()
                && state.borrow().is_joined()
            {
                enqueue(&out, &frame, &counters);
            }
            info!(target: "Media/Send", "Audio source finished");
            break;
        };

        // Not joined: drop the audio rather than let it go stale.
        if !state.borrow().is_joined() {
            counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        let current = *codec.borrow();
        if current != packetizer.codec() {
            info!(target: "Media/Send", "Switching to {}", current.encoding_name());
            packetizer.set_codec(current);
        }
        for frame in packetizer.push_samples(&samples) {
            if !enqueue(&out, &frame, &counters) {
                debug!(target: "Media/Send", "Transport queue closed");
                drop(chunks);
                return finish_reader(reader).await;
            }
        }
    }

    drop(chunks);
    finish_reader(reader).await
}

/// Queues one frame without waiting. Returns false once the queue is closed.
fn enqueue(out: &mpsc::Sender<Bytes>, frame: &MediaFrame, counters: &Counters) -> bool {
    match out.try_send(RtpPacket::from(frame).encode()) {
        Ok(()) => {
            counters.frames_sent.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            trace!(target: "Media/Send", "Send queue full, dropping frame {}", frame.sequence);
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

async fn finish_reader(reader: JoinHandle<Result<u64, MediaError>>) -> Result<(), MediaError> {
    match reader.await {
        Ok(Ok(chunks)) => {
            debug!(target: "Media/Send", "Reader finished after {chunks} chunks");
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(e) => Err(MediaError::Source(e.to_string())),
    }
}

struct RemoteStream {
    jitter: JitterBuffer,
    // Value of the packet counter when this stream was last heard.
    last_heard: u64,
}

struct ReceivePath {
    sink: PcmFileSink,
    streams: HashMap<u32, RemoteStream>,
    config: PipelineConfig,
    counters: Arc<Counters>,
    packets: u64,
    consecutive_failures: u32,
    sink_failing: bool,
    alerts: mpsc::Sender<MediaError>,
}

impl ReceivePath {
    async fn run(
        mut self,
        mut media_in: mpsc::Receiver<Bytes>,
        state: watch::Receiver<ConnectionState>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), MediaError> {
        loop {
            let packet = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                packet = media_in.recv() => packet,
            };
            let Some(packet) = packet else { break };
            if !state.borrow().is_joined() {
                trace!(target: "Media/Recv", "Dropping packet while not joined");
                continue;
            }
            self.on_packet(packet).await;
        }

        // Packets already queued at shutdown still reach the sink.
        while let Ok(packet) = media_in.try_recv() {
            if state.borrow().is_joined() {
                self.on_packet(packet).await;
            }
        }
        for ssrc in self.streams.keys().copied().collect::<Vec<_>>() {
            let frames = self
                .streams
                .get_mut(&ssrc)
                .map(|stream| stream.jitter.drain())
                .unwrap_or_default();
            for frame in frames {
                self.play(frame).await;
            }
        }
        for (ssrc, stream) in &self.streams {
            debug!(target: "Media/Recv", "Stream {ssrc}: {:?}", stream.jitter.stats());
        }
        if let Err(e) = self.sink.flush().await {
            warn!(target: "Media/Recv", "{e}");
        }
        Ok(())
    }

    async fn on_packet(&mut self, packet: Bytes) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        let frame = match RtpPacket::decode(packet) {
            Ok(rtp) => match rtp.into_frame() {
                Ok(frame) => frame,
                Err(payload_type) => {
                    self.decode_failed(MediaError::UnsupportedCodec(format!(
                        "payload type {payload_type}"
                    )));
                    return;
                }
            },
            Err(e) => {
                self.decode_failed(MediaError::Decode(e.to_string()));
                return;
            }
        };

        let ssrc = frame.ssrc;
        if !self.streams.contains_key(&ssrc)
            && self.streams.len() >= self.config.max_remote_streams
        {
            self.evict_least_recent().await;
        }
        self.packets += 1;
        let jitter_config = self.config.jitter.clone();
        let stream = self.streams.entry(ssrc).or_insert_with(|| RemoteStream {
            jitter: JitterBuffer::new(jitter_config),
            last_heard: 0,
        });
        stream.last_heard = self.packets;
        stream.jitter.push(frame);
        let ready: Vec<MediaFrame> = std::iter::from_fn(|| stream.jitter.pop()).collect();
        for frame in ready {
            self.play(frame).await;
        }
    }

    /// Plays out and closes the stream heard from least recently.
    async fn evict_least_recent(&mut self) {
        let Some(ssrc) = self
            .streams
            .iter()
            .min_by_key(|(_, stream)| stream.last_heard)
            .map(|(ssrc, _)| *ssrc)
        else {
            return;
        };
        let Some(mut stream) = self.streams.remove(&ssrc) else {
            return;
        };
        debug!(target: "Media/Recv", "Evicting stream {ssrc}: {:?}", stream.jitter.stats());
        for frame in stream.jitter.drain() {
            self.play(frame).await;
        }
        if let Err(e) = self.sink.close(ssrc).await {
            warn!(target: "Media/Recv", "Closing stream {ssrc}: {e}");
        }
    }

    async fn play(&mut self, frame: MediaFrame) {
        let samples = match codec::decode(frame.codec, &frame.payload) {
            Ok(samples) => samples,
            Err(e) => {
                self.decode_failed(e);
                return;
            }
        };
        self.consecutive_failures = 0;
        match self.sink.write(frame.ssrc, &samples).await {
            Ok(()) => self.sink_failing = false,
            Err(e) => self.sink_failed(e),
        }
    }

    /// The frame is lost but the stream goes on. One alert per run of failures.
    fn sink_failed(&mut self, error: MediaError) {
        self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
        if std::mem::replace(&mut self.sink_failing, true) {
            trace!(target: "Media/Recv", "Dropping frame: {error}");
            return;
        }
        warn!(target: "Media/Recv", "Remote audio not recorded: {error}");
        let _ = self.alerts.try_send(error);
    }

    fn decode_failed(&mut self, error: MediaError) {
        self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures += 1;
        debug!(target: "Media/Recv", "Skipping frame: {error}");

        if self.consecutive_failures >= self.config.max_consecutive_decode_failures {
            let consecutive = std::mem::take(&mut self.consecutive_failures);
            warn!(target: "Media/Recv", "{consecutive} consecutive frames failed to decode");
            let _ = self
                .alerts
                .try_send(MediaError::SustainedDecodeFailure { consecutive });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chimecore::media::RtpHeader;
    use std::time::Duration;

    struct Rig {
        media_out: mpsc::Receiver<Bytes>,
        media_in: mpsc::Sender<Bytes>,
        state: watch::Sender<ConnectionState>,
        _codec: watch::Sender<Codec>,
        shutdown: watch::Sender<bool>,
        pipeline: MediaPipeline,
        dir: tempfile::TempDir,
    }

    fn rig(source: Option<FileAudioSource>, initial: ConnectionState) -> Rig {
        rig_with(source, initial, PipelineConfig::default())
    }

    fn rig_with(
        source: Option<FileAudioSource>,
        initial: ConnectionState,
        config: PipelineConfig,
    ) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let (out_tx, out_rx) = mpsc::channel(50);
        let (in_tx, in_rx) = mpsc::channel(50);
        let (state_tx, state_rx) = watch::channel(initial);
        let (codec_tx, codec_rx) = watch::channel(Codec::Pcmu);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = PipelineConfig {
            media_out: dir.path().join("media_out"),
            max_consecutive_decode_failures: 3,
            jitter: JitterBufferConfig {
                target_depth: 1,
                max_packets: 50,
            },
            ..config
        };
        let pipeline = MediaPipeline::start(
            config,
            source,
            PipelineIo {
                media_out: out_tx,
                media_in: in_rx,
                state: state_rx,
                codec: codec_rx,
            },
            shutdown_rx,
        );
        Rig {
            media_out: out_rx,
            media_in: in_tx,
            state: state_tx,
            _codec: codec_tx,
            shutdown: shutdown_tx,
            pipeline,
            dir,
        }
    }

    fn pcmu_packet(ssrc: u32, sequence: u16) -> Bytes {
        RtpPacket::new(
            RtpHeader::new(0, sequence, u32::from(sequence) * 160, ssrc),
            Bytes::from(vec![0xFF; 160]),
        )
        .encode()
    }

    #[tokio::test]
    async fn test_receive_path_writes_without_source() {
        let mut rig = rig(None, ConnectionState::Joined);
        for seq in 0..4 {
            rig.media_in.send(pcmu_packet(42, seq)).await.unwrap();
        }
        rig.shutdown.send(true).unwrap();
        let (stats, errors) = rig.pipeline.join().await;

        assert!(errors.is_empty());
        assert_eq!(stats.frames_sent, 0);
        let written = std::fs::read(rig.dir.path().join("media_out/remote_audio_42.pcm")).unwrap();
        // Four 20ms PCMU frames of silence, decoded to s16le.
        assert_eq!(written.len(), 4 * 160 * 2);
        assert!(rig.media_out.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_packets_dropped_while_not_joined() {
        let rig = rig(None, ConnectionState::Authenticating);
        rig.media_in.send(pcmu_packet(1, 0)).await.unwrap();
        rig.shutdown.send(true).unwrap();
        let (stats, _) = rig.pipeline.join().await;
        assert_eq!(stats.frames_received, 0);
        assert!(!rig.dir.path().join("media_out").exists());
    }

    #[tokio::test]
    async fn test_sustained_decode_failure_raises_alert() {
        let mut rig = rig(None, ConnectionState::Joined);
        for seq in 0..3u16 {
            // Payload type 99 is not negotiated.
            let packet = RtpPacket::new(RtpHeader::new(99, seq, 0, 5), Bytes::from_static(&[1]));
            rig.media_in.send(packet.encode()).await.unwrap();
        }
        assert!(matches!(
            rig.pipeline.next_alert().await,
            Some(MediaError::SustainedDecodeFailure { consecutive: 3 })
        ));
        assert_eq!(rig.pipeline.stats().decode_errors, 3);
        rig.shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_sink_failure_alerts_and_keeps_receiving() {
        let mut rig = rig(None, ConnectionState::Joined);
        // A plain file where the output directory should go.
        std::fs::write(rig.dir.path().join("media_out"), b"").unwrap();
        for seq in 0..2 {
            rig.media_in.send(pcmu_packet(8, seq)).await.unwrap();
        }
        assert!(matches!(
            rig.pipeline.next_alert().await,
            Some(MediaError::Sink(_))
        ));

        // The receive path is still consuming.
        rig.media_in.send(pcmu_packet(8, 2)).await.unwrap();
        rig.shutdown.send(true).unwrap();
        let (stats, errors) = rig.pipeline.join().await;
        assert!(errors.is_empty());
        assert_eq!(stats.frames_received, 3);
        assert_eq!(stats.frames_dropped, 3);
    }

    #[tokio::test]
    async fn test_least_recent_stream_evicted_at_cap() {
        let config = PipelineConfig {
            max_remote_streams: 2,
            ..Default::default()
        };
        let rig = rig_with(None, ConnectionState::Joined, config);
        rig.media_in.send(pcmu_packet(1, 0)).await.unwrap();
        rig.media_in.send(pcmu_packet(2, 0)).await.unwrap();
        rig.media_in.send(pcmu_packet(2, 1)).await.unwrap();
        // Third stream: 1 was heard least recently and is closed.
        rig.media_in.send(pcmu_packet(3, 0)).await.unwrap();
        // Stream 1 comes back and evicts 2.
        rig.media_in.send(pcmu_packet(1, 1)).await.unwrap();
        rig.shutdown.send(true).unwrap();
        let (stats, errors) = rig.pipeline.join().await;

        assert!(errors.is_empty());
        assert_eq!(stats.frames_received, 5);
        let out = rig.dir.path().join("media_out");
        let len = |ssrc: u32| {
            std::fs::read(out.join(format!("remote_audio_{ssrc}.pcm")))
                .unwrap()
                .len()
        };
        // Reopened streams append rather than truncate.
        assert_eq!(len(1), 2 * 160 * 2);
        assert_eq!(len(2), 2 * 160 * 2);
        assert_eq!(len(3), 160 * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_path_paces_frames_once_joined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.pcm");
        // 100ms of 48 kHz stereo.
        std::fs::write(&path, vec![0u8; 4800 * 2 * 2]).unwrap();
        let source = FileAudioSource::open(&path).unwrap();

        let mut rig = rig(Some(source), ConnectionState::Joined);
        let mut packets = Vec::new();
        while let Some(packet) = rig.media_out.recv().await {
            packets.push(RtpPacket::decode(packet).unwrap());
            if packets.len() == 5 {
                break;
            }
        }
        assert_eq!(packets.len(), 5);
        assert_eq!(packets[0].header.payload_type, 0);
        assert_eq!(packets[0].payload.len(), 160);
        assert_eq!(
            packets[1].header.sequence_number,
            packets[0].header.sequence_number.wrapping_add(1)
        );
        assert_eq!(
            packets[1].header.timestamp,
            packets[0].header.timestamp.wrapping_add(160)
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        rig.state.send(ConnectionState::Closed).unwrap();
        rig.shutdown.send(true).unwrap();
        let (stats, errors) = rig.pipeline.join().await;
        assert!(errors.is_empty());
        assert_eq!(stats.frames_sent, 5);
    }
}
