//! Session controller: runs one meeting session from dial to exit status.
//!
//! Startup goes transport, then join, then media. The pipeline only starts on
//! the first `Joined` event. Every way out of the event loop runs the same
//! shutdown: leave the meeting, stop the media tasks, then stop the client
//! actor, which owns the only transport close.

use std::sync::Arc;
use std::time::Duration;

use chimecore::error::{ExitStatus, MediaError, ShutdownError};
use chimecore::media::Codec;
use chimecore::session::SessionDescriptor;
use chimecore::signaling::SignalingEvent;
use chimecore::state::ConnectionState;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};

use crate::client::{self, ClientHandle, ClientOptions, SpawnedClient};
use crate::media::source;
use crate::media::{MediaPipeline, PipelineConfig, PipelineIo};
use crate::transport::{TokioWebSocketTransportFactory, TransportFactory};

/// How long a leave may go unacknowledged before the transport is closed anyway.
pub const LEAVE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client: ClientOptions,
    pub pipeline: PipelineConfig,
    pub leave_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client: ClientOptions::default(),
            pipeline: PipelineConfig::default(),
            leave_grace: LEAVE_GRACE,
        }
    }
}

/// Joins the meeting over a real websocket and runs until Ctrl-C, a remote
/// leave, or a fatal error.
pub async fn run(descriptor: SessionDescriptor, options: SessionOptions) -> ExitStatus {
    let (stop_tx, stop_rx) = watch::channel(false);
    let ctrl_c = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!(target: "Controller", "Interrupted, leaving the meeting");
                let _ = stop_tx.send(true);
            }
            Err(e) => warn!(target: "Controller", "Cannot listen for Ctrl-C: {e}"),
        }
    });

    let status = run_with(
        Arc::new(descriptor),
        Arc::new(TokioWebSocketTransportFactory::default()),
        options,
        stop_rx,
    )
    .await;
    ctrl_c.abort();
    status
}

/// Like [`run`], with the transport and the stop signal supplied by the caller.
pub async fn run_with(
    descriptor: Arc<SessionDescriptor>,
    factory: Arc<dyn TransportFactory>,
    options: SessionOptions,
    mut stop: watch::Receiver<bool>,
) -> ExitStatus {
    let mut audio = source::open_optional(descriptor.audio_source());
    let mut client_options = options.client.clone();
    client_options.signaling.send_audio = audio.is_some();

    let (client_stop_tx, client_stop_rx) = watch::channel(false);
    let (media_out_tx, media_out_rx) = mpsc::channel(options.pipeline.send_queue_depth);
    let SpawnedClient {
        handle,
        mut events,
        media_in,
        task,
    } = client::spawn(
        descriptor.clone(),
        factory,
        client_options,
        media_out_rx,
        client_stop_rx,
    );

    let (codec_tx, codec_rx) = watch::channel(Codec::default());
    let (media_stop_tx, media_stop_rx) = watch::channel(false);
    let mut media_io = Some((media_out_tx, media_in));
    let mut pipeline: Option<MediaPipeline> = None;

    info!(target: "Controller", "Joining meeting {}", descriptor.meeting_id());
    loop {
        tokio::select! {
            biased;
            _ = wait_for_stop(&mut stop) => {
                debug!(target: "Controller", "Stop requested");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    debug!(target: "Controller", "Client event stream ended");
                    break;
                };
                let ended = matches!(event, SignalingEvent::Closed | SignalingEvent::Failed(_));
                match &event {
                    SignalingEvent::Joined(params) => {
                        codec_tx.send_replace(params.codec);
                        if let Some((media_out, media_in)) = media_io.take() {
                            pipeline = Some(MediaPipeline::start(
                                options.pipeline.clone(),
                                audio.take(),
                                PipelineIo {
                                    media_out,
                                    media_in,
                                    state: handle.subscribe_state(),
                                    codec: codec_rx.clone(),
                                },
                                media_stop_rx.clone(),
                            ));
                        }
                    }
                    SignalingEvent::MediaRenegotiated { codec, .. } => {
                        codec_tx.send_replace(*codec);
                    }
                    _ => {}
                }
                log_event(&event);
                if ended {
                    break;
                }
            }
            Some(alert) = next_alert(&mut pipeline) => on_media_alert(&handle, alert).await,
        }
    }

    let mut shutdown_errors = Vec::new();
    if let Err(e) = leave(&handle, &mut events, options.leave_grace).await {
        shutdown_errors.push(e);
    }

    let _ = media_stop_tx.send(true);
    if let Some(pipeline) = pipeline {
        let (stats, errors) = pipeline.join().await;
        info!(
            target: "Controller",
            "Media: {} frames sent, {} dropped, {} received, {} decode errors",
            stats.frames_sent,
            stats.frames_dropped,
            stats.frames_received,
            stats.decode_errors
        );
        shutdown_errors.extend(errors);
    }

    let _ = client_stop_tx.send(true);
    let final_state = match task.await {
        Ok(state) => state,
        Err(e) => {
            shutdown_errors.push(ShutdownError::Task(format!("signaling client: {e}")));
            ConnectionState::Failed
        }
    };
    for e in &shutdown_errors {
        warn!(target: "Controller", "{e}");
    }

    let status = exit_status(final_state);
    info!(target: "Controller", "Session ended in {final_state} (exit code {})", status.code());
    status
}

fn exit_status(state: ConnectionState) -> ExitStatus {
    match state {
        ConnectionState::Failed => ExitStatus::Failed,
        _ => ExitStatus::Success,
    }
}

async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn next_alert(pipeline: &mut Option<MediaPipeline>) -> Option<MediaError> {
    match pipeline {
        Some(pipeline) => pipeline.next_alert().await,
        None => std::future::pending().await,
    }
}

async fn on_media_alert(handle: &ClientHandle, alert: MediaError) {
    match alert {
        MediaError::SustainedDecodeFailure { .. } => {
            warn!(target: "Controller", "{alert}, renegotiating media");
            if let Err(e) = handle.resubscribe().await {
                debug!(target: "Controller", "Resubscribe not sent: {e}");
            }
        }
        MediaError::Sink(e) => {
            warn!(target: "Controller", "Remote audio is not being recorded: {e}");
        }
        other => warn!(target: "Controller", "Media: {other}"),
    }
}

/// Sends LEAVE and waits up to `grace` for the service to let go.
async fn leave(
    handle: &ClientHandle,
    events: &mut mpsc::UnboundedReceiver<SignalingEvent>,
    grace: Duration,
) -> Result<(), ShutdownError> {
    let state = handle.state();
    // A client still dialing only watches its stop signal.
    if state.is_terminal() || handle.is_connecting() {
        return Ok(());
    }
    if handle.leave().await.is_err() {
        return Ok(());
    }
    info!(target: "Controller", "Leaving the meeting");

    let acknowledged = async {
        while let Some(event) = events.recv().await {
            // Closed arrives as soon as LEAVE is sent; the ack comes later.
            let done = matches!(
                event,
                SignalingEvent::LeaveAcknowledged | SignalingEvent::Failed(_)
            );
            log_event(&event);
            if done {
                return;
            }
        }
    };
    tokio::time::timeout(grace, acknowledged)
        .await
        .map_err(|_| ShutdownError::LeaveTimeout(grace))
}

fn log_event(event: &SignalingEvent) {
    match event {
        SignalingEvent::Joined(params) => info!(
            target: "Controller",
            "Joined, sending {} (TURN credentials: {})",
            params.codec.encoding_name(),
            if params.turn_credentials.is_some() { "yes" } else { "no" }
        ),
        SignalingEvent::Started { video_sources, .. } => info!(
            target: "Controller",
            "Session started, {} remote video sources",
            video_sources.len()
        ),
        SignalingEvent::AttendeeJoined(a) => info!(target: "Controller", "{} joined", a.external_user_id),
        SignalingEvent::AttendeeLeft(a) => info!(target: "Controller", "{} left", a.external_user_id),
        SignalingEvent::AttendeeDropped(a) => info!(target: "Controller", "{} dropped", a.external_user_id),
        SignalingEvent::DataMessagesReceived(messages) => {
            for message in messages {
                info!(
                    target: "Controller",
                    "Data message on '{}' from {}: {} bytes",
                    message.topic,
                    message.sender.external_user_id,
                    message.data.len()
                );
            }
        }
        SignalingEvent::DataMessagesFailedToSend(failures) => {
            for failure in failures {
                warn!(target: "Controller", "Data message not delivered: {failure:?}");
            }
        }
        SignalingEvent::AudioStatus(status) => warn!(target: "Controller", "Audio status {status}"),
        SignalingEvent::Failed(reason) => error!(target: "Controller", "Session failed: {reason}"),
        SignalingEvent::Closed => info!(target: "Controller", "Session closed"),
        other => debug!(target: "Controller", "{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransportFactory;
    use chimecore::proto::signal_rtc::{self as pb, signal_frame::Type};
    use chimecore::session::{MeetingSessionCredentials, MeetingSessionUrls};

    fn descriptor() -> Arc<SessionDescriptor> {
        Arc::new(
            SessionDescriptor::new(
                "meeting-1",
                "external-meeting",
                MeetingSessionCredentials {
                    attendee_id: "attendee-1".into(),
                    external_user_id: "user-1#Alice".into(),
                    join_token: "join-token".into(),
                },
                MeetingSessionUrls {
                    audio_host_url: "audio.example.com:3478".into(),
                    signaling_url: "wss://signal.example.com/control/meeting-1".into(),
                },
            )
            .unwrap(),
        )
    }

    fn options(dir: &tempfile::TempDir) -> SessionOptions {
        let mut options = SessionOptions::default();
        options.pipeline.media_out = dir.path().join("media_out");
        options
    }

    fn frame(kind: Type) -> pb::SignalFrame {
        pb::SignalFrame {
            r#type: kind as i32,
            ..Default::default()
        }
    }

    #[test]
    fn test_exit_status_mapping() {
        assert_eq!(exit_status(ConnectionState::Closed), ExitStatus::Success);
        assert_eq!(exit_status(ConnectionState::Failed), ExitStatus::Failed);
        assert_eq!(exit_status(ConnectionState::Failed).code(), 1);
    }

    #[tokio::test]
    async fn test_stop_sends_leave_and_closes_once() {
        let dir = tempfile::tempdir().unwrap();
        let (factory, mut connections) = MockTransportFactory::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let session = tokio::spawn(run_with(
            descriptor(),
            Arc::new(factory.clone()),
            options(&dir),
            stop_rx,
        ));

        let mut server = connections.recv().await.unwrap();
        assert_eq!(server.next_signal().await.unwrap().r#type, Type::Join as i32);
        server.reply(frame(Type::JoinAck)).await;
        assert_eq!(
            server.next_signal().await.unwrap().r#type,
            Type::Subscribe as i32
        );

        stop_tx.send(true).unwrap();
        assert_eq!(server.next_signal().await.unwrap().r#type, Type::Leave as i32);
        server.reply(frame(Type::LeaveAck)).await;

        assert_eq!(session.await.unwrap(), ExitStatus::Success);
        assert_eq!(factory.disconnects(), 1);
        assert!(server.is_closed_by_client());
    }

    #[tokio::test]
    async fn test_close_code_4410_fails_session() {
        let dir = tempfile::tempdir().unwrap();
        let (factory, mut connections) = MockTransportFactory::new();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let session = tokio::spawn(run_with(
            descriptor(),
            Arc::new(factory.clone()),
            options(&dir),
            stop_rx,
        ));

        let mut server = connections.recv().await.unwrap();
        server.next_signal().await.unwrap();
        server.reply(frame(Type::JoinAck)).await;
        server.next_signal().await.unwrap();
        server.drop_connection(Some(4410)).await;

        assert_eq!(session.await.unwrap(), ExitStatus::Failed);
        assert_eq!(factory.creates(), 1);
        assert_eq!(factory.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_leave_still_closes() {
        let dir = tempfile::tempdir().unwrap();
        let (factory, mut connections) = MockTransportFactory::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let session = tokio::spawn(run_with(
            descriptor(),
            Arc::new(factory.clone()),
            options(&dir),
            stop_rx,
        ));

        let mut server = connections.recv().await.unwrap();
        server.next_signal().await.unwrap();
        server.reply(frame(Type::JoinAck)).await;
        server.next_signal().await.unwrap();

        stop_tx.send(true).unwrap();
        assert_eq!(server.next_signal().await.unwrap().r#type, Type::Leave as i32);

        assert_eq!(session.await.unwrap(), ExitStatus::Success);
        assert_eq!(factory.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_meeting_ended_is_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (factory, mut connections) = MockTransportFactory::new();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let session = tokio::spawn(run_with(
            descriptor(),
            Arc::new(factory.clone()),
            options(&dir),
            stop_rx,
        ));

        let mut server = connections.recv().await.unwrap();
        server.next_signal().await.unwrap();
        server.reply(frame(Type::JoinAck)).await;
        server.next_signal().await.unwrap();
        server
            .reply(pb::SignalFrame {
                audio_status: Some(pb::AudioStatusFrame {
                    audio_status: Some(410),
                }),
                ..frame(Type::AudioStatus)
            })
            .await;

        assert_eq!(session.await.unwrap(), ExitStatus::Success);
        assert_eq!(factory.disconnects(), 1);
        assert_eq!(factory.creates(), 1);
    }
}
