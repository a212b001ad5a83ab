//! The signaling client actor.
//!
//! One task owns the [`SignalingMachine`] and the live [`Channel`]. Commands,
//! transport events, outbound media and the ping timer all funnel into its
//! select loop, so frames are processed and sent strictly in order. The
//! connection state is published through a `watch` channel; nothing else
//! writes it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chimecore::backoff::ReconnectPolicy;
use chimecore::envelope;
use chimecore::error::SessionError;
use chimecore::proto::signal_rtc::{SignalFrame, signal_frame::Type as FrameType};
use chimecore::session::SessionDescriptor;
use chimecore::signaling::{
    Action, DataMessageToSend, SignalingConfig, SignalingEvent, SignalingMachine,
};
use chimecore::state::ConnectionState;
use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::connector::{self, Channel};
use crate::transport::{TransportConfig, TransportEvent, TransportFactory};

/// How often a joined client pings the service.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Depth of the inbound media queue feeding the receive path.
pub const MEDIA_QUEUE_DEPTH: usize = 50;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bound on each websocket handshake.
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub ping_interval: Duration,
    pub signaling: SignalingConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            ping_interval: PING_INTERVAL,
            signaling: SignalingConfig::default(),
        }
    }
}

#[derive(Debug)]
pub enum Command {
    Leave,
    SetMute(bool),
    SendDataMessage(DataMessageToSend),
    Resubscribe,
}

/// Cheap, cloneable control surface of a running client.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    is_connecting: Arc<AtomicBool>,
}

impl ClientHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Whether the client is currently dialing or backing off.
    pub fn is_connecting(&self) -> bool {
        self.is_connecting.load(Ordering::Relaxed)
    }

    async fn command(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::ClientGone)
    }

    pub async fn leave(&self) -> Result<(), SessionError> {
        self.command(Command::Leave).await
    }

    pub async fn set_mute(&self, muted: bool) -> Result<(), SessionError> {
        self.command(Command::SetMute(muted)).await
    }

    pub async fn send_data_message(&self, message: DataMessageToSend) -> Result<(), SessionError> {
        self.command(Command::SendDataMessage(message)).await
    }

    /// Asks the service to renegotiate media.
    pub async fn resubscribe(&self) -> Result<(), SessionError> {
        self.command(Command::Resubscribe).await
    }
}

/// Everything [`spawn`] hands back.
pub struct SpawnedClient {
    pub handle: ClientHandle,
    pub events: mpsc::UnboundedReceiver<SignalingEvent>,
    /// Inbound RTP packets, only ever filled while joined.
    pub media_in: mpsc::Receiver<Bytes>,
    /// Resolves to the final connection state.
    pub task: JoinHandle<ConnectionState>,
}

/// Starts the client actor.
///
/// `media_out` carries RTP packets from the send path. `shutdown` flipping
/// to `true` stops the actor and closes the transport.
pub fn spawn(
    descriptor: Arc<SessionDescriptor>,
    factory: Arc<dyn TransportFactory>,
    options: ClientOptions,
    media_out: mpsc::Receiver<Bytes>,
    shutdown: watch::Receiver<bool>,
) -> SpawnedClient {
    let (command_tx, command_rx) = mpsc::channel(32);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (media_in_tx, media_in_rx) = mpsc::channel(MEDIA_QUEUE_DEPTH);
    let is_connecting = Arc::new(AtomicBool::new(false));

    let transport_config = TransportConfig::new(descriptor.signaling_url(), descriptor.join_token())
        .with_connect_timeout(options.connect_timeout);
    let actor = ClientActor {
        machine: SignalingMachine::new(descriptor, options.signaling.clone()),
        factory,
        transport_config,
        options,
        channel: None,
        state_tx,
        events_tx,
        media_in_tx,
        shutdown,
        is_connecting: is_connecting.clone(),
        media_dropped: AtomicU64::new(0),
    };
    let task = tokio::spawn(actor.run(command_rx, media_out));

    SpawnedClient {
        handle: ClientHandle {
            commands: command_tx,
            state: state_rx,
            is_connecting,
        },
        events: events_rx,
        media_in: media_in_rx,
        task,
    }
}

struct ClientActor {
    machine: SignalingMachine,
    factory: Arc<dyn TransportFactory>,
    transport_config: TransportConfig,
    options: ClientOptions,
    channel: Option<Channel>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    media_in_tx: mpsc::Sender<Bytes>,
    shutdown: watch::Receiver<bool>,
    is_connecting: Arc<AtomicBool>,
    media_dropped: AtomicU64,
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn next_event(channel: &mut Option<Channel>) -> Option<TransportEvent> {
    match channel {
        Some(channel) => channel.next_event().await,
        None => std::future::pending().await,
    }
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

fn frame_name(frame: &SignalFrame) -> &'static str {
    FrameType::try_from(frame.r#type)
        .map(|t| t.as_str_name())
        .unwrap_or("UNKNOWN")
}

impl ClientActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut media_out: mpsc::Receiver<Bytes>,
    ) -> ConnectionState {
        info!(target: "Signaling", "Starting signaling client");
        let actions = self.machine.start();
        self.execute(actions).await;
        let actions = self.dial(true).await;
        self.execute(actions).await;

        let period = self.options.ping_interval;
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !(self.machine.state().is_terminal() && self.channel.is_none()) {
            let actions = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    info!(target: "Signaling", "Shutdown signaled, stopping client");
                    break;
                }
                event = next_event(&mut self.channel) => match event {
                    Some(TransportEvent::FrameReceived(message)) => {
                        self.machine.handle_inbound(message)
                    }
                    Some(TransportEvent::Connected) => Vec::new(),
                    Some(TransportEvent::Disconnected { code }) => {
                        info!(target: "Signaling", "Transport disconnected (code {code:?})");
                        self.close_channel().await;
                        self.machine.on_transport_closed(code)
                    }
                    None => {
                        self.close_channel().await;
                        self.machine.on_transport_lost()
                    }
                },
                Some(command) = commands.recv() => self.on_command(command),
                Some(packet) = media_out.recv() => {
                    self.send_media(packet).await;
                    Vec::new()
                }
                _ = ping.tick() => self.machine.ping(),
            };
            self.execute(actions).await;
        }

        self.close_channel().await;
        self.publish();
        let dropped = self.media_dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            debug!(target: "Signaling", "{dropped} media packets dropped at the client");
        }
        info!(target: "Signaling", "Signaling client stopped ({})", self.machine.state());
        self.machine.state()
    }

    fn on_command(&mut self, command: Command) -> Vec<Action> {
        debug!(target: "Signaling", "Command {command:?}");
        match command {
            Command::Leave => {
                let was_joined = self.machine.state().is_joined();
                let mut actions = self.machine.request_leave();
                // Nothing will acknowledge a leave that was never sent.
                if !was_joined && !actions.is_empty() {
                    actions.push(Action::CloseTransport);
                }
                actions
            }
            Command::SetMute(muted) => self.machine.set_mute(muted),
            Command::SendDataMessage(message) => self.machine.send_data_message(message),
            Command::Resubscribe => self.machine.resubscribe(),
        }
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send(mut frame) => self.send_signal(&mut frame).await,
                Action::Emit(event) => {
                    let _ = self.events_tx.send(event);
                }
                Action::DeliverMedia(packet) => self.deliver_media(packet),
                Action::CloseTransport => self.close_channel().await,
                Action::Reconnect => {
                    self.close_channel().await;
                    self.publish();
                    queue.extend(self.dial(false).await);
                }
            }
        }
        self.publish();
    }

    fn publish(&self) {
        let next = self.machine.state();
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    async fn close_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
    }

    /// Dials until a channel is up, the budget is spent, or shutdown.
    /// `immediate` skips the backoff before the first attempt.
    async fn dial(&mut self, immediate: bool) -> Vec<Action> {
        self.is_connecting.store(true, Ordering::Relaxed);
        let is_connecting = self.is_connecting.clone();
        let _guard = scopeguard::guard((), move |_| {
            is_connecting.store(false, Ordering::Relaxed);
        });

        let policy = self.options.reconnect.clone();
        let mut attempt = if immediate { 0 } else { 1 };
        loop {
            if attempt > 0 {
                let Some(delay) = policy.delay_for(attempt) else {
                    warn!(target: "Transport", "Giving up after {} attempts", policy.max_attempts);
                    return self.machine.on_reconnect_exhausted(policy.max_attempts);
                };
                info!(target: "Transport", "Reconnect attempt {attempt} in {delay:?}");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_for_shutdown(&mut self.shutdown) => {
                        info!(target: "Transport", "Shutdown during backoff");
                        return self.machine.request_leave();
                    }
                }
            }

            let dialed = tokio::select! {
                result = connector::connect(
                    self.factory.as_ref(),
                    &self.transport_config,
                    self.options.connect_timeout,
                ) => result,
                _ = wait_for_shutdown(&mut self.shutdown) => {
                    info!(target: "Transport", "Shutdown while dialing");
                    return self.machine.request_leave();
                }
            };
            match dialed {
                Ok(channel) => {
                    self.channel = Some(channel);
                    return self.machine.on_transport_up();
                }
                Err(e) => warn!(target: "Transport", "Connect attempt {attempt} failed: {e}"),
            }
            attempt += 1;
        }
    }

    async fn send_signal(&mut self, frame: &mut SignalFrame) {
        let Some(channel) = &self.channel else {
            debug!(target: "Signaling", "No transport, dropping {}", frame_name(frame));
            return;
        };
        trace!(target: "Signaling", "--> {}", frame_name(frame));
        let message = envelope::encode_signal(frame, now_ms());
        if let Err(e) = channel.send(message).await {
            warn!(target: "Signaling", "Failed to send {}: {e}", frame_name(frame));
        }
    }

    async fn send_media(&mut self, packet: Bytes) {
        let Some(channel) = self.channel.as_ref().filter(|_| self.machine.state().is_joined())
        else {
            trace!(target: "Media/Send", "Dropping media while {}", self.machine.state());
            self.media_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if let Err(e) = channel.send(envelope::encode_media(&packet)).await {
            debug!(target: "Media/Send", "Media send failed: {e}");
        }
    }

    fn deliver_media(&self, packet: Bytes) {
        match self.media_in_tx.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.media_dropped.fetch_add(1, Ordering::Relaxed);
                trace!(target: "Media/Recv", "Receive queue full, dropping packet");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!(target: "Media/Recv", "Receive path gone, dropping packet");
            }
        }
    }
}
