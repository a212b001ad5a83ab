//! The signaling state machine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use log::{debug, error, info, trace, warn};

use super::audio::AudioFrameAdapter;
use super::data_message::{self, DataMessageToSend};
use super::events::{
    Attendee, FailureReason, MediaParameters, RemoteVideoSource, SignalingEvent, TurnCredentials,
};
use crate::envelope::{self, Inbound};
use crate::error::{AuthError, ConnectError, ProtocolError};
use crate::media::Codec;
use crate::proto::signal_rtc::{self as pb, signal_frame::Type as FrameType};
use crate::sdp::{self, MediaDirection};
use crate::session::SessionDescriptor;
use crate::state::{ConnectionState, StateTransition};
use crate::{CLIENT_SOURCE, SDK_VERSION};

/// Unanswered pings after which the transport is considered dead.
pub const MAX_MISSED_PINGS: u32 = 3;

const JOIN_PROTOCOL_VERSION: u32 = 2;
const MAX_NUM_OF_VIDEOS: u32 = 25;

/// Work the caller must carry out on the machine's behalf, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Stamp, envelope and send a signal frame.
    Send(pb::SignalFrame),
    Emit(SignalingEvent),
    /// Hand an inbound RTP packet to the receive path.
    DeliverMedia(Bytes),
    CloseTransport,
    /// Drop the current transport and dial again with backoff.
    Reconnect,
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Ask for attendee presence updates in the JOIN flags.
    pub enable_attendee_updates: bool,
    pub mute_on_join: bool,
    /// Whether a local audio source exists; decides the subscribe duplex mode.
    pub send_audio: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            enable_attendee_updates: true,
            mute_on_join: false,
            send_audio: false,
        }
    }
}

impl SignalingConfig {
    pub fn for_descriptor(descriptor: &SessionDescriptor) -> Self {
        Self {
            send_audio: descriptor.audio_source().is_some(),
            ..Default::default()
        }
    }
}

pub struct SignalingMachine {
    descriptor: Arc<SessionDescriptor>,
    config: SignalingConfig,
    state: ConnectionState,
    muted: bool,
    sdp_offer: String,
    codec: Codec,
    turn_credentials: Option<TurnCredentials>,
    has_received_first_index: bool,
    /// Remote video sources keyed by attendee id.
    video_sources: HashMap<String, RemoteVideoSource>,
    audio: AudioFrameAdapter,
    /// Stream and group id the service allocated for our audio.
    audio_allocation: (u32, u32),
    joins_sent: u32,
    next_ping_id: u32,
    outstanding_pings: u32,
}

fn frame(kind: FrameType) -> pb::SignalFrame {
    pb::SignalFrame {
        r#type: kind as i32,
        ..Default::default()
    }
}

fn emit_all(events: Vec<SignalingEvent>) -> Vec<Action> {
    events.into_iter().map(Action::Emit).collect()
}

impl SignalingMachine {
    pub fn new(descriptor: Arc<SessionDescriptor>, config: SignalingConfig) -> Self {
        let direction = if config.send_audio {
            MediaDirection::SendRecv
        } else {
            MediaDirection::RecvOnly
        };
        let sdp_offer = sdp::build_audio_offer(rand::random::<u32>() as u64, direction, &Codec::ALL);

        Self {
            descriptor,
            muted: config.mute_on_join,
            config,
            state: ConnectionState::Disconnected,
            sdp_offer,
            codec: Codec::default(),
            turn_credentials: None,
            has_received_first_index: false,
            video_sources: HashMap::new(),
            audio: AudioFrameAdapter::new(),
            audio_allocation: (0, 0),
            joins_sent: 0,
            next_ping_id: 0,
            outstanding_pings: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Codec negotiated so far; PCMU until an answer says otherwise.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// JOIN frames sent over the lifetime of the session.
    pub fn joins_sent(&self) -> u32 {
        self.joins_sent
    }

    pub fn sdp_offer(&self) -> &str {
        &self.sdp_offer
    }

    fn transition(&mut self, transition: StateTransition) -> bool {
        match self.state.apply(transition) {
            Ok(next) => {
                if next != self.state {
                    debug!(target: "Signaling", "State {} -> {}", self.state, next);
                }
                self.state = next;
                true
            }
            Err(e) => {
                warn!(target: "Signaling", "Ignoring input: {e}");
                false
            }
        }
    }

    fn fail(&mut self, reason: FailureReason) -> Vec<Action> {
        if !self.transition(StateTransition::Fail) {
            return Vec::new();
        }
        error!(target: "Signaling", "Session failed: {reason}");
        vec![
            Action::Emit(SignalingEvent::Failed(reason)),
            Action::CloseTransport,
        ]
    }

    fn remote_leave(&mut self) -> Vec<Action> {
        if !self.transition(StateTransition::RemoteLeave) {
            return Vec::new();
        }
        vec![Action::Emit(SignalingEvent::Closed), Action::CloseTransport]
    }

    pub fn start(&mut self) -> Vec<Action> {
        if self.transition(StateTransition::Start) {
            info!(target: "Signaling", "Connecting to {}", self.descriptor.signaling_url());
        }
        Vec::new()
    }

    pub fn on_transport_up(&mut self) -> Vec<Action> {
        let reconnecting = self.state == ConnectionState::Reconnecting;
        if !self.transition(StateTransition::TransportUp) {
            return Vec::new();
        }
        if reconnecting {
            info!(target: "Signaling", "Transport recovered, replaying join");
            vec![self.join_action()]
        } else {
            self.submit_join()
        }
    }

    /// Sends JOIN once the transport is up.
    pub fn submit_join(&mut self) -> Vec<Action> {
        if !self.transition(StateTransition::JoinSent) {
            return Vec::new();
        }
        vec![self.join_action()]
    }

    fn join_action(&mut self) -> Action {
        self.joins_sent += 1;
        let mut flags = pb::JoinFlags::ExcludeSelfContentInIndex as u32;
        if self.config.enable_attendee_updates {
            flags |= pb::JoinFlags::HasStreamUpdate as u32;
        }
        info!(target: "Signaling", "Sending JOIN (#{})", self.joins_sent);

        Action::Send(pb::SignalFrame {
            join: Some(pb::JoinFrame {
                protocol_version: Some(JOIN_PROTOCOL_VERSION),
                max_num_of_videos: Some(MAX_NUM_OF_VIDEOS),
                flags: Some(flags),
                client_details: Some(pb::ClientDetails {
                    client_source: Some(CLIENT_SOURCE.to_string()),
                    chime_sdk_version: Some(SDK_VERSION.to_string()),
                    ..Default::default()
                }),
            }),
            ..frame(FrameType::Join)
        })
    }

    fn subscribe_action(&self) -> Action {
        let duplex = if self.config.send_audio {
            pb::StreamServiceType::Duplex
        } else {
            pb::StreamServiceType::Rx
        };
        let send_streams = if self.config.send_audio {
            let (stream_id, group_id) = self.audio_allocation;
            vec![pb::StreamDescriptor {
                stream_id: Some(stream_id),
                group_id: Some(group_id),
                media_type: Some(pb::StreamMediaType::Audio as i32),
                ..Default::default()
            }]
        } else {
            Vec::new()
        };
        let audio_host = self.descriptor.audio_host_url();
        debug!(target: "Signaling", "Sending SUBSCRIBE ({})", duplex.as_str_name());

        Action::Send(pb::SignalFrame {
            sub: Some(pb::SubscribeFrame {
                duplex: Some(duplex as i32),
                send_streams,
                // The service expects stream id 0 for the audio section.
                receive_stream_ids: vec![0],
                sdp_offer: Some(self.sdp_offer.clone()),
                xrp_host: (!audio_host.is_empty()).then(|| audio_host.to_string()),
                xrp_checkin: None,
                xrp_muted: self.muted.then_some(true),
            }),
            ..frame(FrameType::Subscribe)
        })
    }

    /// Decodes one websocket message and reacts to it.
    pub fn handle_inbound(&mut self, message: Bytes) -> Vec<Action> {
        match envelope::decode(message) {
            Ok(Inbound::Signal(frame)) => self.handle_signal(frame),
            Ok(Inbound::Media(packet)) => {
                if self.state.is_joined() {
                    vec![Action::DeliverMedia(packet)]
                } else {
                    trace!(target: "Signaling", "Dropping media received while {}", self.state);
                    Vec::new()
                }
            }
            Err(e) if e.is_fatal() => self.fail(FailureReason::Protocol(e)),
            Err(ProtocolError::TooShort(len)) => {
                debug!(target: "Signaling", "Ignoring {len}-byte message");
                Vec::new()
            }
            Err(e) => {
                warn!(target: "Signaling", "Dropping malformed message: {e}");
                Vec::new()
            }
        }
    }

    fn handle_signal(&mut self, frame: pb::SignalFrame) -> Vec<Action> {
        let Ok(kind) = FrameType::try_from(frame.r#type) else {
            debug!(target: "Signaling", "Ignoring signal frame of unknown type {}", frame.r#type);
            return Vec::new();
        };
        if self.state == ConnectionState::Failed
            || (self.state == ConnectionState::Closed && kind != FrameType::LeaveAck)
        {
            trace!(target: "Signaling", "Ignoring {} in state {}", kind.as_str_name(), self.state);
            return Vec::new();
        }
        trace!(target: "Signaling", "<-- {}", kind.as_str_name());

        match kind {
            FrameType::JoinAck => self.on_join_ack(frame.joinack),
            FrameType::LeaveAck => self.on_leave_ack(),
            FrameType::Index => match frame.index {
                Some(index) => self.on_index(index),
                None => missing("index"),
            },
            FrameType::SubscribeAck => match frame.suback {
                Some(suback) => self.on_subscribe_ack(suback),
                None => missing("suback"),
            },
            FrameType::AudioMetadata => match (&frame.audio_metadata, self.state.is_joined()) {
                (Some(metadata), true) => emit_all(self.audio.on_audio_metadata(metadata)),
                (None, _) => missing("audio_metadata"),
                _ => Vec::new(),
            },
            FrameType::AudioStreamIdInfo => {
                match (&frame.audio_stream_id_info, self.state.is_joined()) {
                    (Some(info), true) => emit_all(self.audio.on_stream_id_info(info)),
                    (None, _) => missing("audio_stream_id_info"),
                    _ => Vec::new(),
                }
            }
            FrameType::AudioStatus => self.on_audio_status(frame.audio_status),
            FrameType::DataMessage => match frame.data_message {
                Some(messages) => self.on_data_message(&messages),
                None => missing("data_message"),
            },
            FrameType::PingPong => match frame.ping_pong {
                Some(ping_pong) => self.on_ping_pong(ping_pong),
                None => missing("ping_pong"),
            },
            other => {
                debug!(target: "Signaling", "Ignoring {} frame", other.as_str_name());
                Vec::new()
            }
        }
    }

    fn on_join_ack(&mut self, join_ack: Option<pb::JoinAckFrame>) -> Vec<Action> {
        if self.state != ConnectionState::Authenticating {
            warn!(target: "Signaling", "Unexpected JOIN_ACK while {}", self.state);
            return Vec::new();
        }
        self.turn_credentials = join_ack
            .and_then(|ack| ack.turn_credentials)
            .and_then(parse_turn_credentials);
        if !self.transition(StateTransition::JoinAccepted) {
            return Vec::new();
        }
        info!(target: "Signaling", "Join is successful");

        vec![
            Action::Emit(SignalingEvent::Joined(MediaParameters {
                codec: self.codec,
                turn_credentials: self.turn_credentials.clone(),
            })),
            self.subscribe_action(),
        ]
    }

    fn on_leave_ack(&mut self) -> Vec<Action> {
        info!(target: "Signaling", "Leave is acknowledged");
        let mut actions = vec![Action::Emit(SignalingEvent::LeaveAcknowledged)];
        if !self.state.is_terminal() && self.transition(StateTransition::RemoteLeave) {
            actions.push(Action::Emit(SignalingEvent::Closed));
        }
        actions.push(Action::CloseTransport);
        actions
    }

    fn on_index(&mut self, index: pb::IndexFrame) -> Vec<Action> {
        if !self.state.is_joined() {
            warn!(target: "Signaling", "Index received before join");
            return Vec::new();
        }
        if index.at_capacity == Some(true) {
            warn!(target: "Signaling", "Meeting reached its video capacity");
            return Vec::new();
        }

        let present: HashSet<&str> = index
            .sources
            .iter()
            .filter_map(|s| s.profile_uuid.as_deref())
            .collect();
        let gone: Vec<String> = self
            .video_sources
            .keys()
            .filter(|id| !present.contains(id.as_str()))
            .cloned()
            .collect();
        let removed: Vec<RemoteVideoSource> = gone
            .iter()
            .filter_map(|id| self.video_sources.remove(id))
            .collect();

        let mut added = Vec::new();
        for stream in &index.sources {
            let source = RemoteVideoSource {
                stream_id: stream.stream_id.unwrap_or_default(),
                group_id: stream.group_id.unwrap_or_default(),
                max_bitrate_kbps: stream.max_bitrate_kbps.unwrap_or_default(),
                attendee: Attendee {
                    attendee_id: stream.profile_uuid.clone().unwrap_or_default(),
                    external_user_id: stream.external_user_id.clone().unwrap_or_default(),
                },
            };
            match self.video_sources.get_mut(&source.attendee.attendee_id) {
                Some(existing) => {
                    existing.group_id = source.group_id;
                    existing.max_bitrate_kbps = source.max_bitrate_kbps;
                    existing.attendee = source.attendee;
                }
                None => {
                    self.video_sources
                        .insert(source.attendee.attendee_id.clone(), source.clone());
                    added.push(source);
                }
            }
        }

        if !self.has_received_first_index {
            self.has_received_first_index = true;
            if self
                .turn_credentials
                .as_ref()
                .is_some_and(|turn| turn.is_expired(Utc::now()))
            {
                error!(target: "Signaling", "TURN credentials expired");
                return Vec::new();
            }
            info!(target: "Signaling", "Signaling client started");
            return vec![Action::Emit(SignalingEvent::Started {
                turn_credentials: self.turn_credentials.clone(),
                video_sources: added,
            })];
        }

        let mut actions = Vec::new();
        if !added.is_empty() {
            actions.push(Action::Emit(SignalingEvent::RemoteVideoSourcesAvailable(added)));
        }
        if !removed.is_empty() {
            actions.push(Action::Emit(SignalingEvent::RemoteVideoSourcesUnavailable(
                removed,
            )));
        }
        actions
    }

    fn on_subscribe_ack(&mut self, suback: pb::SubscribeAckFrame) -> Vec<Action> {
        if !self.state.is_joined() {
            warn!(target: "Signaling", "SUBSCRIBE_ACK received while {}", self.state);
            return Vec::new();
        }
        let Some(sdp_answer) = suback.sdp_answer else {
            error!(target: "Signaling", "SUBSCRIBE_ACK carried no sdp answer");
            return Vec::new();
        };

        if self.config.send_audio
            && let Some(allocation) = suback.allocations.first()
        {
            self.audio_allocation = (
                allocation.stream_id.unwrap_or_default(),
                allocation.group_id.unwrap_or_default(),
            );
        }

        match sdp::negotiated_codec(&sdp_answer) {
            Some(codec) => {
                if codec != self.codec {
                    info!(target: "Signaling", "Negotiated audio codec {}", codec.encoding_name());
                }
                self.codec = codec;
            }
            None => warn!(
                target: "Signaling",
                "Answer lists no supported audio codec, keeping {}",
                self.codec.encoding_name()
            ),
        }

        vec![Action::Emit(SignalingEvent::MediaRenegotiated {
            codec: self.codec,
            sdp_answer,
        })]
    }

    fn on_audio_status(&mut self, status: Option<pb::AudioStatusFrame>) -> Vec<Action> {
        let Some(status) = status.and_then(|s| s.audio_status) else {
            return missing("audio_status");
        };
        if status < 400 {
            debug!(target: "Signaling", "Audio status {status}");
            return vec![Action::Emit(SignalingEvent::AudioStatus(status))];
        }

        let auth = AuthError::from_audio_status(status);
        match self.state {
            ConnectionState::Connected | ConnectionState::Authenticating => {
                self.fail(FailureReason::Auth(auth))
            }
            ConnectionState::Joined if auth == AuthError::MeetingEnded => {
                info!(target: "Signaling", "Meeting has ended");
                self.remote_leave()
            }
            _ => {
                warn!(target: "Signaling", "Audio status {status}: {auth}");
                vec![Action::Emit(SignalingEvent::AudioStatus(status))]
            }
        }
    }

    fn on_data_message(&mut self, frame: &pb::DataMessageFrame) -> Vec<Action> {
        let (received, throttled) = data_message::split_inbound(frame);
        let mut actions = Vec::new();
        if !received.is_empty() {
            actions.push(Action::Emit(SignalingEvent::DataMessagesReceived(received)));
        }
        if !throttled.is_empty() {
            warn!(target: "Signaling", "{} data messages were throttled", throttled.len());
            actions.push(Action::Emit(SignalingEvent::DataMessagesFailedToSend(
                throttled,
            )));
        }
        actions
    }

    fn on_ping_pong(&mut self, ping_pong: pb::PingPongFrame) -> Vec<Action> {
        match pb::PingPongType::try_from(ping_pong.r#type) {
            Ok(pb::PingPongType::Ping) => vec![Action::Send(pb::SignalFrame {
                ping_pong: Some(pb::PingPongFrame {
                    r#type: pb::PingPongType::Pong as i32,
                    ping_id: ping_pong.ping_id,
                }),
                ..frame(FrameType::PingPong)
            })],
            Ok(pb::PingPongType::Pong) => {
                trace!(target: "Signaling", "Pong {}", ping_pong.ping_id);
                self.outstanding_pings = 0;
                Vec::new()
            }
            Err(_) => {
                debug!(target: "Signaling", "Unknown ping type {}", ping_pong.r#type);
                Vec::new()
            }
        }
    }

    /// Keepalive tick. Gives up on the transport after [`MAX_MISSED_PINGS`].
    pub fn ping(&mut self) -> Vec<Action> {
        if !self.state.is_joined() {
            return Vec::new();
        }
        if self.outstanding_pings >= MAX_MISSED_PINGS {
            warn!(
                target: "Signaling",
                "{} pings unanswered, treating transport as lost",
                self.outstanding_pings
            );
            return self.on_transport_lost();
        }
        self.outstanding_pings += 1;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        vec![Action::Send(pb::SignalFrame {
            ping_pong: Some(pb::PingPongFrame {
                r#type: pb::PingPongType::Ping as i32,
                ping_id: self.next_ping_id,
            }),
            ..frame(FrameType::PingPong)
        })]
    }

    /// Leaves the meeting. LEAVE goes out only if joined; the state is
    /// Closed afterwards either way.
    pub fn request_leave(&mut self) -> Vec<Action> {
        let was_joined = self.state.is_joined();
        if !self.transition(StateTransition::Leave) {
            return Vec::new();
        }
        info!(target: "Signaling", "Leaving meeting");
        let mut actions = Vec::new();
        if was_joined {
            actions.push(Action::Send(pb::SignalFrame {
                leave: Some(pb::LeaveFrame {}),
                ..frame(FrameType::Leave)
            }));
        }
        actions.push(Action::Emit(SignalingEvent::Closed));
        actions
    }

    pub fn on_transport_lost(&mut self) -> Vec<Action> {
        if !self.state.has_transport() {
            debug!(target: "Signaling", "Transport gone while {}", self.state);
            return Vec::new();
        }
        if !self.transition(StateTransition::TransportLost) {
            return Vec::new();
        }
        warn!(target: "Signaling", "Transport lost, reconnecting");
        self.has_received_first_index = false;
        self.outstanding_pings = 0;
        vec![Action::Reconnect]
    }

    /// The peer closed the websocket. Some close codes end the session.
    pub fn on_transport_closed(&mut self, code: Option<u16>) -> Vec<Action> {
        if let Some(auth) = code.and_then(AuthError::from_close_code)
            && !self.state.is_terminal()
        {
            return self.fail(FailureReason::Auth(auth));
        }
        self.on_transport_lost()
    }

    pub fn on_reconnect_exhausted(&mut self, attempts: u32) -> Vec<Action> {
        self.fail(FailureReason::Connect(ConnectError::RetriesExhausted {
            attempts,
        }))
    }

    pub fn set_mute(&mut self, muted: bool) -> Vec<Action> {
        if self.muted == muted {
            return Vec::new();
        }
        debug!(target: "Signaling", "Mute {} -> {}", self.muted, muted);
        self.muted = muted;
        if !self.state.is_joined() {
            warn!(target: "Signaling", "Cannot send mute state while {}", self.state);
            return Vec::new();
        }
        vec![Action::Send(pb::SignalFrame {
            audio_control: Some(pb::AudioControlFrame {
                muted: Some(muted),
            }),
            ..frame(FrameType::AudioControl)
        })]
    }

    pub fn send_data_message(&mut self, message: DataMessageToSend) -> Vec<Action> {
        if !self.state.is_joined() {
            warn!(target: "Signaling", "Cannot send data message while {}", self.state);
            return Vec::new();
        }
        match message.validate() {
            Ok(lifetime_ms) => vec![Action::Send(pb::SignalFrame {
                data_message: Some(pb::DataMessageFrame {
                    messages: vec![message.to_payload(lifetime_ms)],
                }),
                ..frame(FrameType::DataMessage)
            })],
            Err(reason) => {
                warn!(target: "Signaling", "Rejected data message on {:?}: {reason:?}", message.topic);
                vec![Action::Emit(SignalingEvent::DataMessagesFailedToSend(vec![
                    message.to_error(reason),
                ]))]
            }
        }
    }

    /// Sends SUBSCRIBE again so the service renegotiates media.
    pub fn resubscribe(&mut self) -> Vec<Action> {
        if !self.state.is_joined() {
            return Vec::new();
        }
        vec![self.subscribe_action()]
    }
}

fn missing(field: &'static str) -> Vec<Action> {
    warn!(target: "Signaling", "Dropping frame: {}", ProtocolError::MissingField(field));
    Vec::new()
}

fn parse_turn_credentials(turn: pb::TurnCredentials) -> Option<TurnCredentials> {
    let (Some(username), Some(password), Some(ttl)) = (turn.username, turn.password, turn.ttl)
    else {
        error!(target: "Signaling", "TURN credentials are incomplete");
        return None;
    };
    if turn.uris.is_empty() {
        error!(target: "Signaling", "TURN credentials carry no uris");
        return None;
    }
    Some(TurnCredentials {
        username,
        password,
        ttl,
        uris: turn.uris,
        expires_at: Utc::now() + TimeDelta::seconds(i64::from(ttl)),
    })
}
