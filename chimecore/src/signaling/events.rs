//! Notifications the state machine emits for the rest of the client.

use chrono::{DateTime, Utc};

use super::data_message::{DataMessageReceived, DataMessageSendError};
use crate::error::{AuthError, ConnectError, ProtocolError};
use crate::media::Codec;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Attendee {
    pub attendee_id: String,
    pub external_user_id: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
    pub ttl: u32,
    pub uris: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl TurnCredentials {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

impl std::fmt::Debug for TurnCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ttl", &self.ttl)
            .field("uris", &self.uris)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What the join negotiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaParameters {
    pub codec: Codec,
    pub turn_credentials: Option<TurnCredentials>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVideoSource {
    pub stream_id: u32,
    pub group_id: u32,
    pub max_bitrate_kbps: u32,
    pub attendee: Attendee,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeUpdate {
    pub attendee: Attendee,
    /// 0.0 (silent) to 1.0 (loudest).
    pub normalized_volume: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalStrengthUpdate {
    pub attendee: Attendee,
    /// 0.0 (no signal) to 1.0 (full strength).
    pub normalized_signal_strength: f32,
}

/// Why a session ended in the Failed state.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    Auth(AuthError),
    Protocol(ProtocolError),
    Connect(ConnectError),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth(e) => write!(f, "{e}"),
            Self::Protocol(e) => write!(f, "{e}"),
            Self::Connect(e) => write!(f, "{e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Joined(MediaParameters),
    /// First index after the join: the session is fully up.
    Started {
        turn_credentials: Option<TurnCredentials>,
        video_sources: Vec<RemoteVideoSource>,
    },
    MediaRenegotiated {
        codec: Codec,
        sdp_answer: String,
    },
    RemoteVideoSourcesAvailable(Vec<RemoteVideoSource>),
    RemoteVideoSourcesUnavailable(Vec<RemoteVideoSource>),
    AttendeeJoined(Attendee),
    AttendeeLeft(Attendee),
    AttendeeDropped(Attendee),
    AttendeeMuted(Attendee),
    AttendeeUnmuted(Attendee),
    VolumeUpdates(Vec<VolumeUpdate>),
    SignalStrengthChanges(Vec<SignalStrengthUpdate>),
    DataMessagesReceived(Vec<DataMessageReceived>),
    DataMessagesFailedToSend(Vec<DataMessageSendError>),
    AudioStatus(u32),
    LeaveAcknowledged,
    /// The meeting ended or the local side left.
    Closed,
    Failed(FailureReason),
}
