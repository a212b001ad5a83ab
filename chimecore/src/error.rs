//! Error types shared by every layer of the client.

use std::time::Duration;

use thiserror::Error;

/// Invalid launcher input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("signaling url must be ws:// or wss:// with a host, got {0:?}")]
    InvalidSignalingUrl(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("unknown log level: {0}")]
    InvalidLogLevel(String),
}

/// Failure to bring a transport channel up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),
    #[error("websocket handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("websocket connect failed: {0}")]
    Handshake(String),
    #[error("channel closed while connecting")]
    Closed,
    #[error("gave up after {attempts} reconnect attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Returned by `send` once the channel has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("channel is closed")]
pub struct ClosedError;

/// The meeting service refused the join. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authentication rejected (status {status})")]
    AuthenticationRejected { status: u32 },
    #[error("meeting has ended")]
    MeetingEnded,
    #[error("meeting is at capacity")]
    AtCapacity,
    #[error("join failed with status {0}")]
    Other(u32),
}

impl AuthError {
    /// Maps an audio status code (>= 400) to a join failure.
    pub fn from_audio_status(status: u32) -> Self {
        match status {
            401 | 403 => Self::AuthenticationRejected { status },
            409 => Self::AtCapacity,
            410 => Self::MeetingEnded,
            other => Self::Other(other),
        }
    }

    /// Maps a websocket close code to a join failure, if it signals one.
    pub fn from_close_code(code: u16) -> Option<Self> {
        match code {
            4401 | 4403 => Some(Self::AuthenticationRejected {
                status: u32::from(code - 4000),
            }),
            4409 => Some(Self::AtCapacity),
            4410 => Some(Self::MeetingEnded),
            _ => None,
        }
    }
}

/// Malformed or unexpected inbound bytes.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("message too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported protocol message kind 0x{0:02x}")]
    UnsupportedVersion(u8),
    #[error("failed to decode signal frame: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("signal frame is missing {0}")]
    MissingField(&'static str),
    #[error("malformed rtp packet: {0}")]
    Rtp(&'static str),
}

impl ProtocolError {
    /// Only a version mismatch ends the session; everything else is dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnsupportedVersion(_))
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("audio source error: {0}")]
    Source(String),
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{consecutive} consecutive frames failed to decode")]
    SustainedDecodeFailure { consecutive: u32 },
    #[error("media sink error: {0}")]
    Sink(#[from] std::io::Error),
}

/// A resource failed to release during shutdown. Logged, never fatal.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("leave was not acknowledged within {0:?}")]
    LeaveTimeout(Duration),
    #[error("failed to flush media sink: {0}")]
    Flush(#[source] std::io::Error),
    #[error("task did not finish cleanly: {0}")]
    Task(String),
}

/// Error returned by the client handle once the actor is gone.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("client stopped unexpectedly")]
    ClientGone,
}

/// Process exit status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Left the meeting cleanly.
    Success,
    /// Session ended in the Failed state.
    Failed,
    InvalidArguments,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failed => 1,
            Self::InvalidArguments => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_version_mismatch_is_fatal() {
        assert!(ProtocolError::UnsupportedVersion(0x07).is_fatal());
        assert!(!ProtocolError::TooShort(1).is_fatal());
        assert!(!ProtocolError::MissingField("join_ack").is_fatal());
    }

    #[test]
    fn test_auth_error_mapping() {
        assert_eq!(
            AuthError::from_audio_status(403),
            AuthError::AuthenticationRejected { status: 403 }
        );
        assert_eq!(AuthError::from_audio_status(410), AuthError::MeetingEnded);
        assert_eq!(AuthError::from_audio_status(500), AuthError::Other(500));
        assert_eq!(
            AuthError::from_close_code(4401),
            Some(AuthError::AuthenticationRejected { status: 401 })
        );
        assert_eq!(AuthError::from_close_code(4410), Some(AuthError::MeetingEnded));
        assert_eq!(AuthError::from_close_code(1000), None);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(ExitStatus::Failed.code(), 1);
        assert_eq!(ExitStatus::InvalidArguments.code(), 2);
    }
}
