//! Topic-addressed data messages relayed through the signaling channel.

use once_cell::sync::Lazy;
use regex::Regex;

use super::events::Attendee;
use crate::proto::signal_rtc::{DataMessageFrame, DataMessagePayload};

/// Largest payload the service relays.
pub const MAX_DATA_MESSAGE_SIZE: usize = 2048;

static TOPIC_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,36}$").expect("topic pattern is a valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMessageSendErrorReason {
    /// The service dropped the message because the sender is over its rate.
    Throttled,
    InvalidTopic,
    InvalidDataMessageSize,
    InvalidLifetimeMs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub topic: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessageSendError {
    pub message: DataMessage,
    pub reason: DataMessageSendErrorReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessageReceived {
    /// Ingest time at the service, in milliseconds since the epoch.
    pub timestamp_ms: i64,
    pub topic: String,
    pub data: Vec<u8>,
    pub sender: Attendee,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessageToSend {
    pub topic: String,
    pub data: Vec<u8>,
    /// How long the service keeps the message for late joiners; 0 disables.
    pub lifetime_ms: i64,
}

impl DataMessageToSend {
    pub fn new(topic: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            data: data.into(),
            lifetime_ms: 0,
        }
    }

    pub fn with_lifetime_ms(mut self, lifetime_ms: i64) -> Self {
        self.lifetime_ms = lifetime_ms;
        self
    }

    /// Checks size, then topic, then lifetime.
    pub fn validate(&self) -> Result<u32, DataMessageSendErrorReason> {
        if self.data.len() > MAX_DATA_MESSAGE_SIZE {
            return Err(DataMessageSendErrorReason::InvalidDataMessageSize);
        }
        if !TOPIC_REGEX.is_match(&self.topic) {
            return Err(DataMessageSendErrorReason::InvalidTopic);
        }
        u32::try_from(self.lifetime_ms).map_err(|_| DataMessageSendErrorReason::InvalidLifetimeMs)
    }

    pub fn to_error(&self, reason: DataMessageSendErrorReason) -> DataMessageSendError {
        DataMessageSendError {
            message: DataMessage {
                topic: self.topic.clone(),
                data: self.data.clone(),
            },
            reason,
        }
    }

    pub(crate) fn to_payload(&self, lifetime_ms: u32) -> DataMessagePayload {
        DataMessagePayload {
            topic: Some(self.topic.clone()),
            data: Some(self.data.clone()),
            lifetime_ms: Some(lifetime_ms),
            ..Default::default()
        }
    }
}

/// Splits an inbound frame into delivered messages and throttle bounces.
///
/// A zero ingest time marks one of our own sends that the service throttled.
pub fn split_inbound(
    frame: &DataMessageFrame,
) -> (Vec<DataMessageReceived>, Vec<DataMessageSendError>) {
    let mut received = Vec::with_capacity(frame.messages.len());
    let mut throttled = Vec::new();

    for payload in &frame.messages {
        let topic = payload.topic.clone().unwrap_or_default();
        let data = payload.data.clone().unwrap_or_default();
        match payload.ingest_time_ns.unwrap_or(0) {
            0 => throttled.push(DataMessageSendError {
                message: DataMessage { topic, data },
                reason: DataMessageSendErrorReason::Throttled,
            }),
            ingest_ns => received.push(DataMessageReceived {
                timestamp_ms: ingest_ns / 1_000_000,
                topic,
                data,
                sender: Attendee {
                    attendee_id: payload.sender_attendee_id.clone().unwrap_or_default(),
                    external_user_id: payload.sender_external_user_id.clone().unwrap_or_default(),
                },
            }),
        }
    }
    (received, throttled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_validation() {
        for topic in ["chat", "a", "under_score-dash", "x".repeat(36).as_str()] {
            assert_eq!(DataMessageToSend::new(topic, "hi").validate(), Ok(0), "{topic}");
        }
        for topic in ["", "has space", "dots.not.allowed", "x".repeat(37).as_str()] {
            assert_eq!(
                DataMessageToSend::new(topic, "hi").validate(),
                Err(DataMessageSendErrorReason::InvalidTopic),
                "{topic:?}"
            );
        }
    }

    #[test]
    fn test_size_is_checked_before_topic() {
        let message = DataMessageToSend::new("bad topic", vec![0u8; MAX_DATA_MESSAGE_SIZE + 1]);
        assert_eq!(
            message.validate(),
            Err(DataMessageSendErrorReason::InvalidDataMessageSize)
        );
        let at_limit = DataMessageToSend::new("ok", vec![0u8; MAX_DATA_MESSAGE_SIZE]);
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn test_negative_lifetime_is_rejected() {
        let message = DataMessageToSend::new("ok", "x").with_lifetime_ms(-1);
        assert_eq!(
            message.validate(),
            Err(DataMessageSendErrorReason::InvalidLifetimeMs)
        );
        let message = DataMessageToSend::new("ok", "x").with_lifetime_ms(300_000);
        assert_eq!(message.validate(), Ok(300_000));
    }

    #[test]
    fn test_split_inbound_separates_throttled() {
        let frame = DataMessageFrame {
            messages: vec![
                DataMessagePayload {
                    topic: Some("chat".into()),
                    data: Some(b"hello".to_vec()),
                    sender_attendee_id: Some("a1".into()),
                    sender_external_user_id: Some("u1".into()),
                    ingest_time_ns: Some(1_700_000_000_123_456_789),
                    ..Default::default()
                },
                DataMessagePayload {
                    topic: Some("chat".into()),
                    data: Some(b"too fast".to_vec()),
                    ingest_time_ns: Some(0),
                    ..Default::default()
                },
            ],
        };
        let (received, throttled) = split_inbound(&frame);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].timestamp_ms, 1_700_000_000_123);
        assert_eq!(received[0].sender.attendee_id, "a1");
        assert_eq!(throttled.len(), 1);
        assert_eq!(throttled[0].reason, DataMessageSendErrorReason::Throttled);
        assert_eq!(throttled[0].message.data, b"too fast");
    }
}
