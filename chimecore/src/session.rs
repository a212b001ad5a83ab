//! Immutable join parameters handed to the client by the launcher.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::DescriptorError;

/// Suffix the meeting service expects on content-share identities.
const CONTENT_SHARE_SUFFIX: &str = "#content";

/// Verbosity requested on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Verbose,
    Debug,
    Info,
    Warning,
    #[default]
    Error,
    Off,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            Self::Verbose => log::LevelFilter::Trace,
            Self::Debug => log::LevelFilter::Debug,
            Self::Info => log::LevelFilter::Info,
            Self::Warning => log::LevelFilter::Warn,
            Self::Error => log::LevelFilter::Error,
            Self::Off => log::LevelFilter::Off,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verbose => "verbose",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Off => "off",
        }
    }
}

impl FromStr for LogLevel {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "verbose" | "trace" => Ok(Self::Verbose),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "off" | "none" => Ok(Self::Off),
            other => Err(DescriptorError::InvalidLogLevel(other.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the local attendee.
#[derive(Clone, PartialEq, Eq)]
pub struct MeetingSessionCredentials {
    pub attendee_id: String,
    pub external_user_id: String,
    pub join_token: String,
}

impl fmt::Debug for MeetingSessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeetingSessionCredentials")
            .field("attendee_id", &self.attendee_id)
            .field("external_user_id", &self.external_user_id)
            .field("join_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingSessionUrls {
    pub audio_host_url: String,
    pub signaling_url: String,
}

/// Everything needed to join one meeting.
///
/// Built once by the binary and then shared read-only (usually behind an
/// `Arc`). The join token never appears in `Debug` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    meeting_id: String,
    external_meeting_id: String,
    credentials: MeetingSessionCredentials,
    urls: MeetingSessionUrls,
    log_level: LogLevel,
    audio_source: Option<PathBuf>,
}

impl SessionDescriptor {
    pub fn new(
        meeting_id: impl Into<String>,
        external_meeting_id: impl Into<String>,
        credentials: MeetingSessionCredentials,
        urls: MeetingSessionUrls,
    ) -> Result<Self, DescriptorError> {
        let meeting_id = meeting_id.into();
        if meeting_id.trim().is_empty() {
            return Err(DescriptorError::MissingField("meeting_id"));
        }
        if credentials.attendee_id.trim().is_empty() {
            return Err(DescriptorError::MissingField("attendee_id"));
        }
        if credentials.join_token.trim().is_empty() {
            return Err(DescriptorError::MissingField("join_token"));
        }
        validate_signaling_url(&urls.signaling_url)?;

        Ok(Self {
            meeting_id,
            external_meeting_id: external_meeting_id.into(),
            credentials,
            urls,
            log_level: LogLevel::default(),
            audio_source: None,
        })
    }

    pub fn with_log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = log_level;
        self
    }

    /// Sets the audio file to stream. An empty path means no source.
    pub fn with_audio_source(mut self, path: Option<PathBuf>) -> Self {
        self.audio_source = path.filter(|p| !p.as_os_str().is_empty());
        self
    }

    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    pub fn external_meeting_id(&self) -> &str {
        &self.external_meeting_id
    }

    pub fn credentials(&self) -> &MeetingSessionCredentials {
        &self.credentials
    }

    pub fn urls(&self) -> &MeetingSessionUrls {
        &self.urls
    }

    pub fn attendee_id(&self) -> &str {
        &self.credentials.attendee_id
    }

    pub fn external_user_id(&self) -> &str {
        &self.credentials.external_user_id
    }

    pub fn join_token(&self) -> &str {
        &self.credentials.join_token
    }

    pub fn signaling_url(&self) -> &str {
        &self.urls.signaling_url
    }

    pub fn audio_host_url(&self) -> &str {
        &self.urls.audio_host_url
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    pub fn audio_source(&self) -> Option<&Path> {
        self.audio_source.as_deref()
    }

    /// Display name shown in the banner: the part of the external user id
    /// after the first `#`, or the whole id when there is none.
    pub fn attendee_name(&self) -> &str {
        let id = &self.credentials.external_user_id;
        id.split_once('#').map(|(_, name)| name).unwrap_or(id)
    }

    /// Descriptor for the content-share attendee of the same meeting.
    pub fn content_share(&self) -> Self {
        Self {
            meeting_id: self.meeting_id.clone(),
            external_meeting_id: self.external_meeting_id.clone(),
            credentials: MeetingSessionCredentials {
                attendee_id: format!("{}{CONTENT_SHARE_SUFFIX}", self.credentials.attendee_id),
                external_user_id: self.credentials.external_user_id.clone(),
                join_token: format!("{}{CONTENT_SHARE_SUFFIX}", self.credentials.join_token),
            },
            urls: self.urls.clone(),
            log_level: self.log_level,
            audio_source: None,
        }
    }
}

/// Accepts `ws://host[...]` and `wss://host[...]` only.
pub fn validate_signaling_url(url: &str) -> Result<(), DescriptorError> {
    let rest = url
        .strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .ok_or_else(|| DescriptorError::InvalidSignalingUrl(url.to_string()))?;

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if authority.is_empty() || url.chars().any(char::is_whitespace) {
        return Err(DescriptorError::InvalidSignalingUrl(url.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> MeetingSessionCredentials {
        MeetingSessionCredentials {
            attendee_id: "attendee-1".to_string(),
            external_user_id: "ext-1#Alice".to_string(),
            join_token: "secret-token".to_string(),
        }
    }

    fn urls(signaling_url: &str) -> MeetingSessionUrls {
        MeetingSessionUrls {
            audio_host_url: "audio.example.com:3478".to_string(),
            signaling_url: signaling_url.to_string(),
        }
    }

    #[test]
    fn test_descriptor_accepts_websocket_urls() {
        for url in ["wss://signal.example.com/control/abc", "ws://127.0.0.1:9000"] {
            let descriptor =
                SessionDescriptor::new("meeting-1", "ext-meeting", credentials(), urls(url));
            assert!(descriptor.is_ok(), "{url} should be accepted");
        }
    }

    #[test]
    fn test_descriptor_rejects_bad_urls() {
        for url in ["https://signal.example.com", "wss://", "signal.example.com", "wss://a b"] {
            let err = SessionDescriptor::new("meeting-1", "ext", credentials(), urls(url))
                .unwrap_err();
            assert!(matches!(err, DescriptorError::InvalidSignalingUrl(_)));
        }
    }

    #[test]
    fn test_descriptor_requires_token_and_ids() {
        let mut creds = credentials();
        creds.join_token.clear();
        let err =
            SessionDescriptor::new("meeting-1", "ext", creds, urls("wss://x")).unwrap_err();
        assert!(matches!(err, DescriptorError::MissingField("join_token")));

        let err = SessionDescriptor::new(" ", "ext", credentials(), urls("wss://x")).unwrap_err();
        assert!(matches!(err, DescriptorError::MissingField("meeting_id")));
    }

    #[test]
    fn test_debug_redacts_join_token() {
        let descriptor =
            SessionDescriptor::new("meeting-1", "ext", credentials(), urls("wss://x")).unwrap();
        let debug = format!("{descriptor:?}");
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_content_share_descriptor() {
        let descriptor = SessionDescriptor::new("meeting-1", "ext", credentials(), urls("wss://x"))
            .unwrap()
            .with_audio_source(Some(PathBuf::from("input.wav")));
        let content = descriptor.content_share();
        assert_eq!(content.attendee_id(), "attendee-1#content");
        assert_eq!(content.join_token(), "secret-token#content");
        assert_eq!(content.external_user_id(), "ext-1#Alice");
        assert!(content.audio_source().is_none());
    }

    #[test]
    fn test_attendee_name_and_empty_audio_source() {
        let descriptor = SessionDescriptor::new("meeting-1", "ext", credentials(), urls("wss://x"))
            .unwrap()
            .with_audio_source(Some(PathBuf::new()));
        assert_eq!(descriptor.attendee_name(), "Alice");
        assert!(descriptor.audio_source().is_none());
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("VERBOSE".parse::<LogLevel>().unwrap(), LogLevel::Verbose);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!(LogLevel::default(), LogLevel::Error);
        assert_eq!(LogLevel::Info.to_level_filter(), log::LevelFilter::Info);
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
