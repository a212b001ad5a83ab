use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Protocol revision announced in the websocket handshake.
pub const CONTROL_PROTOCOL_VERSION: &str = "3";
pub const CONTROL_PROTOCOL_HEADER: &str = "X-Chime-Control-Protocol-Version";
/// Cookie carrying the join token during the handshake.
pub const SESSION_COOKIE: &str = "_aws_wt_session";

/// Normal websocket closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// An event produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A binary message has been received from the server.
    FrameReceived(Bytes),
    /// The connection was lost, with the close code if the peer sent one.
    Disconnected { code: Option<u16> },
}

/// Represents an active network connection.
/// The transport moves opaque binary messages and knows nothing about envelopes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one binary message to the server.
    async fn send_frame(&self, frame: Bytes) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Dials `config.url` and returns the transport along with its event stream.
    async fn create_transport(
        &self,
        config: &TransportConfig,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}

/// What a factory needs to dial the signaling endpoint.
#[derive(Clone)]
pub struct TransportConfig {
    pub url: String,
    join_token: String,
    pub connect_timeout: Duration,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>, join_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            join_token: join_token.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Extra handshake headers. The join token only ever leaves the process here.
    pub fn handshake_headers(&self) -> [(&'static str, String); 2] {
        [
            ("Cookie", format!("{SESSION_COOKIE}={}", self.join_token)),
            (
                CONTROL_PROTOCOL_HEADER,
                CONTROL_PROTOCOL_VERSION.to_string(),
            ),
        ]
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("url", &self.url)
            .field("join_token", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
