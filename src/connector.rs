//! Transport connector: dials the signaling endpoint and wraps the result
//! in a [`Channel`] that closes its transport at most once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chimecore::error::{ClosedError, ConnectError};
use chimecore::session::validate_signaling_url;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::transport::{Transport, TransportConfig, TransportEvent, TransportFactory};

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Closed(#[from] ClosedError),
    #[error("transport send failed: {0}")]
    Transport(anyhow::Error),
}

/// One live websocket connection.
pub struct Channel {
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
    closed: AtomicBool,
}

impl Channel {
    pub fn new(transport: Arc<dyn Transport>, events: mpsc::Receiver<TransportEvent>) -> Self {
        Self {
            transport,
            events,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn send(&self, message: Bytes) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(ClosedError.into());
        }
        self.transport
            .send_frame(message)
            .await
            .map_err(SendError::Transport)
    }

    /// Next transport notification, in delivery order. `None` once the
    /// read side is gone.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the underlying transport. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(target: "Transport", "Closing channel");
        self.transport.disconnect().await;
    }
}

/// Dials `config.url`, bounding the handshake by `timeout`.
pub async fn connect(
    factory: &dyn TransportFactory,
    config: &TransportConfig,
    timeout: Duration,
) -> Result<Channel, ConnectError> {
    validate_signaling_url(&config.url).map_err(|_| ConnectError::InvalidUrl(config.url.clone()))?;

    let (transport, mut events) =
        match tokio::time::timeout(timeout, factory.create_transport(config)).await {
            Ok(Ok(created)) => created,
            Ok(Err(e)) => {
                warn!(target: "Transport", "Connect failed: {e}");
                return Err(ConnectError::Handshake(e.to_string()));
            }
            Err(_) => {
                warn!(target: "Transport", "Connect timed out after {timeout:?}");
                return Err(ConnectError::Timeout(timeout));
            }
        };

    // The first event of a fresh transport is its Connected notice.
    match events.recv().await {
        Some(TransportEvent::Connected) => {
            info!(target: "Transport", "Connected to {}", config.url);
            Ok(Channel::new(transport, events))
        }
        other => {
            warn!(target: "Transport", "Transport did not come up: {other:?}");
            transport.disconnect().await;
            Err(ConnectError::Closed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransportFactory;

    fn config() -> TransportConfig {
        TransportConfig::new("wss://signal.example.com/control/m", "token")
    }

    #[tokio::test]
    async fn test_send_after_close_fails_and_close_is_idempotent() {
        let (factory, mut connections) = MockTransportFactory::new();
        let channel = connect(&factory, &config(), Duration::from_secs(1))
            .await
            .unwrap();
        let mut server = connections.recv().await.unwrap();

        channel.send(Bytes::from_static(b"\x02\x08")).await.unwrap();
        assert_eq!(server.sent.recv().await.unwrap(), Bytes::from_static(b"\x02\x08"));

        channel.close().await;
        channel.close().await;
        assert!(matches!(
            channel.send(Bytes::from_static(b"\x02\x08")).await,
            Err(SendError::Closed(_))
        ));
        assert_eq!(factory.disconnects(), 1);
        assert!(server.is_closed_by_client());
    }

    #[tokio::test]
    async fn test_invalid_url_is_not_dialed() {
        let (factory, _connections) = MockTransportFactory::new();
        let config = TransportConfig::new("https://signal.example.com", "token");
        let result = connect(&factory, &config, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ConnectError::InvalidUrl(_))));
        assert_eq!(factory.creates(), 0);
    }

    #[tokio::test]
    async fn test_refused_dial_is_handshake_error() {
        let (factory, _connections) = MockTransportFactory::new();
        factory.refuse_next(1);
        let result = connect(&factory, &config(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ConnectError::Handshake(_))));
        assert!(connect(&factory, &config(), Duration::from_secs(1)).await.is_ok());
        assert_eq!(factory.creates(), 2);
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (factory, mut connections) = MockTransportFactory::new();
        let mut channel = connect(&factory, &config(), Duration::from_secs(1))
            .await
            .unwrap();
        let server = connections.recv().await.unwrap();
        for i in 0..5u8 {
            server.deliver(Bytes::from(vec![0x02, i])).await;
        }
        for i in 0..5u8 {
            assert_eq!(
                channel.next_event().await,
                Some(TransportEvent::FrameReceived(Bytes::from(vec![0x02, i])))
            );
        }
    }
}
