//! In-memory transport for driving the client without a network.
//!
//! Every dial hands the test a [`MockConnection`]: the messages the client
//! sent, plus a sender for injecting inbound events.

use super::*;
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use chimecore::envelope::{self, Inbound};
use chimecore::proto::signal_rtc::SignalFrame;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// The server side of one mock connection.
pub struct MockConnection {
    /// Messages the client sent, in order.
    pub sent: mpsc::UnboundedReceiver<Bytes>,
    /// Feeds events to the client as if they came off the wire.
    pub events: mpsc::Sender<TransportEvent>,
    /// The config the client dialed with.
    pub config: TransportConfig,
    closed: Arc<AtomicBool>,
}

impl MockConnection {
    pub async fn deliver(&self, message: Bytes) {
        let _ = self.events.send(TransportEvent::FrameReceived(message)).await;
    }

    /// Delivers `frame` behind the signal envelope.
    pub async fn reply(&self, mut frame: SignalFrame) {
        self.deliver(envelope::encode_signal(&mut frame, 0)).await;
    }

    /// Next signal frame the client sent, skipping media. `None` once the
    /// client side is gone.
    pub async fn next_signal(&mut self) -> Option<SignalFrame> {
        while let Some(message) = self.sent.recv().await {
            if let Ok(Inbound::Signal(frame)) = envelope::decode(message) {
                return Some(frame);
            }
        }
        None
    }

    /// Drops the connection from the server side.
    pub async fn drop_connection(&self, code: Option<u16>) {
        let _ = self.events.send(TransportEvent::Disconnected { code }).await;
    }

    pub fn is_closed_by_client(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct MockTransport {
    sent: mpsc::UnboundedSender<Bytes>,
    closed: Arc<AtomicBool>,
    disconnects: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_frame(&self, frame: Bytes) -> Result<(), anyhow::Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("Socket is closed"));
        }
        self.sent
            .send(frame)
            .map_err(|_| anyhow!("mock server went away"))
    }

    async fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct Counters {
    creates: AtomicUsize,
    disconnects: Arc<AtomicUsize>,
    refuse_next: AtomicUsize,
}

/// Counts dials and disconnects; can refuse dials to exercise backoff.
#[derive(Clone)]
pub struct MockTransportFactory {
    counters: Arc<Counters>,
    connections: mpsc::UnboundedSender<MockConnection>,
}

impl MockTransportFactory {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Self {
            counters: Arc::new(Counters::default()),
            connections: tx,
        };
        (factory, rx)
    }

    /// Makes the next `count` dials fail.
    pub fn refuse_next(&self, count: usize) {
        self.counters.refuse_next.store(count, Ordering::SeqCst);
    }

    /// Dial attempts, refused ones included.
    pub fn creates(&self) -> usize {
        self.counters.creates.load(Ordering::SeqCst)
    }

    /// Transports the client closed.
    pub fn disconnects(&self) -> usize {
        self.counters.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create_transport(
        &self,
        config: &TransportConfig,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .counters
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(anyhow!("connection refused"));
        }

        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(64);
        let closed = Arc::new(AtomicBool::new(false));
        let _ = event_tx.send(TransportEvent::Connected).await;

        let transport = MockTransport {
            sent: sent_tx,
            closed: closed.clone(),
            disconnects: self.counters.disconnects.clone(),
        };
        let connection = MockConnection {
            sent: sent_rx,
            events: event_tx,
            config: config.clone(),
            closed,
        };
        self.connections
            .send(connection)
            .map_err(|_| anyhow!("mock server went away"))?;

        Ok((Arc::new(transport), event_rx))
    }
}
