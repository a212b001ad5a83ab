//! Tokio websocket transport for the meeting signaling client.
//!
//! Implements [`TransportFactory`] on `tokio-tungstenite`. Messages are
//! passed through untouched; the kind-byte envelope lives in `chimecore`.

use async_trait::async_trait;
use bytes::Bytes;
use chimecore::net::{CLOSE_NORMAL, Transport, TransportConfig, TransportEvent, TransportFactory};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// Capacity of the event channel handed to the client.
const EVENT_QUEUE_DEPTH: usize = 256;

pub struct TokioWebSocketTransport {
    ws_sink: Mutex<Option<WsSink>>,
}

impl TokioWebSocketTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Mutex::new(Some(sink)),
        }
    }
}

#[async_trait]
impl Transport for TokioWebSocketTransport {
    async fn send_frame(&self, frame: Bytes) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        trace!(target: "Transport", "--> Sending message: {} bytes", frame.len());
        sink.send(Message::Binary(frame))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn disconnect(&self) {
        let Some(mut sink) = self.ws_sink.lock().await.take() else {
            return;
        };
        debug!(target: "Transport", "Closing websocket");
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::from(CLOSE_NORMAL),
            reason: "".into(),
        }));
        if let Err(e) = sink.send(close).await {
            debug!(target: "Transport", "Close frame not sent: {e}");
        }
        let _ = sink.close().await;
    }
}

/// Dials the signaling endpoint over `ws://` or `wss://` (native TLS).
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioWebSocketTransportFactory;

impl TokioWebSocketTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
        config: &TransportConfig,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| anyhow::anyhow!("Invalid signaling url: {}", e))?;
        for (name, value) in config.handshake_headers() {
            request.headers_mut().insert(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(&value)?,
            );
        }

        info!(target: "Transport", "Dialing {}", config.url);
        let (client, response) = connect_async(request)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;
        debug!(target: "Transport", "Handshake completed with status {}", response.status());

        let (sink, stream) = client.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let transport = Arc::new(TokioWebSocketTransport::new(sink));

        // Queue Connected before the pump can report anything else.
        let _ = event_tx.send(TransportEvent::Connected).await;
        tokio::task::spawn(read_pump(stream, event_tx));

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    let mut close_code = None;

    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => {
                trace!(target: "Transport", "<-- Received message: {} bytes", data.len());
                if event_tx
                    .send(TransportEvent::FrameReceived(data))
                    .await
                    .is_err()
                {
                    warn!(target: "Transport", "Event receiver dropped, closing read pump");
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                close_code = frame.map(|f| u16::from(f.code));
                debug!(target: "Transport", "Received close frame {close_code:?}");
                break;
            }
            Some(Ok(Message::Text(text))) => {
                debug!(target: "Transport", "Ignoring text message of {} bytes", text.len());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(target: "Transport", "Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!(target: "Transport", "Websocket stream ended");
                break;
            }
        }
    }

    let _ = event_tx
        .send(TransportEvent::Disconnected { code: close_code })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    /// Accepts one client, records its handshake headers, echoes one
    /// message and closes with `close_code`.
    async fn serve_once(close_code: u16) -> (String, Arc<StdMutex<Vec<(String, String)>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/control/meeting", listener.local_addr().unwrap());
        let headers = Arc::new(StdMutex::new(Vec::new()));
        let seen = headers.clone();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let mut seen = seen.lock().unwrap();
                for (name, value) in req.headers() {
                    seen.push((name.to_string(), value.to_str().unwrap_or("").to_string()));
                }
                Ok(resp)
            };
            let mut ws = accept_hdr_async(stream, callback).await.unwrap();
            if let Some(Ok(msg)) = ws.next().await
                && msg.is_binary()
            {
                ws.send(msg).await.unwrap();
            }
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::from(close_code),
                    reason: "".into(),
                }))
                .await;
            // Drain until the client answers the close.
            while ws.next().await.is_some() {}
        });

        (url, headers)
    }

    #[tokio::test]
    async fn test_handshake_echo_and_close_code() {
        let (url, headers) = serve_once(4410).await;
        let config = TransportConfig::new(url, "secret-token");
        let (transport, mut events) = TokioWebSocketTransportFactory::new()
            .create_transport(&config)
            .await
            .unwrap();

        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        transport
            .send_frame(Bytes::from_static(&[0x02, 0x08, 0x01]))
            .await
            .unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::FrameReceived(Bytes::from_static(&[
                0x02, 0x08, 0x01
            ])))
        );
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Disconnected { code: Some(4410) })
        );

        let headers = headers.lock().unwrap().clone();
        assert!(
            headers
                .iter()
                .any(|(n, v)| n == "cookie" && v == "_aws_wt_session=secret-token")
        );
        assert!(
            headers
                .iter()
                .any(|(n, v)| n == "x-chime-control-protocol-version" && v == "3")
        );
    }

    #[tokio::test]
    async fn test_send_after_disconnect_fails() {
        let (url, _headers) = serve_once(1000).await;
        let config = TransportConfig::new(url, "token");
        let (transport, _events) = TokioWebSocketTransportFactory::new()
            .create_transport(&config)
            .await
            .unwrap();

        transport.disconnect().await;
        transport.disconnect().await;
        assert!(transport.send_frame(Bytes::from_static(&[0x02, 0x00])).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let config = TransportConfig::new("not a url", "token");
        assert!(
            TokioWebSocketTransportFactory::new()
                .create_transport(&config)
                .await
                .is_err()
        );
    }
}
