pub use chime_signaling_tokio_transport::TokioWebSocketTransportFactory;
pub use chimecore::net::{Transport, TransportConfig, TransportEvent, TransportFactory};

pub mod mock;
