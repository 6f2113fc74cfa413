//! Transport layer abstraction for the offload stream service.
//!
//! Provides pluggable transport backends including:
//! - **TCP**: one connection carries one fragment stream
//! - **QUIC**: every bidirectional stream on a connection is its own
//!   fragment stream, so one device can run several sessions without
//!   head-of-line blocking
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │             StreamService               │
//! │         (Transport-Agnostic)            │
//! └──────────────────┬──────────────────────┘
//!                    │
//!          ┌────────┴────────┐
//!          ▼                 ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │  TcpTransport   │ │  QuicTransport  │
//! │  (connection)   │ │  (bidi stream)  │
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! Both carry the same length-prefixed frames, see [`read_frame`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use offload::transport::{TcpTransport, Transport};
//!
//! let transport = TcpTransport::bind("127.0.0.1:50051".parse()?).await?;
//! transport.serve(service, shutdown_rx).await?;
//! ```

mod config;
mod frame;
mod quic;
mod tcp;

pub use config::{CertConfig, QuicTransportConfig, TlsConfig, ALPN_PROTOCOL};
pub use frame::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};
pub use quic::QuicTransport;
pub use tcp::TcpTransport;

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::Result;
use crate::server::StreamService;

/// Transport kind selection for the offload server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Plain TCP (default)
    #[default]
    Tcp,
    /// QUIC, one fragment stream per bidirectional stream
    Quic,
    /// Both TCP and QUIC on their own ports
    Both,
}

impl TransportKind {
    /// Get descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Quic => "QUIC",
            Self::Both => "TCP+QUIC",
        }
    }

    /// Whether a TCP listener is needed
    pub fn uses_tcp(&self) -> bool {
        matches!(self, Self::Tcp | Self::Both)
    }

    /// Whether a QUIC endpoint is needed
    pub fn uses_quic(&self) -> bool {
        matches!(self, Self::Quic | Self::Both)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "quic" | "udp" => Ok(Self::Quic),
            "both" | "dual" => Ok(Self::Both),
            _ => Err(format!("Unknown transport kind: {}", s)),
        }
    }
}

/// Transport trait for pluggable network backends.
///
/// Implementations accept streams and hand each one to the
/// [`StreamService`]; the service stays transport-agnostic.
pub trait Transport: Send + Sync {
    /// Accept streams until `shutdown` flips to `true`.
    ///
    /// Streams already running receive the same signal through the service.
    fn serve(
        &self,
        service: StreamService,
        shutdown: watch::Receiver<bool>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Get the transport name for logging.
    fn name(&self) -> &'static str;

    /// Bound address (resolved when binding to port 0).
    fn local_addr(&self) -> Result<SocketAddr>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_transport_kind_from_str() {
        assert_eq!(TransportKind::from_str("tcp").unwrap(), TransportKind::Tcp);
        assert_eq!(
            TransportKind::from_str("QUIC").unwrap(),
            TransportKind::Quic
        );
        assert_eq!(
            TransportKind::from_str("both").unwrap(),
            TransportKind::Both
        );
        assert!(TransportKind::from_str("invalid").is_err());
    }

    #[test]
    fn test_transport_kind_listeners() {
        assert_eq!(TransportKind::default(), TransportKind::Tcp);
        assert!(TransportKind::Tcp.uses_tcp());
        assert!(!TransportKind::Tcp.uses_quic());
        assert!(TransportKind::Both.uses_tcp() && TransportKind::Both.uses_quic());
    }
}
