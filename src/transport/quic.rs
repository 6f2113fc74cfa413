//! QUIC transport for the offload stream service.
//!
//! UDP-based transport with:
//! - **Stream multiplexing**: every bidirectional stream is an independent
//!   fragment stream, no head-of-line blocking between sessions
//! - **Connection migration**: survives edge devices changing networks
//! - **Built-in TLS 1.3**: secure by default
//!
//! # Architecture
//!
//! ```text
//! quinn::Endpoint (UDP socket)
//!        │
//!        ▼
//! quinn::Connection (one per edge device)
//!        │
//!        ▼
//! accept_bi() → (SendStream, RecvStream)
//!        │
//!        ▼
//! StreamService::serve_stream
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::sync::watch;

use super::config::QuicTransportConfig;
use super::Transport;
use crate::error::{OffloadError, Result};
use crate::server::StreamService;

/// QUIC transport using quinn.
#[derive(Debug)]
pub struct QuicTransport {
    endpoint: quinn::Endpoint,
}

impl QuicTransport {
    /// Open the endpoint described by `config`.
    pub fn bind(config: &QuicTransportConfig) -> Result<Self> {
        let server_config = config.build_quinn_config()?;
        let endpoint = quinn::Endpoint::server(server_config, config.listen_addr).map_err(|e| {
            OffloadError::Server(format!(
                "Failed to create QUIC endpoint on {}: {}",
                config.listen_addr, e
            ))
        })?;
        Ok(Self { endpoint })
    }

    /// Accept bidirectional streams on one connection until it closes.
    async fn handle_connection(
        service: StreamService,
        connection: quinn::Connection,
        shutdown: watch::Receiver<bool>,
    ) {
        let remote_addr = connection.remote_address();
        tracing::debug!("New QUIC connection from {}", remote_addr);

        loop {
            match connection.accept_bi().await {
                Ok((send, recv)) => {
                    let service = service.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        service.serve_stream(recv, send, remote_addr, shutdown).await;
                    });
                },
                Err(quinn::ConnectionError::ApplicationClosed(_))
                | Err(quinn::ConnectionError::LocallyClosed) => {
                    tracing::debug!("QUIC connection from {} closed", remote_addr);
                    break;
                },
                Err(e) => {
                    tracing::warn!("QUIC connection from {} failed: {}", remote_addr, e);
                    break;
                },
            }
        }
    }
}

impl Transport for QuicTransport {
    fn serve(
        &self,
        service: StreamService,
        mut shutdown: watch::Receiver<bool>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            tracing::info!("QUIC transport listening on {}", self.local_addr()?);

            while !*shutdown.borrow() {
                tokio::select! {
                    incoming = self.endpoint.accept() => {
                        let Some(connecting) = incoming else {
                            break;
                        };
                        let service = service.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            match connecting.await {
                                Ok(connection) => {
                                    Self::handle_connection(service, connection, shutdown).await;
                                }
                                Err(e) => {
                                    tracing::warn!("Failed to accept QUIC connection: {}", e);
                                }
                            }
                        });
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            self.endpoint.close(0u32.into(), b"server shutdown");
            tracing::info!("QUIC transport stopped");
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "QUIC"
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_quic_transport_bind() {
        let config =
            QuicTransportConfig::default().with_listen_addr(SocketAddr::from(([127, 0, 0, 1], 0)));
        let transport = QuicTransport::bind(&config).unwrap();
        assert_eq!(transport.name(), "QUIC");
        assert_ne!(transport.local_addr().unwrap().port(), 0);
    }
}
