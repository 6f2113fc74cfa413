//! TCP transport: each accepted connection is one fragment stream.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::net::TcpListener;
use tokio::sync::watch;

use super::Transport;
use crate::error::{OffloadError, Result};
use crate::server::StreamService;

/// TCP transport over a bound listener.
#[derive(Debug)]
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a listener.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            OffloadError::Server(format!("Failed to bind TCP to {}: {}", addr, e))
        })?;
        Ok(Self { listener })
    }

    /// Bind on localhost; port 0 picks a free port.
    pub async fn localhost(port: u16) -> Result<Self> {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], port))).await
    }
}

impl Transport for TcpTransport {
    fn serve(
        &self,
        service: StreamService,
        mut shutdown: watch::Receiver<bool>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            tracing::info!("TCP transport listening on {}", self.local_addr()?);

            while !*shutdown.borrow() {
                tokio::select! {
                    accepted = self.listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(conn) => conn,
                            Err(e) => {
                                tracing::warn!("Failed to accept TCP connection: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                        }
                        let (reader, writer) = stream.into_split();
                        let service = service.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            service.serve_stream(reader, writer, peer, shutdown).await;
                        });
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("TCP transport stopped");
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "TCP"
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
