//! Edge-side client for the fragment stream.
//!
//! ```rust,ignore
//! use offload::client::EdgeClient;
//!
//! let mut client = EdgeClient::connect("10.0.0.2:50051").await?;
//! let response = client.offload("cam-1", &activation, 3, 64 * 1024, false).await?;
//! println!("{}", String::from_utf8_lossy(&response.results));
//! client.end("cam-1").await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::{OffloadError, Result};
use crate::protocol::{Action, Fragment, Response};
use crate::transport::{read_frame, write_frame, ALPN_PROTOCOL, DEFAULT_MAX_FRAME_BYTES};

/// One fragment stream to an offload server.
pub struct EdgeClient<R = OwnedReadHalf, W = OwnedWriteHalf> {
    reader: R,
    writer: W,
    max_frame_bytes: usize,
    // Keeps the QUIC connection open for the stream's lifetime
    _quic: Option<(quinn::Endpoint, quinn::Connection)>,
}

impl EdgeClient {
    /// Connect over TCP.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| OffloadError::Transport(format!("Failed to connect: {e}")))?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer))
    }
}

impl EdgeClient<quinn::RecvStream, quinn::SendStream> {
    /// Open a QUIC connection and one bidirectional stream on it.
    ///
    /// `roots` are the DER certificates trusted for `server_name`.
    pub async fn connect_quic(
        addr: SocketAddr,
        server_name: &str,
        roots: &[rustls::Certificate],
    ) -> Result<Self> {
        let mut store = rustls::RootCertStore::empty();
        for cert in roots {
            store
                .add(cert)
                .map_err(|e| OffloadError::Config(format!("Invalid root certificate: {e}")))?;
        }
        let mut crypto = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(store)
            .with_no_client_auth();
        crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        let bind: SocketAddr = if addr.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0, 0, 0, 0], 0))
        };
        let endpoint = quinn::Endpoint::client(bind)?;
        let connection = endpoint
            .connect_with(quinn::ClientConfig::new(Arc::new(crypto)), addr, server_name)
            .map_err(|e| OffloadError::Transport(format!("Failed to connect: {e}")))?
            .await
            .map_err(|e| OffloadError::Transport(format!("QUIC handshake failed: {e}")))?;
        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| OffloadError::Transport(format!("Failed to open stream: {e}")))?;

        let mut client = Self::new(recv, send);
        client._quic = Some((endpoint, connection));
        Ok(client)
    }
}

impl<R, W> EdgeClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wrap an already-open stream.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            _quic: None,
        }
    }

    /// Send one fragment.
    pub async fn send(&mut self, fragment: &Fragment) -> Result<()> {
        write_frame(&mut self.writer, &fragment.encode()).await
    }

    /// Next response, `None` once the server closed the stream.
    pub async fn recv(&mut self) -> Result<Option<Response>> {
        match read_frame(&mut self.reader, self.max_frame_bytes).await? {
            Some(body) => Response::decode(&body).map(Some),
            None => Ok(None),
        }
    }

    /// Chunk `payload`, send it as a fresh session run and wait for the
    /// prediction.
    ///
    /// The first fragment carries RESET; the last carries APPEND and
    /// INFERENCE, plus COMPRESSED when `compressed` is set.
    pub async fn offload(
        &mut self,
        id: &str,
        payload: &[u8],
        layer: i32,
        chunk_size: usize,
        compressed: bool,
    ) -> Result<Response> {
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(chunk_size.max(1)).collect()
        };
        let last = chunks.len() - 1;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut fragment = Fragment::new(id)
                .with_chunk(Bytes::copy_from_slice(chunk))
                .with_layer(layer);
            if i == 0 {
                fragment = fragment.with_action(Action::Reset);
            }
            if i == last {
                fragment = fragment
                    .with_action(Action::Append)
                    .with_action(Action::Inference);
                if compressed {
                    fragment = fragment.with_action(Action::Compressed);
                }
            }
            self.send(&fragment).await?;
        }
        tracing::debug!(session = %id, bytes = payload.len(), layer, "payload offloaded");

        loop {
            match self.recv().await? {
                Some(response) if response.id == id => return Ok(response),
                Some(other) => {
                    tracing::debug!(session = %other.id, "skipping response for another session");
                },
                None => {
                    return Err(OffloadError::Transport(
                        "Server closed the stream before responding".to_string(),
                    ))
                },
            }
        }
    }

    /// Terminate a session on the server.
    pub async fn end(&mut self, id: &str) -> Result<()> {
        self.send(&Fragment::new(id).with_action(Action::End)).await
    }

    /// Close the sending side; responses already in flight can still be read.
    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
