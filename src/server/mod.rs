//! Offload server: stream service, lifecycle and admin API.
//!
//! ```text
//! Server::init(config)          load model once → Arc<Engine>
//!        │
//!        ▼
//! Server::start()               bind transports (+ admin API)
//!        │
//!        ▼
//! ServerHandle                  local_addr() / shutdown() / wait()
//! ```
//!
//! Every accepted stream gets its own task and its own
//! [`StreamHandler`]; a semaphore of `max_workers` permits caps how many are
//! served at once.
//!
//! # Example
//!
//! ```rust,ignore
//! use offload::config::Config;
//! use offload::server::Server;
//!
//! let handle = Server::init(Config::default())?.start().await?;
//! println!("listening on {:?}", handle.local_addr());
//! handle.shutdown();
//! handle.wait().await?;
//! ```

mod admin;
mod engine;
mod handler;
mod state;

pub use admin::{create_router, health_check, AdminState, HealthResponse, StatusResponse};
pub use engine::Engine;
pub use handler::{SessionRegistry, StreamHandler};
pub use state::{ServerStats, StatsSnapshot, StreamGuard};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{Config, SessionConfig};
use crate::error::{OffloadError, Result};
use crate::transport::{QuicTransport, QuicTransportConfig, TcpTransport, Transport};

/// How long `wait` lets running streams finish after shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Hands accepted streams to a [`StreamHandler`] under the worker limit.
#[derive(Clone)]
pub struct StreamService {
    engine: Arc<Engine>,
    stats: Arc<ServerStats>,
    workers: Arc<Semaphore>,
    session: SessionConfig,
    max_frame_bytes: usize,
}

impl StreamService {
    /// Service sharing `engine` and `stats`, sized by `config.server`.
    pub fn new(engine: Arc<Engine>, stats: Arc<ServerStats>, config: &Config) -> Self {
        Self {
            engine,
            stats,
            workers: Arc::new(Semaphore::new(config.server.max_workers)),
            session: config.session.clone(),
            max_frame_bytes: config.server.max_frame_bytes,
        }
    }

    /// Serve one stream to completion.
    pub async fn serve_stream<R, W>(
        &self,
        reader: R,
        writer: W,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let stream_id = Uuid::new_v4();
        let span = tracing::info_span!("stream", id = %stream_id, peer = %peer);

        async move {
            if self.workers.available_permits() == 0 {
                tracing::debug!("all workers busy, stream queued");
            }
            let permit = tokio::select! {
                permit = Arc::clone(&self.workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                () = stopped(&mut shutdown) => return,
            };

            let _guard = self.stats.open_stream();
            tracing::info!("stream opened");

            let handler = StreamHandler::new(Arc::clone(&self.engine), Arc::clone(&self.stats))
                .with_session_config(self.session.clone())
                .with_max_frame_bytes(self.max_frame_bytes);
            match handler.run(reader, writer, shutdown).await {
                Ok(()) => tracing::info!("stream closed"),
                Err(e) => tracing::warn!("stream ended: {e}"),
            }
            drop(permit);
        }
        .instrument(span)
        .await;
    }

    /// Wait until every running stream released its worker.
    async fn drain(&self, max_workers: usize) -> bool {
        let permits = u32::try_from(max_workers).unwrap_or(u32::MAX);
        tokio::time::timeout(DRAIN_TIMEOUT, self.workers.acquire_many(permits))
            .await
            .is_ok()
    }
}

/// Server initialised with a loaded model, not yet listening.
pub struct Server {
    config: Config,
    engine: Arc<Engine>,
    stats: Arc<ServerStats>,
}

impl Server {
    /// Validate `config` and load the model.
    pub fn init(config: Config) -> Result<Self> {
        config.validate()?;
        let engine = Engine::from_config(&config)?;
        Ok(Self::with_engine(config, engine))
    }

    /// Use an already-built engine.
    pub fn with_engine(config: Config, engine: Engine) -> Self {
        Self {
            config,
            engine: Arc::new(engine),
            stats: Arc::new(ServerStats::new()),
        }
    }

    /// Shared engine
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Bind every configured listener and start serving.
    pub async fn start(self) -> Result<ServerHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let service = StreamService::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.stats),
            &self.config,
        );
        let kind = self.config.server.transport;
        let mut tasks: Vec<JoinHandle<Result<()>>> = Vec::new();

        let mut local_addr = None;
        if kind.uses_tcp() {
            let transport = TcpTransport::bind(self.config.server.listen_addr()?).await?;
            local_addr = Some(transport.local_addr()?);
            tasks.push(spawn_transport(transport, service.clone(), shutdown_rx.clone()));
        }

        let mut quic_addr = None;
        if kind.uses_quic() {
            let quic_config = QuicTransportConfig::from_server_config(&self.config.server)?;
            let transport = QuicTransport::bind(&quic_config)?;
            quic_addr = Some(transport.local_addr()?);
            tasks.push(spawn_transport(transport, service.clone(), shutdown_rx.clone()));
        }

        let mut admin_addr = None;
        if let Some(addr) = self.config.server.admin_addr()? {
            let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
                OffloadError::Server(format!("Failed to bind admin API to {}: {}", addr, e))
            })?;
            admin_addr = Some(listener.local_addr()?);
            let router = create_router(Arc::new(AdminState {
                stats: Arc::clone(&self.stats),
                experiment: self.engine.experiment(),
                transport: kind,
                num_layers: self.engine.model().num_layers(),
            }));
            let mut shutdown = shutdown_rx.clone();
            tracing::info!("Admin API listening on http://{}", admin_addr.unwrap_or(addr));
            tasks.push(tokio::spawn(async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move { stopped(&mut shutdown).await })
                    .await
                    .map_err(|e| OffloadError::Server(format!("Admin API error: {}", e)))
            }));
        }

        tracing::info!(
            experiment = %self.engine.experiment(),
            transport = %kind,
            max_workers = self.config.server.max_workers,
            "offload server started"
        );

        Ok(ServerHandle {
            local_addr,
            quic_addr,
            admin_addr,
            shutdown_tx,
            tasks,
            service,
            stats: self.stats,
            max_workers: self.config.server.max_workers,
        })
    }
}

/// Resolves once `shutdown` is set, or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn spawn_transport<T>(
    transport: T,
    service: StreamService,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<Result<()>>
where
    T: Transport + 'static,
{
    tokio::spawn(async move {
        let name = transport.name();
        let result = transport.serve(service, shutdown).await;
        if let Err(e) = &result {
            tracing::error!("{} transport failed: {}", name, e);
        }
        result
    })
}

/// Running server.
pub struct ServerHandle {
    local_addr: Option<SocketAddr>,
    quic_addr: Option<SocketAddr>,
    admin_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<Result<()>>>,
    service: StreamService,
    stats: Arc<ServerStats>,
    max_workers: usize,
}

impl ServerHandle {
    /// TCP stream address
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// QUIC stream address
    pub fn quic_addr(&self) -> Option<SocketAddr> {
        self.quic_addr
    }

    /// Admin API address
    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    /// Live counters
    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Stop accepting streams and tell running streams to finish.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        self.shutdown_tx.send_replace(true);
    }

    /// Wait for the listeners to stop, then for running streams to drain.
    pub async fn wait(self) -> Result<()> {
        let mut first_error = None;
        for task in self.tasks {
            let result = task
                .await
                .map_err(|e| OffloadError::Server(format!("Listener task failed: {}", e)))
                .and_then(|r| r);
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        if !self.service.drain(self.max_workers).await {
            tracing::warn!(
                "{} streams still running after {:?}",
                self.stats.active_streams(),
                DRAIN_TIMEOUT
            );
        }
        tracing::info!("offload server stopped");
        first_error.map_or(Ok(()), Err)
    }
}
