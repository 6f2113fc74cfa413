//! # Offload - Split-Inference Server for Edge Devices
//!
//! An edge device runs the first layers of a neural network, then ships the
//! intermediate activation to this server in chunks, optionally compressed.
//! The server reassembles the chunks, resumes the forward pass at the layer
//! the device stopped at, and streams the prediction back.
//!
//! ## Features
//!
//! - **Chunk reassembly**: fragments are concatenated in exact receipt order
//! - **Explicit action flags**: APPEND / RESET / INFERENCE / COMPRESSED / END,
//!   evaluated in a fixed order per fragment
//! - **Compression adapter**: Brotli or Zlib envelopes with length and CRC checks
//! - **Partial inference**: dense layer stacks loaded from safetensors, resumed
//!   from any layer, with classification and detection heads
//! - **TCP and QUIC transports** sharing one length-prefixed wire format
//!
//! ## Protocol Overview
//!
//! ```text
//! Edge device                                    Offload server
//!    |                                                |
//!    |-- {id, RESET, chunk₀, layer} ----------------->|  buffer = [chunk₀]
//!    |-- {id, ∅, chunk₁, layer} --------------------->|  buffer += chunk₁
//!    |-- {id, APPEND|INFERENCE, chunk₂, layer} ------>|  assemble, infer
//!    |<------------- {id, results, actions, keypairs} |
//!    |-- {id, END} ---------------------------------->|  session forgotten
//! ```
//!
//! ### Session States
//!
//! ```text
//!              first fragment          APPEND
//!   [Empty] ─────────────────> [Accumulating] ─────────> [Assembled]
//!                                  ^    ^                     │
//!                 RESET (any state)│    └─── non-empty chunk ─┘
//!                                                             │ END (any state)
//!                                                             v
//!                                                          [Done]
//! ```
//!
//! ## Quick Start
//!
//! ### Server
//!
//! ```rust,ignore
//! use offload::{Config, Server};
//!
//! let config = Config::load(None)?;
//! let handle = Server::init(config)?.start().await?;
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown();
//! handle.wait().await?;
//! ```
//!
//! ### Edge Client
//!
//! ```rust,ignore
//! use offload::{Algorithm, Compressor, EdgeClient, Tensor};
//!
//! let activation = Tensor::new(vec![1, 512], features)?;
//! let packed = Compressor::new(Algorithm::Brotli).pack_tensor(&activation)?;
//!
//! let mut client = EdgeClient::connect("10.0.0.2:50051").await?;
//! let response = client.offload("cam-1", &packed, 3, 16 * 1024, true).await?;
//! println!("{}", response.results_json()?);
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Action flags, wire messages, chunk buffer, session state machine
//! - [`codec`]: Compression adapter (Brotli, Zlib)
//! - [`inference`]: Tensors, layer stacks, classification and detection heads
//! - [`server`]: Stream handler, server lifecycle, admin API
//! - [`transport`]: Framing, TCP and QUIC transports
//! - [`client`]: Edge-side client
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod inference;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use client::EdgeClient;
pub use codec::{Algorithm, Compressor};
pub use config::Config;
pub use error::{OffloadError, Result};
pub use inference::{ExperimentType, Model, Prediction, Tensor};
pub use protocol::{Action, ActionSet, Fragment, Response, Session, SessionState};
pub use server::{Engine, Server, ServerHandle, StreamHandler};
pub use transport::{QuicTransport, QuicTransportConfig, TcpTransport, Transport, TransportKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use protocol::PROTOCOL_VERSION;
