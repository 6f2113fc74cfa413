//! Offload error types.
//!
//! Errors fall in two groups:
//!
//! - **Per-fragment errors** (`InvalidState`, `Decompression`, `ModelExecution`)
//!   are contained by the stream handler and reported back to the edge device
//!   in a response. The stream and every other session keep running.
//! - **Everything else** (transport, framing, configuration, model loading)
//!   ends the operation that raised it.

use thiserror::Error;

use crate::protocol::SessionState;

/// Offload errors.
#[derive(Error, Debug)]
pub enum OffloadError {
    /// Compression operation failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Decompression operation failed.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// INFERENCE requested before the session buffer was assembled.
    #[error("Invalid state: inference requires an assembled payload, session is {state:?}")]
    InvalidState {
        /// State the session was in when the request arrived.
        state: SessionState,
    },

    /// The model failed during a forward pass.
    #[error("Model execution error: {0}")]
    ModelExecution(String),

    /// Failed to load model weights or labels.
    #[error("Model load error: {0}")]
    ModelLoad(String),

    /// Protocol-level error (bad flags, unexpected message type).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Malformed wire message.
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Transport failure (connection dropped, oversize frame).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server-side error.
    #[error("Server error: {0}")]
    Server(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for offload operations
pub type Result<T> = std::result::Result<T, OffloadError>;

impl OffloadError {
    /// Wire code reported in a response's `error` keypair.
    ///
    /// Only per-fragment errors have a code; anything else terminates the
    /// stream and is never reported in-band.
    pub fn report_code(&self) -> Option<i32> {
        match self {
            Self::InvalidState { .. } => Some(1),
            Self::Decompression(_) => Some(2),
            Self::ModelExecution(_) => Some(3),
            _ => None,
        }
    }

    /// Short machine-readable kind used in error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Compression(_) => "compression",
            Self::Decompression(_) => "decompression",
            Self::InvalidState { .. } => "invalid_state",
            Self::ModelExecution(_) => "model_execution",
            Self::ModelLoad(_) => "model_load",
            Self::Protocol(_) => "protocol",
            Self::InvalidMessage(_) => "invalid_message",
            Self::Transport(_) => "transport",
            Self::Server(_) => "server",
            Self::Config(_) => "config",
            Self::Json(_) => "json",
            Self::Io(_) => "io",
        }
    }

    /// Whether the stream handler contains this error at the fragment level.
    pub fn is_per_fragment(&self) -> bool {
        self.report_code().is_some()
    }
}

impl From<toml::de::Error> for OffloadError {
    fn from(err: toml::de::Error) -> Self {
        OffloadError::Config(err.to_string())
    }
}

impl From<safetensors::SafeTensorError> for OffloadError {
    fn from(err: safetensors::SafeTensorError) -> Self {
        OffloadError::ModelLoad(format!("Failed to parse safetensors: {err}"))
    }
}
