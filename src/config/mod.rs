//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`OFFLOAD_*`)
//! - CLI arguments (applied by the binary on top of both)
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 50051
//! transport = "tcp"
//! max_workers = 10
//!
//! [session]
//! idle_timeout_secs = 300
//! eviction = "notify"
//!
//! [compression]
//! algorithm = "brotli"
//! max_unpacked_bytes = 268435456
//!
//! [model]
//! experiment = "classification"
//! weights = "/models/resnet-tail.safetensors"
//! labels = "/models/imagenet.txt"
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{Algorithm, DEFAULT_MAX_UNPACKED_BYTES};
use crate::error::{OffloadError, Result};
use crate::inference::{ExperimentType, Precision};
use crate::transport::TransportKind;

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Session lifecycle configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Compression configuration
    #[serde(default)]
    pub compression: CompressionConfig,

    /// Model configuration
    #[serde(default)]
    pub model: ModelConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            OffloadError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        toml::from_str(&content)
            .map_err(|e| OffloadError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_lookup(|key| std::env::var(key).ok())
    }

    /// Default config file location (`<config_dir>/offload/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("offload").join("config.toml"))
    }

    /// Resolve the effective configuration.
    ///
    /// An explicit `path` must exist. Without one, the default path is read
    /// when present. Environment variables are merged on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => {
                    tracing::debug!("Using config file {}", path.display());
                    Self::from_file(path)?
                },
                None => Self::default(),
            },
        };
        let config = base.merge(Self::from_env());
        config.validate()?;
        Ok(config)
    }

    /// Apply `OFFLOAD_*` overrides read through `lookup`.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("Ignoring invalid {key}={value}");
                    None
                },
            }
        }

        if let Some(host) = lookup("OFFLOAD_HOST") {
            self.server.host = host;
        }
        if let Some(port) = parsed("OFFLOAD_PORT", lookup("OFFLOAD_PORT")) {
            self.server.port = port;
        }
        if let Some(kind) = parsed("OFFLOAD_TRANSPORT", lookup("OFFLOAD_TRANSPORT")) {
            self.server.transport = kind;
        }
        if let Some(port) = parsed("OFFLOAD_QUIC_PORT", lookup("OFFLOAD_QUIC_PORT")) {
            self.server.quic_port = port;
        }
        if let Some(port) = parsed("OFFLOAD_ADMIN_PORT", lookup("OFFLOAD_ADMIN_PORT")) {
            self.server.admin_port = Some(port);
        }
        if let Some(workers) = parsed("OFFLOAD_MAX_WORKERS", lookup("OFFLOAD_MAX_WORKERS")) {
            self.server.max_workers = workers;
        }
        if let Some(secs) = parsed(
            "OFFLOAD_IDLE_TIMEOUT_SECS",
            lookup("OFFLOAD_IDLE_TIMEOUT_SECS"),
        ) {
            self.session.idle_timeout_secs = secs;
        }
        if let Some(algorithm) = parsed("OFFLOAD_ALGORITHM", lookup("OFFLOAD_ALGORITHM")) {
            self.compression.algorithm = algorithm;
        }
        if let Some(experiment) = parsed("OFFLOAD_EXPERIMENT", lookup("OFFLOAD_EXPERIMENT")) {
            self.model.experiment = experiment;
        }
        if let Some(weights) = lookup("OFFLOAD_WEIGHTS") {
            self.model.weights = Some(PathBuf::from(weights));
        }
        if let Some(labels) = lookup("OFFLOAD_LABELS") {
            self.model.labels = Some(PathBuf::from(labels));
        }

        self
    }

    /// Merge with another config (other takes precedence where it differs
    /// from the defaults)
    pub fn merge(self, other: Self) -> Self {
        fn pick<T: PartialEq>(base: T, other: T, default: T) -> T {
            if other != default {
                other
            } else {
                base
            }
        }

        let server = ServerConfig::default();
        let session = SessionConfig::default();
        let compression = CompressionConfig::default();
        let model = ModelConfig::default();

        Self {
            server: ServerConfig {
                host: pick(self.server.host, other.server.host, server.host),
                port: pick(self.server.port, other.server.port, server.port),
                transport: pick(self.server.transport, other.server.transport, server.transport),
                quic_port: pick(self.server.quic_port, other.server.quic_port, server.quic_port),
                admin_port: pick(self.server.admin_port, other.server.admin_port, server.admin_port),
                max_workers: pick(
                    self.server.max_workers,
                    other.server.max_workers,
                    server.max_workers,
                ),
                max_frame_bytes: pick(
                    self.server.max_frame_bytes,
                    other.server.max_frame_bytes,
                    server.max_frame_bytes,
                ),
                tls_cert: pick(self.server.tls_cert, other.server.tls_cert, server.tls_cert),
                tls_key: pick(self.server.tls_key, other.server.tls_key, server.tls_key),
            },
            session: SessionConfig {
                idle_timeout_secs: pick(
                    self.session.idle_timeout_secs,
                    other.session.idle_timeout_secs,
                    session.idle_timeout_secs,
                ),
                eviction: pick(self.session.eviction, other.session.eviction, session.eviction),
                sweep_interval_ms: pick(
                    self.session.sweep_interval_ms,
                    other.session.sweep_interval_ms,
                    session.sweep_interval_ms,
                ),
            },
            compression: CompressionConfig {
                algorithm: pick(
                    self.compression.algorithm,
                    other.compression.algorithm,
                    compression.algorithm,
                ),
                level: pick(self.compression.level, other.compression.level, compression.level),
                precision: pick(
                    self.compression.precision,
                    other.compression.precision,
                    compression.precision,
                ),
                max_unpacked_bytes: pick(
                    self.compression.max_unpacked_bytes,
                    other.compression.max_unpacked_bytes,
                    compression.max_unpacked_bytes,
                ),
            },
            model: ModelConfig {
                experiment: pick(self.model.experiment, other.model.experiment, model.experiment),
                weights: pick(self.model.weights, other.model.weights, model.weights),
                labels: pick(self.model.labels, other.model.labels, model.labels),
                top_k: pick(self.model.top_k, other.model.top_k, model.top_k),
                conf_threshold: pick(
                    self.model.conf_threshold,
                    other.model.conf_threshold,
                    model.conf_threshold,
                ),
                iou_threshold: pick(
                    self.model.iou_threshold,
                    other.model.iou_threshold,
                    model.iou_threshold,
                ),
            },
        }
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_workers == 0 {
            return Err(OffloadError::Config("server.max_workers must be at least 1".into()));
        }
        if self.server.max_frame_bytes == 0 {
            return Err(OffloadError::Config("server.max_frame_bytes must be positive".into()));
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            return Err(OffloadError::Config(
                "server.tls_cert and server.tls_key must be set together".into(),
            ));
        }
        if self.compression.max_unpacked_bytes == 0 {
            return Err(OffloadError::Config(
                "compression.max_unpacked_bytes must be positive".into(),
            ));
        }
        if let Some(level) = self.compression.level {
            let max = self.compression.algorithm.max_level();
            if level > max {
                return Err(OffloadError::Config(format!(
                    "compression.level {level} exceeds {max} for {}",
                    self.compression.algorithm
                )));
            }
        }
        if self.model.top_k == 0 {
            return Err(OffloadError::Config("model.top_k must be at least 1".into()));
        }
        for (name, value) in [
            ("conf_threshold", self.model.conf_threshold),
            ("iou_threshold", self.model.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(OffloadError::Config(format!(
                    "model.{name} must be within [0, 1], got {value}"
                )));
            }
        }
        self.server.listen_addr()?;
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| OffloadError::Config(format!("Failed to render config: {e}")))
    }
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Stream port (TCP)
    pub port: u16,

    /// Which transports to run
    pub transport: TransportKind,

    /// Stream port (QUIC, UDP)
    pub quic_port: u16,

    /// HTTP admin API port; disabled when unset
    pub admin_port: Option<u16>,

    /// Maximum concurrently served streams
    pub max_workers: usize,

    /// Largest accepted frame body in bytes
    pub max_frame_bytes: usize,

    /// PEM certificate for QUIC; self-signed when unset
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for QUIC
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 50051,
            transport: TransportKind::Tcp,
            quic_port: 50052,
            admin_port: None,
            max_workers: 10,
            max_frame_bytes: 64 * 1024 * 1024, // 64 MiB
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl ServerConfig {
    fn addr(&self, port: u16) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| OffloadError::Config(format!("Invalid host {:?}: {e}", self.host)))?;
        Ok(SocketAddr::new(ip, port))
    }

    /// TCP listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.addr(self.port)
    }

    /// QUIC listen address
    pub fn quic_addr(&self) -> Result<SocketAddr> {
        self.addr(self.quic_port)
    }

    /// Admin API listen address, if enabled
    pub fn admin_addr(&self) -> Result<Option<SocketAddr>> {
        self.admin_port.map(|port| self.addr(port)).transpose()
    }
}

/// What happens to a session that idles past the timeout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Forget the session silently
    #[default]
    Drop,
    /// Forget the session and send a timeout response
    Notify,
}

impl std::str::FromStr for EvictionPolicy {
    type Err = OffloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "notify" => Ok(Self::Notify),
            _ => Err(OffloadError::Config(format!("Unknown eviction policy: {s}"))),
        }
    }
}

/// Session lifecycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time before eviction; 0 disables eviction
    pub idle_timeout_secs: u64,

    /// Eviction policy
    pub eviction: EvictionPolicy,

    /// How often each stream checks for idle sessions
    pub sweep_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: crate::protocol::SESSION_TIMEOUT_SECS,
            eviction: EvictionPolicy::Drop,
            sweep_interval_ms: 1000,
        }
    }
}

impl SessionConfig {
    /// Idle timeout, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Sweep interval, never below 10ms
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(10))
    }
}

/// Compression configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Algorithm used when this side packs payloads
    pub algorithm: Algorithm,

    /// Backend level; backend default when unset
    pub level: Option<u32>,

    /// Tensor precision when packing (`half` is lossy)
    pub precision: Precision,

    /// Largest original length an envelope may declare
    pub max_unpacked_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            level: None,
            precision: Precision::default(),
            max_unpacked_bytes: DEFAULT_MAX_UNPACKED_BYTES,
        }
    }
}

/// Model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Which model head to build
    pub experiment: ExperimentType,

    /// Safetensors weights; identity stack when unset
    pub weights: Option<PathBuf>,

    /// Class names, one per line
    pub labels: Option<PathBuf>,

    /// Classes returned by classification
    pub top_k: usize,

    /// Minimum detection confidence
    pub conf_threshold: f32,

    /// NMS overlap threshold
    pub iou_threshold: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            experiment: ExperimentType::Classification,
            weights: None,
            labels: None,
            top_k: 5,
            conf_threshold: 0.25,
            iou_threshold: 0.45,
        }
    }
}
