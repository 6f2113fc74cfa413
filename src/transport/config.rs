//! TLS and QUIC settings.
//!
//! Handles certificate management and QUIC-specific tuning. Development
//! deployments run on a self-signed certificate; production points at PEM
//! files.

use rcgen::{Certificate, CertificateParams};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::error::{OffloadError, Result};

/// ALPN identifier for the fragment stream protocol.
pub const ALPN_PROTOCOL: &[u8] = b"offload/1";

/// Certificate configuration source.
#[derive(Debug, Clone)]
pub enum CertConfig {
    /// Generate a self-signed certificate (development only).
    SelfSigned {
        /// Common name for the certificate.
        common_name: String,
    },
    /// Load certificates from files.
    Files {
        /// Path to PEM certificate file.
        cert_path: PathBuf,
        /// Path to PEM private key file.
        key_path: PathBuf,
    },
    /// Use raw certificate data.
    Raw {
        /// DER-encoded certificate chain.
        cert_der: Vec<Vec<u8>>,
        /// DER-encoded private key (PKCS8).
        key_der: Vec<u8>,
    },
}

impl Default for CertConfig {
    fn default() -> Self {
        Self::SelfSigned {
            common_name: "localhost".to_string(),
        }
    }
}

impl CertConfig {
    /// Load the certificate chain and private key for rustls.
    pub fn load(&self) -> Result<(Vec<rustls::Certificate>, rustls::PrivateKey)> {
        match self {
            Self::SelfSigned { common_name } => self_signed(common_name),
            Self::Files {
                cert_path,
                key_path,
            } => Ok((read_cert_chain(cert_path)?, read_private_key(key_path)?)),
            Self::Raw { cert_der, key_der } => Ok((
                cert_der.iter().cloned().map(rustls::Certificate).collect(),
                rustls::PrivateKey(key_der.clone()),
            )),
        }
    }
}

fn self_signed(common_name: &str) -> Result<(Vec<rustls::Certificate>, rustls::PrivateKey)> {
    tracing::warn!(
        "Using self-signed certificate for '{}' - NOT FOR PRODUCTION",
        common_name
    );

    let mut params = CertificateParams::new(vec![
        common_name.to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ]);
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name.to_string());

    let cert = Certificate::from_params(params)
        .map_err(|e| OffloadError::Config(format!("Self-signed certificate failed: {e}")))?;
    let der = cert
        .serialize_der()
        .map_err(|e| OffloadError::Config(format!("Self-signed certificate failed: {e}")))?;
    Ok((
        vec![rustls::Certificate(der)],
        rustls::PrivateKey(cert.serialize_private_key_der()),
    ))
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| OffloadError::Config(format!("Cannot read {}: {e}", path.display())))
}

fn read_cert_chain(path: &Path) -> Result<Vec<rustls::Certificate>> {
    let pem = read_pem(path)?;
    let chain = rustls_pemfile::certs(&mut pem.as_slice())
        .map_err(|e| OffloadError::Config(format!("Bad certificate PEM {}: {e}", path.display())))?;
    if chain.is_empty() {
        return Err(OffloadError::Config(format!(
            "No certificates in {}",
            path.display()
        )));
    }
    Ok(chain.into_iter().map(rustls::Certificate).collect())
}

/// PKCS8 keys are preferred; RSA keys are accepted as a fallback.
fn read_private_key(path: &Path) -> Result<rustls::PrivateKey> {
    let pem = read_pem(path)?;
    let pkcs8 = rustls_pemfile::pkcs8_private_keys(&mut pem.as_slice())
        .map_err(|e| OffloadError::Config(format!("Bad key PEM {}: {e}", path.display())))?;
    let key = match pkcs8.into_iter().next() {
        Some(key) => Some(key),
        None => rustls_pemfile::rsa_private_keys(&mut pem.as_slice())
            .ok()
            .and_then(|keys| keys.into_iter().next()),
    };
    key.map(rustls::PrivateKey)
        .ok_or_else(|| OffloadError::Config(format!("No private key in {}", path.display())))
}

/// TLS configuration for the QUIC transport.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Certificate source.
    pub cert: CertConfig,
    /// ALPN protocols to advertise.
    pub alpn_protocols: Vec<Vec<u8>>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: CertConfig::default(),
            alpn_protocols: vec![ALPN_PROTOCOL.to_vec()],
        }
    }
}

/// QUIC transport configuration.
#[derive(Debug, Clone)]
pub struct QuicTransportConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// TLS configuration.
    pub tls: TlsConfig,
    /// Maximum idle timeout before closing connection.
    pub max_idle_timeout: Duration,
    /// Maximum concurrent bidirectional streams per connection.
    pub max_concurrent_bidi_streams: u32,
    /// Use BBR congestion control (vs Cubic).
    pub use_bbr: bool,
}

impl Default for QuicTransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50052)),
            tls: TlsConfig::default(),
            max_idle_timeout: Duration::from_secs(30),
            max_concurrent_bidi_streams: 100,
            use_bbr: true,
        }
    }
}

impl QuicTransportConfig {
    /// Derive from the `[server]` section: QUIC port, and PEM files when set.
    pub fn from_server_config(server: &ServerConfig) -> Result<Self> {
        let cert = match (&server.tls_cert, &server.tls_key) {
            (Some(cert_path), Some(key_path)) => CertConfig::Files {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            },
            _ => CertConfig::default(),
        };
        Ok(Self {
            listen_addr: server.quic_addr()?,
            tls: TlsConfig {
                cert,
                ..Default::default()
            },
            max_concurrent_bidi_streams: server.max_workers.max(1) as u32,
            ..Default::default()
        })
    }

    /// Set listen address.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set certificate source.
    pub fn with_cert(mut self, cert: CertConfig) -> Self {
        self.tls.cert = cert;
        self
    }

    /// Build quinn ServerConfig from this configuration.
    pub fn build_quinn_config(&self) -> Result<quinn::ServerConfig> {
        let (certs, key) = self.tls.cert.load()?;

        let mut rustls_config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| OffloadError::Config(format!("Failed to build TLS config: {}", e)))?;
        rustls_config.alpn_protocols = self.tls.alpn_protocols.clone();

        let mut transport_config = quinn::TransportConfig::default();
        match quinn::IdleTimeout::try_from(self.max_idle_timeout) {
            Ok(timeout) => {
                transport_config.max_idle_timeout(Some(timeout));
            },
            Err(_) => tracing::warn!(
                "Idle timeout {:?} out of range, using quinn default",
                self.max_idle_timeout
            ),
        }
        transport_config.max_concurrent_bidi_streams(self.max_concurrent_bidi_streams.into());
        // Fragment streams are bidirectional only
        transport_config.max_concurrent_uni_streams(0u32.into());

        if self.use_bbr {
            transport_config.congestion_controller_factory(Arc::new(
                quinn::congestion::BbrConfig::default(),
            ));
        }

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(rustls_config));
        server_config.transport_config(Arc::new(transport_config));

        Ok(server_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cert_config_self_signed() {
        let (certs, _key) = CertConfig::default().load().unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn test_cert_config_missing_files() {
        let config = CertConfig::Files {
            cert_path: "/missing/cert.pem".into(),
            key_path: "/missing/key.pem".into(),
        };
        assert!(matches!(config.load(), Err(OffloadError::Config(_))));
    }

    #[test]
    fn test_cert_config_pem_files() {
        let cert = rcgen::generate_simple_self_signed(vec!["edge.local".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
        fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

        let (chain, key) = CertConfig::Files {
            cert_path,
            key_path: key_path.clone(),
        }
        .load()
        .unwrap();
        assert_eq!(chain[0].0, cert.serialize_der().unwrap());
        assert_eq!(key.0, cert.serialize_private_key_der());

        // A certificate file holding no certificate
        let empty = CertConfig::Files {
            cert_path: key_path.clone(),
            key_path,
        };
        assert!(matches!(empty.load(), Err(OffloadError::Config(_))));
    }

    #[test]
    fn test_from_server_config() {
        let server = ServerConfig {
            quic_port: 6001,
            max_workers: 4,
            ..Default::default()
        };
        let config = QuicTransportConfig::from_server_config(&server).unwrap();
        assert_eq!(config.listen_addr.port(), 6001);
        assert_eq!(config.max_concurrent_bidi_streams, 4);
        assert!(matches!(config.tls.cert, CertConfig::SelfSigned { .. }));
        assert_eq!(config.tls.alpn_protocols, vec![ALPN_PROTOCOL.to_vec()]);
    }

    #[test]
    fn test_build_quinn_config() {
        assert!(QuicTransportConfig::default().build_quinn_config().is_ok());
    }
}
