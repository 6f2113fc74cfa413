//! Offload CLI binary.
//!
//! Split-inference server and edge tooling.
//!
//! # Commands
//!
//! - `serve` - Run the offload server
//! - `send` - Offload a tensor file to a running server
//! - `pack` - Compress a file into an envelope
//! - `unpack` - Open an envelope
//! - `init-config` - Write a default config file

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use offload::{
    codec::{is_packed, Algorithm, Compressor},
    config::{Config, EvictionPolicy},
    inference::{ExperimentType, Precision, Tensor},
    server::Server,
    transport::TransportKind,
    EdgeClient, VERSION,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "offload")]
#[command(version = VERSION)]
#[command(about = "Split-inference offload server for edge devices", long_about = None)]
struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the offload server
    Serve {
        /// Config file (default: <config_dir>/offload/config.toml if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen host
        #[arg(long)]
        host: Option<String>,

        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Transport (tcp, quic, both)
        #[arg(short, long)]
        transport: Option<TransportKind>,

        /// QUIC port
        #[arg(long)]
        quic_port: Option<u16>,

        /// HTTP admin API port
        #[arg(long)]
        admin_port: Option<u16>,

        /// Maximum concurrently served streams
        #[arg(short = 'w', long)]
        max_workers: Option<usize>,

        /// Experiment (classification, detection)
        #[arg(short, long)]
        experiment: Option<ExperimentType>,

        /// Safetensors weights for the layers after the split
        #[arg(long)]
        weights: Option<PathBuf>,

        /// Class names, one per line
        #[arg(long)]
        labels: Option<PathBuf>,

        /// Idle session timeout in seconds (0 disables)
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Idle session policy (drop, notify)
        #[arg(long)]
        eviction: Option<EvictionPolicy>,

        /// PEM certificate for QUIC
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,

        /// PEM private key for QUIC
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,
    },

    /// Offload a tensor file and print the prediction
    Send {
        /// Tensor file
        input: PathBuf,

        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:50051")]
        addr: String,

        /// Session id
        #[arg(long, default_value = "edge-0")]
        id: String,

        /// Layer the forward pass resumes at
        #[arg(short, long, default_value = "0")]
        layer: i32,

        /// Chunk size in bytes
        #[arg(long, default_value = "65536")]
        chunk_size: usize,

        /// Compress before sending (brotli, zlib, none)
        #[arg(long)]
        compress: Option<Algorithm>,

        /// Send f16 elements (lossy, requires --compress)
        #[arg(long, requires = "compress")]
        half: bool,

        /// Pretty-print the prediction
        #[arg(long)]
        pretty: bool,
    },

    /// Compress a file into an envelope
    Pack {
        /// Input file
        input: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Algorithm (brotli, zlib, none)
        #[arg(short, long, default_value = "brotli")]
        algorithm: Algorithm,

        /// Compression level
        #[arg(long)]
        level: Option<u32>,
    },

    /// Decompress an envelope
    Unpack {
        /// Input file
        input: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Write a default config file
    InitConfig {
        /// Destination (default: <config_dir>/offload/config.toml)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            transport,
            quic_port,
            admin_port,
            max_workers,
            experiment,
            weights,
            labels,
            idle_timeout,
            eviction,
            cert,
            key,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(transport) = transport {
                config.server.transport = transport;
            }
            if let Some(port) = quic_port {
                config.server.quic_port = port;
            }
            if admin_port.is_some() {
                config.server.admin_port = admin_port;
            }
            if let Some(workers) = max_workers {
                config.server.max_workers = workers;
            }
            if let Some(experiment) = experiment {
                config.model.experiment = experiment;
            }
            if weights.is_some() {
                config.model.weights = weights;
            }
            if labels.is_some() {
                config.model.labels = labels;
            }
            if let Some(secs) = idle_timeout {
                config.session.idle_timeout_secs = secs;
            }
            if let Some(policy) = eviction {
                config.session.eviction = policy;
            }
            if cert.is_some() {
                config.server.tls_cert = cert;
                config.server.tls_key = key;
            }
            cmd_serve(config)
        },

        Commands::Send {
            input,
            addr,
            id,
            layer,
            chunk_size,
            compress,
            half,
            pretty,
        } => cmd_send(&input, &addr, &id, layer, chunk_size, compress, half, pretty),

        Commands::Pack {
            input,
            output,
            algorithm,
            level,
        } => cmd_pack(&input, &output, algorithm, level),

        Commands::Unpack { input, output } => cmd_unpack(&input, &output),

        Commands::InitConfig { output, force } => cmd_init_config(output, force),
    }
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn cmd_serve(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    tracing::info!("Starting offload server v{}", VERSION);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let server = Server::init(config)?;
        let handle = server.start().await?;
        if let Some(addr) = handle.local_addr() {
            tracing::info!("Fragment streams on tcp://{}", addr);
        }
        if let Some(addr) = handle.quic_addr() {
            tracing::info!("Fragment streams on quic://{}", addr);
        }

        tokio::signal::ctrl_c().await?;
        handle.shutdown();
        handle.wait().await?;
        Ok::<_, anyhow::Error>(())
    })
}

#[allow(clippy::too_many_arguments)]
fn cmd_send(
    input: &Path,
    addr: &str,
    id: &str,
    layer: i32,
    chunk_size: usize,
    compress: Option<Algorithm>,
    half: bool,
    pretty: bool,
) -> anyhow::Result<()> {
    let raw = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let tensor = Tensor::from_bytes(&raw).context("input is not a tensor file")?;
    tracing::info!("Loaded tensor {:?} from {}", tensor.shape(), input.display());

    let payload = match compress {
        Some(algorithm) => {
            let precision = if half { Precision::Half } else { Precision::Full };
            let packed = Compressor::new(algorithm)
                .with_precision(precision)
                .pack_tensor(&tensor)?;
            tracing::info!(
                "Packed {} -> {} bytes with {}",
                raw.len(),
                packed.len(),
                algorithm
            );
            packed
        },
        None => raw,
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let response = runtime.block_on(async {
        let mut client = EdgeClient::connect(addr).await?;
        let response = client
            .offload(id, &payload, layer, chunk_size, compress.is_some())
            .await?;
        client.end(id).await?;
        client.close().await?;
        Ok::<_, anyhow::Error>(response)
    })?;

    let results = response.results_json()?;
    let output = serde_json::json!({
        "id": response.id,
        "results": results,
        "keypairs": response.keypairs,
    });
    if pretty {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{output}");
    }

    if response.is_error() {
        anyhow::bail!("server reported an error for session '{}'", response.id);
    }
    Ok(())
}

fn cmd_pack(
    input: &Path,
    output: &Path,
    algorithm: Algorithm,
    level: Option<u32>,
) -> anyhow::Result<()> {
    let data = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let mut compressor = Compressor::new(algorithm);
    if let Some(level) = level {
        compressor = compressor.with_level(level);
    }
    let packed = compressor.pack(&data)?;
    std::fs::write(output, &packed).with_context(|| format!("writing {}", output.display()))?;

    let ratio = if data.is_empty() {
        1.0
    } else {
        packed.len() as f64 / data.len() as f64
    };
    eprintln!(
        "{}: {} -> {} bytes ({:.1}%)",
        algorithm,
        data.len(),
        packed.len(),
        ratio * 100.0
    );
    Ok(())
}

fn cmd_unpack(input: &Path, output: &Path) -> anyhow::Result<()> {
    let packed = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    if !is_packed(&packed) {
        anyhow::bail!("{} is not a compressed envelope", input.display());
    }
    let data = Compressor::default().unpack(&packed)?;
    std::fs::write(output, &data).with_context(|| format!("writing {}", output.display()))?;
    eprintln!("{} -> {} bytes", packed.len(), data.len());
    Ok(())
}

fn cmd_init_config(output: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = output
        .or_else(Config::default_path)
        .context("no config directory on this platform, pass --output")?;
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, Config::default().to_toml()?)?;
    println!("Wrote {}", path.display());
    Ok(())
}
