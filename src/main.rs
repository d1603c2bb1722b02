//! Revsocks - reverse SOCKS5 tunnel
//!
//! Without `--connect` the process is the server: it waits for an agent and
//! exposes a SOCKS5 listener. With `--connect` it is the agent.

use anyhow::Result;
use clap::Parser;
use revsocks::config::{
    load_config, AgentConfig, Config, MuxConfig, ServerConfig, ServerTlsConfig, TlsConfig,
    TransportConfig, TransportType,
};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

/// Revsocks - reverse SOCKS5 tunnel over an encrypted multiplexed connection
#[derive(Parser, Debug)]
#[command(name = "revsocks")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address agents connect to (server)
    #[arg(long, default_value = "0.0.0.0:10443")]
    listen: String,

    /// Address SOCKS5 clients connect to (server)
    #[arg(long, default_value = "127.0.0.1:1080")]
    socks: String,

    /// Pre-shared key for the encrypted session
    #[arg(long, default_value = "password")]
    psk: String,

    /// Server address to dial; runs as agent when set
    #[arg(long)]
    connect: Option<String>,

    /// Wrap the agent connection in TLS
    #[arg(long)]
    tls: bool,

    /// SOCKS5 username (server)
    #[arg(long)]
    username: Option<String>,

    /// SOCKS5 password, enables username/password auth (server)
    #[arg(long)]
    password: Option<String>,

    /// PEM certificate chain for TLS (server)
    #[arg(long)]
    cert: Option<String>,

    /// PEM private key for TLS (server)
    #[arg(long)]
    key: Option<String>,

    /// Serve TLS with a generated self-signed certificate (server)
    #[arg(long)]
    self_signed: bool,

    /// Skip TLS certificate verification (agent)
    #[arg(long)]
    insecure: bool,

    /// Forward proxy URL for the agent dial, http:// or socks5://
    #[arg(long)]
    proxy: Option<Url>,

    /// Path to a TOML configuration file; overrides the flags above
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        if let Some(path) = &self.config {
            let config = load_config(path)?;
            info!("Configuration loaded from: {:?}", path);
            return Ok(config);
        }

        let mut config = Config {
            psk: self.psk,
            marker: None,
            mux: MuxConfig::default(),
            server: None,
            agent: None,
        };

        match self.connect {
            Some(remote_addr) => {
                let mut transport = TransportConfig::default();
                transport.tcp.proxy = self.proxy;
                if self.tls {
                    transport.transport_type = TransportType::Tls;
                    transport.tls = Some(TlsConfig {
                        skip_verify: self.insecure,
                        ..Default::default()
                    });
                }
                config.agent = Some(AgentConfig {
                    remote_addr,
                    transport,
                    reconnect: None,
                    socks: Default::default(),
                });
            }
            None => {
                let wants_tls = self.tls || self.self_signed || self.cert.is_some();
                let tls = wants_tls.then(|| ServerTlsConfig {
                    self_signed: self.self_signed || self.cert.is_none() || self.key.is_none(),
                    cert: self.cert,
                    key: self.key,
                });
                config.server = Some(ServerConfig {
                    listen: self.listen,
                    socks_listen: self.socks,
                    username: self.username,
                    password: self.password,
                    tls,
                    ..Default::default()
                });
            }
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    info!("Revsocks v{}", revsocks::VERSION);
    let config = args.into_config()?;

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    revsocks::tunnel::run(config, shutdown_rx).await
}

/// Wait for Ctrl+C, or SIGTERM on unix
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
                return;
            }
            Err(e) => warn!("Failed to setup SIGTERM handler: {}", e),
        }
    }

    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C, shutting down...");
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
