//! # Revsocks - Reverse SOCKS5 Tunnel
//!
//! Revsocks lets a host that cannot accept inbound connections (the agent)
//! act as the exit of a SOCKS5 proxy. The agent dials out to the server,
//! and both ends run an encrypted stream multiplexer over that single
//! connection. Every SOCKS5 client accepted by the server is carried on its
//! own stream to the agent, which connects to the requested target.
//!
//! ## Features
//!
//! - **Encrypted Multiplexer**: ChaCha20-Poly1305 records keyed from a
//!   pre-shared key, with per-stream flow control and half-close
//! - **Reverse SOCKS5**: clients connect to the server, traffic exits at the agent
//! - **Liveness Marker**: a fixed 64-byte preamble rejects stray connections early
//! - **Outer TLS**: optional rustls hop, including a self-signed server identity
//! - **Forward Proxy**: the agent can dial through HTTP CONNECT or SOCKS5 proxies
//!
//! ## Usage
//!
//! ```rust,ignore
//! use revsocks::config::load_config;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     revsocks::run(config, shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! SOCKS5 Client -> Server ==[marker | handshake | sealed frames]==> Agent -> Target
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod helper;
pub mod mux;
pub mod pool;
pub mod socks;
pub mod transport;
pub mod tunnel;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{MuxError, Socks5Error};
pub use mux::{MuxStream, Session};
pub use tunnel::{run, Agent, Server};

/// Version of the Revsocks library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
