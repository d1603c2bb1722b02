//! TCP transport implementation
//!
//! Plain TCP to the server, optionally through a forward proxy.

use super::{proxy, AddrMaybeCached, SocketOpts, StreamDyn, Transport, TransportDyn};
use crate::config::TransportConfig;
use crate::helper::DEFAULT_CONNECT_TIMEOUT_SECS;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use url::Url;

/// TCP transport for plain connections
#[derive(Debug, Clone)]
pub struct TcpTransport {
    /// Socket options to apply to connections
    socket_opts: SocketOpts,
    /// Forward proxy to dial through
    proxy: Option<Url>,
    /// Connection timeout
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Create a new TCP transport with default options
    pub fn with_defaults() -> Self {
        TcpTransport {
            socket_opts: SocketOpts::default(),
            proxy: None,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Dial the server directly or through the proxy, then apply socket options
    pub(crate) async fn dial(&self, addr: &AddrMaybeCached) -> Result<TcpStream> {
        let connect = async {
            match &self.proxy {
                Some(proxy) => {
                    let (host, port) = addr.host_port()?;
                    proxy::connect_via(proxy, host, port).await
                }
                None => {
                    let resolved = addr.resolve().await?;
                    TcpStream::connect(resolved)
                        .await
                        .with_context(|| format!("Failed to connect to {}", addr.addr()))
                }
            }
        };

        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                addr.clear_cache().await;
                return Err(e);
            }
            Err(_) => {
                addr.clear_cache().await;
                anyhow::bail!("Connection timeout to {}", addr.addr());
            }
        };

        self.socket_opts.apply(&stream)?;

        tracing::debug!("TCP connection established to {}", addr.addr());

        Ok(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;

    fn new(config: &TransportConfig) -> Result<Self> {
        Ok(TcpTransport {
            socket_opts: SocketOpts::from_tcp_config(&config.tcp),
            proxy: config.tcp.proxy.clone(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        })
    }

    async fn connect(&self, addr: &AddrMaybeCached) -> Result<Self::Stream> {
        self.dial(addr).await
    }
}

#[async_trait]
impl TransportDyn for TcpTransport {
    async fn connect_dyn(&self, addr: &AddrMaybeCached) -> Result<Box<dyn StreamDyn>> {
        let stream = self.connect(addr).await?;
        Ok(Box::new(stream))
    }
}
