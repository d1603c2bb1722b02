//! Transport layer for the outer hop
//!
//! The agent dials the server over plain TCP or TLS, optionally through a
//! forward proxy. The server accepts TCP and optionally terminates TLS.
//! Either way the result is an ordered, reliable byte stream that the
//! multiplexer runs on.

mod addr;
mod proxy;
mod tcp;
mod tls;

pub use addr::AddrMaybeCached;
pub use proxy::connect_via;
pub use tcp::TcpTransport;
pub use tls::{self_signed_identity, server_acceptor, TlsStream, TlsTransport};

use crate::config::{TcpConfig, TransportConfig, TransportType};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Socket options for configuring connections
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive idle time in seconds
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive probe interval in seconds
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts::from_tcp_config(&TcpConfig::default())
    }
}

impl SocketOpts {
    /// Create socket options from TCP config; zero disables keepalive
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        let nonzero = |secs: u64| (secs > 0).then_some(secs);
        SocketOpts {
            nodelay: config.nodelay,
            keepalive_secs: nonzero(config.keepalive_secs),
            keepalive_interval: nonzero(config.keepalive_interval),
        }
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// Transport trait for the agent's outbound dial
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// The stream type produced by this transport
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug + 'static;

    /// Create a new transport instance from configuration
    fn new(config: &TransportConfig) -> Result<Self>
    where
        Self: Sized;

    /// Connect to a remote address
    async fn connect(&self, addr: &AddrMaybeCached) -> Result<Self::Stream>;
}

/// Create a transport based on configuration
pub fn create_transport(config: &TransportConfig) -> Result<Box<dyn TransportDyn>> {
    match config.transport_type {
        TransportType::Tcp => Ok(Box::new(TcpTransport::new(config)?)),
        TransportType::Tls => Ok(Box::new(TlsTransport::new(config)?)),
    }
}

/// Dynamic transport trait for boxed transports
#[async_trait]
pub trait TransportDyn: Debug + Send + Sync {
    /// Connect to a remote address and return a boxed stream
    async fn connect_dyn(&self, addr: &AddrMaybeCached) -> Result<Box<dyn StreamDyn>>;
}

/// Dynamic stream trait for boxed streams
pub trait StreamDyn: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug> StreamDyn for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_socket_opts_default() {
        let opts = SocketOpts::default();
        assert!(opts.nodelay);
        assert_eq!(opts.keepalive_secs, Some(20));
        assert_eq!(opts.keepalive_interval, Some(8));
    }

    #[test]
    fn test_socket_opts_zero_disables_keepalive() {
        let config = TcpConfig {
            nodelay: false,
            keepalive_secs: 0,
            keepalive_interval: 15,
            proxy: None,
        };
        let opts = SocketOpts::from_tcp_config(&config);
        assert!(!opts.nodelay);
        assert_eq!(opts.keepalive_secs, None);
        assert_eq!(opts.keepalive_interval, Some(15));
    }

    #[tokio::test]
    async fn test_socket_opts_apply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();

        SocketOpts::default().apply(&stream).unwrap();
        assert!(stream.nodelay().unwrap());
        assert!(socket2::SockRef::from(&stream).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_create_transport_dispatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = AddrMaybeCached::new(&listener.local_addr().unwrap().to_string());

        let transport = create_transport(&TransportConfig::default()).unwrap();
        assert!(transport.connect_dyn(&addr).await.is_ok());

        let config = TransportConfig {
            transport_type: TransportType::Tls,
            ..Default::default()
        };
        assert!(create_transport(&config).is_err());
    }
}
