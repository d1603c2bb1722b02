//! Test utilities shared by the integration tests

#![allow(dead_code)]

use revsocks::config::{AgentConfig, Config, MuxConfig, ServerConfig};
use revsocks::error::MuxError;
use revsocks::Session;
use std::net::SocketAddr;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const PSK: &str = "integration-psk";

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Multiplexer settings with keepalive off so tests are not timing sensitive
pub fn mux_config() -> MuxConfig {
    MuxConfig {
        keepalive_interval: 0,
        ..Default::default()
    }
}

/// Run both handshakes over an in-memory pipe
pub async fn session_pair(
    client_psk: &str,
    server_psk: &str,
) -> (Result<Session, MuxError>, Result<Session, MuxError>) {
    let (a, b) = duplex(256 * 1024);
    let config = mux_config();
    tokio::join!(
        Session::client(a, client_psk, &config),
        Session::server(b, server_psk, &config)
    )
}

/// Spawn a TCP server that echoes every connection until EOF
pub async fn spawn_echo_server() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = conn.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
                let _ = w.shutdown().await;
            });
        }
    });
    addr
}

/// Test configuration builder
#[derive(Default)]
pub struct TestConfigBuilder {
    credentials: Option<(String, String)>,
    marker_timeout: Option<u64>,
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Require username/password auth from SOCKS5 clients
    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    /// Set the marker deadline in seconds
    pub fn marker_timeout(mut self, secs: u64) -> Self {
        self.marker_timeout = Some(secs);
        self
    }

    /// Build a server configuration
    pub fn server(&self) -> Config {
        let mut server = ServerConfig::default();
        if let Some((username, password)) = &self.credentials {
            server.username = Some(username.clone());
            server.password = Some(password.clone());
        }
        if let Some(secs) = self.marker_timeout {
            server.marker_timeout = secs;
        }
        Config {
            psk: PSK.to_string(),
            marker: None,
            mux: mux_config(),
            server: Some(server),
            agent: None,
        }
    }

    /// Build an agent configuration dialing `remote`
    pub fn agent(&self, remote: SocketAddr) -> Config {
        Config {
            psk: PSK.to_string(),
            marker: None,
            mux: mux_config(),
            server: None,
            agent: Some(AgentConfig {
                remote_addr: remote.to_string(),
                transport: Default::default(),
                reconnect: None,
                socks: Default::default(),
            }),
        }
    }
}

/// Mock SOCKS5 client messages
pub mod socks5_mock {
    use revsocks::socks::*;

    /// Method selection offering only "no auth"
    pub fn create_auth_request_no_auth() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    }

    /// Method selection offering only username/password
    pub fn create_auth_request_password() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_PASSWORD]
    }

    /// RFC 1929 username/password request
    pub fn create_password_request(username: &str, password: &str) -> Vec<u8> {
        let mut req = vec![SOCKS5_AUTH_VERSION, username.len() as u8];
        req.extend_from_slice(username.as_bytes());
        req.push(password.len() as u8);
        req.extend_from_slice(password.as_bytes());
        req
    }

    /// CONNECT request to an IPv4 address
    pub fn create_connect_ipv4(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut cmd = vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_TCP_CONNECT,
            SOCKS5_RESERVED,
            SOCKS5_ADDR_TYPE_IPV4,
        ];
        cmd.extend_from_slice(&ip);
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }
}

/// Negotiate "no auth" and CONNECT to `target` through a SOCKS5 proxy
pub async fn socks5_connect(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut conn = TcpStream::connect(proxy).await.unwrap();

    conn.write_all(&socks5_mock::create_auth_request_no_auth())
        .await
        .unwrap();
    let mut choice = [0u8; 2];
    conn.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [5, 0]);

    let ip = match target.ip() {
        std::net::IpAddr::V4(ip) => ip.octets(),
        std::net::IpAddr::V6(_) => panic!("IPv4 target expected"),
    };
    conn.write_all(&socks5_mock::create_connect_ipv4(ip, target.port()))
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 5);
    assert_eq!(reply[1], 0, "CONNECT failed with reply code {}", reply[1]);

    conn
}
