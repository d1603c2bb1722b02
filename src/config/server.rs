//! Server configuration types
//!
//! The server accepts one agent at a time and exposes a SOCKS5 listener that
//! tunnels every client through that agent.

use serde::{Deserialize, Serialize};

use super::{ServerTlsConfig, TcpConfig};

fn default_listen() -> String {
    "0.0.0.0:10443".to_string()
}

fn default_socks_listen() -> String {
    "127.0.0.1:1080".to_string()
}

fn default_marker_timeout() -> u64 {
    crate::helper::DEFAULT_MARKER_TIMEOUT_SECS
}

fn default_auth_timeout() -> u64 {
    10
}

/// Server configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address agents connect to
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Address SOCKS5 clients connect to
    #[serde(default = "default_socks_listen")]
    pub socks_listen: String,

    /// Username for SOCKS5 auth
    #[serde(default)]
    pub username: Option<String>,

    /// Password for SOCKS5 auth; auth is disabled when empty
    #[serde(default)]
    pub password: Option<String>,

    /// Deadline for the agent's liveness marker in seconds
    #[serde(default = "default_marker_timeout")]
    pub marker_timeout: u64,

    /// Deadline for SOCKS5 method negotiation in seconds
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout: u64,

    /// Socket tuning for accepted agent connections
    #[serde(default)]
    pub tcp: TcpConfig,

    /// TLS for the agent listener
    #[serde(default)]
    pub tls: Option<ServerTlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: default_listen(),
            socks_listen: default_socks_listen(),
            username: None,
            password: None,
            marker_timeout: default_marker_timeout(),
            auth_timeout: default_auth_timeout(),
            tcp: TcpConfig::default(),
            tls: None,
        }
    }
}

impl ServerConfig {
    /// Credentials to require from SOCKS5 clients, if a password is set
    pub fn credentials(&self) -> Option<(String, String)> {
        match self.password.as_deref() {
            Some(password) if !password.is_empty() => Some((
                self.username.clone().unwrap_or_default(),
                password.to_string(),
            )),
            _ => None,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.listen.is_empty() {
            return Err("server.listen must not be empty".to_string());
        }
        if self.socks_listen.is_empty() {
            return Err("server.socks_listen must not be empty".to_string());
        }
        if self.marker_timeout == 0 {
            return Err("server.marker_timeout must be greater than 0".to_string());
        }
        if let Some((username, password)) = self.credentials() {
            if username.len() > 255 || password.len() > 255 {
                return Err("SOCKS5 username and password are limited to 255 bytes".to_string());
            }
        }
        Ok(())
    }
}
