//! Configuration module for Revsocks
//!
//! A config file (or the equivalent command-line flags) selects exactly one
//! role: `[server]` or `[agent]`. Both roles share the pre-shared key, the
//! liveness marker and the `[mux]` tunables.

mod agent;
mod mux;
mod server;
mod transport;

pub use agent::{AgentConfig, ReconnectConfig, SocksConfig};
pub use mux::MuxConfig;
pub use server::ServerConfig;
pub use transport::{ServerTlsConfig, TcpConfig, TlsConfig, TransportConfig, TransportType};

use crate::tunnel::LivenessMarker;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_psk() -> String {
    "password".to_string()
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Pre-shared key for the encrypted session
    #[serde(default = "default_psk")]
    pub psk: String,

    /// Liveness marker as base64 of 64 bytes (built-in value when absent)
    #[serde(default)]
    pub marker: Option<String>,

    /// Multiplexer tunables
    #[serde(default)]
    pub mux: MuxConfig,

    /// Server role
    #[serde(default)]
    pub server: Option<ServerConfig>,

    /// Agent role
    #[serde(default)]
    pub agent: Option<AgentConfig>,
}

/// The role selected by a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accept agents and serve SOCKS5 clients
    Server,
    /// Dial the server and serve tunneled requests
    Agent,
}

impl Config {
    /// Role selected by this configuration
    pub fn role(&self) -> Result<Role> {
        match (&self.server, &self.agent) {
            (Some(_), None) => Ok(Role::Server),
            (None, Some(_)) => Ok(Role::Agent),
            (None, None) => Err(anyhow!("Configuration must contain [server] or [agent]")),
            (Some(_), Some(_)) => Err(anyhow!(
                "Configuration must not contain both [server] and [agent]"
            )),
        }
    }

    /// Liveness marker to send or expect
    pub fn liveness_marker(&self) -> Result<LivenessMarker> {
        match &self.marker {
            Some(encoded) => LivenessMarker::from_base64(encoded).context("Invalid marker"),
            None => Ok(LivenessMarker::default()),
        }
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        if self.psk.is_empty() {
            return Err(anyhow!("psk must not be empty"));
        }
        self.role()?;
        self.liveness_marker()?;
        self.mux.validate().map_err(|e| anyhow!(e))?;
        if let Some(server) = &self.server {
            server.validate().map_err(|e| anyhow!(e))?;
        }
        if let Some(agent) = &self.agent {
            agent.validate().map_err(|e| anyhow!(e))?;
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(content).with_context(|| "Failed to parse configuration")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_minimal_server_config() {
        let config_str = r#"
psk = "s3cr3t"

[server]
"#;

        let config = parse_config(config_str).unwrap();
        assert_eq!(config.psk, "s3cr3t");
        assert_eq!(config.role().unwrap(), Role::Server);
        let server = config.server.unwrap();
        assert_eq!(server.listen, "0.0.0.0:10443");
        assert_eq!(server.socks_listen, "127.0.0.1:1080");
    }

    #[test]
    fn test_parse_full_agent_config() {
        let config_str = r#"
psk = "s3cr3t"

[mux]
keepalive_interval = 10
keepalive_timeout = 30
stream_window = 131072

[agent]
remote_addr = "server.example.com:10443"

[agent.transport]
type = "tls"

[agent.transport.tcp]
nodelay = true
keepalive_secs = 30
keepalive_interval = 10
proxy = "http://proxy.local:3128"

[agent.transport.tls]
hostname = "server.example.com"
skip_verify = true

[agent.reconnect]
max_retries = 5
initial_delay_ms = 200

[agent.socks]
dns_resolve = false
request_timeout = 15
"#;

        let config = parse_config(config_str).unwrap();
        assert_eq!(config.role().unwrap(), Role::Agent);
        assert_eq!(config.mux.keepalive_interval, 10);
        assert_eq!(config.mux.stream_window, 131072);

        let agent = config.agent.unwrap();
        assert_eq!(agent.remote_addr, "server.example.com:10443");
        assert_eq!(agent.transport.transport_type, TransportType::Tls);
        assert!(agent.transport.tls.unwrap().skip_verify);
        assert_eq!(
            agent.transport.tcp.proxy.unwrap().as_str(),
            "http://proxy.local:3128/"
        );
        assert_eq!(agent.reconnect.unwrap().max_retries, 5);
        assert!(!agent.socks.dns_resolve);
        assert_eq!(agent.socks.request_timeout, 15);
    }

    #[test]
    fn test_parse_config_rejects_missing_role() {
        assert!(parse_config("psk = \"x\"\n").is_err());
    }

    #[test]
    fn test_parse_config_rejects_both_roles() {
        let config_str = r#"
[server]

[agent]
remote_addr = "127.0.0.1:10443"
"#;
        assert!(parse_config(config_str).is_err());
    }

    #[test]
    fn test_parse_config_rejects_bad_marker() {
        let config_str = r#"
marker = "dG9vIHNob3J0"

[server]
"#;
        assert!(parse_config(config_str).is_err());
    }

    #[test]
    fn test_default_marker() {
        let config = parse_config("[server]\n").unwrap();
        assert_eq!(config.psk, "password");
        assert_eq!(config.liveness_marker().unwrap(), LivenessMarker::default());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "psk = \"from-file\"\n\n[server]\nlisten = \"127.0.0.1:0\"").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.psk, "from-file");
        assert_eq!(config.server.unwrap().listen, "127.0.0.1:0");
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config("/nonexistent/revsocks.toml").is_err());
    }
}
