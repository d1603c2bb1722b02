//! Agent configuration types
//!
//! Defines the main configuration structures for the agent that dials out to
//! the server and serves SOCKS5 requests arriving on tunnel streams.

use serde::{Deserialize, Serialize};

use super::TransportConfig;
use crate::helper::RetryConfig;
use std::time::Duration;

/// Agent configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentConfig {
    /// Server address (e.g., "server.example.com:10443")
    pub remote_addr: String,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Reconnect policy; absent means connect once
    #[serde(default)]
    pub reconnect: Option<ReconnectConfig>,

    /// Embedded SOCKS5 service configuration
    #[serde(default)]
    pub socks: SocksConfig,
}

impl AgentConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.remote_addr.is_empty() {
            return Err("agent.remote_addr must not be empty".to_string());
        }
        self.transport.validate()?;
        if let Some(reconnect) = &self.reconnect {
            reconnect.validate()?;
        }
        Ok(())
    }
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_secs() -> u64 {
    60
}

fn default_multiplier() -> f64 {
    2.0
}

/// Reconnect policy with exponential backoff
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ReconnectConfig {
    /// Consecutive failures tolerated before giving up (0 = retry forever)
    #[serde(default)]
    pub max_retries: u32,

    /// First delay in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Delay cap in seconds
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Backoff multiplier
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            max_retries: 0,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            multiplier: default_multiplier(),
        }
    }
}

impl ReconnectConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err("agent.reconnect.multiplier must be at least 1.0".to_string());
        }
        Ok(())
    }
}

impl From<&ReconnectConfig> for RetryConfig {
    fn from(config: &ReconnectConfig) -> Self {
        RetryConfig {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_secs(config.max_delay_secs),
            multiplier: config.multiplier,
        }
    }
}

/// Default DNS resolve setting
fn default_dns_resolve() -> bool {
    true
}

/// Default request timeout in seconds
fn default_request_timeout() -> u64 {
    10
}

/// Embedded SOCKS5 CONNECT service configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SocksConfig {
    /// Resolve domain names on the agent (false rejects domain targets)
    #[serde(default = "default_dns_resolve")]
    pub dns_resolve: bool,

    /// Timeout for reading the request and dialing the target, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            dns_resolve: default_dns_resolve(),
            request_timeout: default_request_timeout(),
        }
    }
}
