//! Multiplexer configuration
//!
//! Tunables for the encrypted session shared by both roles.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::mux::MAX_FRAME_PAYLOAD;

/// Default handshake timeout in seconds
fn default_handshake_timeout() -> u64 {
    10
}

/// Default keepalive interval in seconds
fn default_keepalive_interval() -> u64 {
    15
}

/// Default keepalive timeout in seconds
fn default_keepalive_timeout() -> u64 {
    crate::helper::DEFAULT_KEEPALIVE_TIMEOUT_SECS
}

/// Default per-stream receive window in bytes
fn default_stream_window() -> u32 {
    256 * 1024
}

/// Default number of incoming streams waiting for accept
fn default_accept_backlog() -> usize {
    256
}

/// Default depth of the ordered write queue
fn default_write_queue() -> usize {
    64
}

/// Multiplexer configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MuxConfig {
    /// Handshake timeout in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,

    /// Interval between PING frames in seconds (0 disables keepalive)
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,

    /// Close the session when nothing arrives for this many seconds
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout: u64,

    /// Receive window granted to the peer for each stream
    #[serde(default = "default_stream_window")]
    pub stream_window: u32,

    /// Incoming streams queued for accept before new ones are reset
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: usize,

    /// Ordered frames queued for the writer task
    #[serde(default = "default_write_queue")]
    pub write_queue: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            handshake_timeout: default_handshake_timeout(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_timeout: default_keepalive_timeout(),
            stream_window: default_stream_window(),
            accept_backlog: default_accept_backlog(),
            write_queue: default_write_queue(),
        }
    }
}

impl MuxConfig {
    /// Handshake timeout as a `Duration`
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Keepalive interval, `None` when keepalive is disabled
    pub fn keepalive_interval(&self) -> Option<Duration> {
        match self.keepalive_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Idle deadline for the read loop, `None` when keepalive is disabled
    pub fn keepalive_timeout(&self) -> Option<Duration> {
        self.keepalive_interval()
            .map(|_| Duration::from_secs(self.keepalive_timeout))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.handshake_timeout == 0 {
            return Err("mux.handshake_timeout must be greater than 0".to_string());
        }
        if self.keepalive_interval > 0 && self.keepalive_timeout <= self.keepalive_interval {
            return Err(format!(
                "mux.keepalive_timeout ({}) must be greater than mux.keepalive_interval ({})",
                self.keepalive_timeout, self.keepalive_interval
            ));
        }
        if (self.stream_window as usize) < MAX_FRAME_PAYLOAD {
            return Err(format!(
                "mux.stream_window must be at least {} bytes",
                MAX_FRAME_PAYLOAD
            ));
        }
        if self.accept_backlog == 0 {
            return Err("mux.accept_backlog must be greater than 0".to_string());
        }
        if self.write_queue == 0 {
            return Err("mux.write_queue must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mux_config_default() {
        let config = MuxConfig::default();
        assert_eq!(config.handshake_timeout, 10);
        assert_eq!(config.keepalive_interval, 15);
        assert_eq!(config.keepalive_timeout, 45);
        assert_eq!(config.stream_window, 256 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mux_config_keepalive_disabled() {
        let config = MuxConfig {
            keepalive_interval: 0,
            ..Default::default()
        };
        assert!(config.keepalive_interval().is_none());
        assert!(config.keepalive_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mux_config_validate() {
        let config = MuxConfig {
            keepalive_interval: 30,
            keepalive_timeout: 30,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MuxConfig {
            stream_window: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MuxConfig {
            handshake_timeout: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MuxConfig {
            write_queue: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
