//! Remote address with a cached resolution
//!
//! The agent redials the same server many times; the resolved address is
//! kept between attempts and dropped again when a dial fails.

use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A `host:port` string plus its last successful resolution
#[derive(Debug, Clone)]
pub struct AddrMaybeCached {
    addr: String,
    cached: Arc<RwLock<Option<SocketAddr>>>,
}

impl AddrMaybeCached {
    /// Wrap an address string without resolving it
    pub fn new(addr: &str) -> Self {
        AddrMaybeCached {
            addr: addr.to_string(),
            cached: Arc::new(RwLock::new(None)),
        }
    }

    /// The original address string
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Split into host and port; brackets around IPv6 literals are removed
    pub fn host_port(&self) -> Result<(&str, u16)> {
        let (host, port) = self
            .addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("Address has no port: {}", self.addr))?;
        let port = port
            .parse()
            .with_context(|| format!("Invalid port in address: {}", self.addr))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok((host, port))
    }

    /// The cached resolution, if any
    pub async fn get_cached(&self) -> Option<SocketAddr> {
        *self.cached.read().await
    }

    /// Forget the cached resolution so the next dial resolves again
    pub async fn clear_cache(&self) {
        *self.cached.write().await = None;
    }

    /// Resolve the address, using the cache when present
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if let Some(cached) = self.get_cached().await {
            return Ok(cached);
        }

        let resolved = tokio::net::lookup_host(self.addr.as_str())
            .await
            .with_context(|| format!("Failed to resolve address: {}", self.addr))?
            .next()
            .with_context(|| format!("No addresses found for: {}", self.addr))?;

        *self.cached.write().await = Some(resolved);
        Ok(resolved)
    }
}

impl From<SocketAddr> for AddrMaybeCached {
    fn from(addr: SocketAddr) -> Self {
        AddrMaybeCached {
            addr: addr.to_string(),
            cached: Arc::new(RwLock::new(Some(addr))),
        }
    }
}
