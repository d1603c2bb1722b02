//! Agent role
//!
//! Dials the server, proves liveness and runs the acceptor side of the
//! session. Every stream the server opens carries one SOCKS5 request that
//! the agent dials out and relays.

use super::marker::LivenessMarker;
use crate::config::{AgentConfig, Config, MuxConfig, SocksConfig};
use crate::helper::RetryConfig;
use crate::mux::{MuxStream, Session};
use crate::pool::BufferPool;
use crate::socks::serve_connect;
use crate::transport::{create_transport, AddrMaybeCached, TransportDyn};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Reverse tunnel agent
pub struct Agent {
    config: AgentConfig,
    psk: String,
    mux: MuxConfig,
    marker: LivenessMarker,
    transport: Box<dyn TransportDyn>,
    remote: AddrMaybeCached,
    socks: Arc<SocksConfig>,
    pool: Arc<BufferPool>,
}

impl Agent {
    /// Build an agent from a configuration with an `[agent]` section
    pub fn new(config: &Config) -> Result<Self> {
        let agent = config
            .agent
            .clone()
            .ok_or_else(|| anyhow!("Configuration has no [agent] section"))?;

        let transport = create_transport(&agent.transport)?;
        let remote = AddrMaybeCached::new(&agent.remote_addr);

        Ok(Agent {
            psk: config.psk.clone(),
            mux: config.mux.clone(),
            marker: config.liveness_marker()?,
            transport,
            remote,
            socks: Arc::new(agent.socks.clone()),
            pool: Arc::new(BufferPool::default()),
            config: agent,
        })
    }

    /// Run until shutdown, the session ends without a reconnect policy, or
    /// the reconnect policy gives up
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        info!("Starting agent, server {}", self.config.remote_addr);

        tokio::select! {
            result = self.run_sessions() => {
                if let Err(e) = &result {
                    error!("Agent stopped: {:#}", e);
                }
                result
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping agent");
                Ok(())
            }
        }
    }

    async fn run_sessions(&self) -> Result<()> {
        let retry = match &self.config.reconnect {
            Some(reconnect) => RetryConfig::from(reconnect),
            None => {
                let session = self.connect().await?;
                self.serve(session).await;
                return Ok(());
            }
        };

        let mut failures: u32 = 0;
        loop {
            let delay = match self.connect().await {
                Ok(session) => {
                    failures = 0;
                    self.serve(session).await;
                    retry.delay_for_attempt(0)
                }
                Err(e) => {
                    failures += 1;
                    if !retry.should_retry(failures) {
                        return Err(e.context(format!("Giving up after {} attempts", failures)));
                    }
                    warn!("Connection attempt {} failed: {:#}", failures, e);
                    retry.delay_for_attempt(failures - 1)
                }
            };

            info!("Reconnecting in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Dial the server and establish a session
    pub async fn connect(&self) -> Result<Session> {
        let mut conn = self
            .transport
            .connect_dyn(&self.remote)
            .await
            .with_context(|| format!("Failed to connect to {}", self.remote.addr()))?;

        self.marker
            .send(&mut conn)
            .await
            .context("Failed to send marker")?;

        let session = Session::server(conn, &self.psk, &self.mux)
            .await
            .context("Session handshake failed")?;

        info!("Connected to {}", self.remote.addr());
        Ok(session)
    }

    /// Serve tunneled SOCKS5 requests until the session ends
    pub async fn serve(&self, session: Session) {
        loop {
            match session.accept_stream().await {
                Ok(stream) => {
                    tokio::spawn(handle_stream(
                        stream,
                        self.socks.clone(),
                        self.pool.clone(),
                    ));
                }
                Err(e) => {
                    info!("Session ended: {}", e);
                    break;
                }
            }
        }
        session.close();
    }
}

async fn handle_stream(stream: MuxStream, socks: Arc<SocksConfig>, pool: Arc<BufferPool>) {
    let id = stream.id();
    debug!("Stream {} opened", id);
    match serve_connect(stream, &socks, &pool).await {
        Ok(()) => debug!("Stream {} closed", id),
        Err(e) => info!("Stream {} failed: {:#}", id, e),
    }
}
