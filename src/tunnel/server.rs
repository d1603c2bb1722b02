//! Server role
//!
//! Accepts one agent at a time. Each agent connection passes the liveness
//! marker, optional TLS and the session handshake; while the session lives,
//! SOCKS5 clients are authenticated locally and each one gets its own
//! stream to the agent.

use super::marker::LivenessMarker;
use super::relay::relay;
use crate::config::{Config, MuxConfig, ServerConfig};
use crate::error::is_peer_closed;
use crate::helper::duration_from_secs;
use crate::mux::Session;
use crate::pool::BufferPool;
use crate::socks::Authenticator;
use crate::transport::{server_acceptor, SocketOpts};
use anyhow::{anyhow, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Well-known key that should never be used outside of testing
const DEFAULT_PSK: &str = "password";

/// Reverse tunnel server
pub struct Server {
    config: ServerConfig,
    psk: String,
    mux: MuxConfig,
    marker: LivenessMarker,
    authenticator: Arc<Authenticator>,
    tls: Option<TlsAcceptor>,
    pool: Arc<BufferPool>,
}

impl Server {
    /// Build a server from a configuration with a `[server]` section
    pub fn new(config: &Config) -> Result<Self> {
        let server = config
            .server
            .clone()
            .ok_or_else(|| anyhow!("Configuration has no [server] section"))?;

        if config.psk == DEFAULT_PSK {
            warn!("Using the default pre-shared key, set a private one");
        }

        let authenticator = Authenticator::from_credentials(server.credentials());
        if authenticator == Authenticator::NoAuth {
            warn!("No password configured, SOCKS5 clients will not be authenticated");
        }

        let tls = match &server.tls {
            Some(tls) if tls.is_enabled() => match server_acceptor(tls) {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    warn!("TLS disabled, falling back to plain TCP: {:#}", e);
                    None
                }
            },
            _ => None,
        };

        Ok(Server {
            psk: config.psk.clone(),
            mux: config.mux.clone(),
            marker: config.liveness_marker()?,
            authenticator: Arc::new(authenticator),
            tls,
            pool: Arc::new(BufferPool::default()),
            config: server,
        })
    }

    /// Whether agent connections are wrapped in TLS
    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Bind both listeners and serve until shutdown
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        let agent_listener = TcpListener::bind(&self.config.listen)
            .await
            .with_context(|| format!("Failed to bind agent listener on {}", self.config.listen))?;
        let socks_listener = TcpListener::bind(&self.config.socks_listen)
            .await
            .with_context(|| {
                format!("Failed to bind SOCKS5 listener on {}", self.config.socks_listen)
            })?;

        info!(
            "Listening for agents on {} ({})",
            agent_listener.local_addr()?,
            if self.tls_enabled() { "tls" } else { "tcp" }
        );
        info!("SOCKS5 listener on {}", socks_listener.local_addr()?);

        tokio::select! {
            result = self.serve(agent_listener, socks_listener) => result,
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping server");
                Ok(())
            }
        }
    }

    /// Serve agents from `agent_listener` one at a time, exposing each live
    /// session through `socks_listener`
    pub async fn serve(&self, agent_listener: TcpListener, socks_listener: TcpListener) -> Result<()> {
        loop {
            let (conn, peer) = agent_listener
                .accept()
                .await
                .context("Failed to accept agent connection")?;

            match self.establish(conn, peer).await {
                Ok(session) => {
                    info!("Agent {} connected", peer);
                    self.serve_clients(session, &socks_listener).await;
                    info!("Agent {} disconnected", peer);
                }
                Err(e) => warn!("Rejected agent connection from {}: {:#}", peer, e),
            }
        }
    }

    async fn establish(&self, conn: TcpStream, peer: SocketAddr) -> Result<Session> {
        if let Err(e) = SocketOpts::from_tcp_config(&self.config.tcp).apply(&conn) {
            warn!("Failed to apply socket options for {}: {}", peer, e);
        }

        match &self.tls {
            Some(acceptor) => {
                let tls = tokio::time::timeout(self.mux.handshake_timeout(), acceptor.accept(conn))
                    .await
                    .context("TLS handshake timed out")?
                    .context("TLS handshake failed")?;
                self.establish_on(tls).await
            }
            None => self.establish_on(conn).await,
        }
    }

    async fn establish_on<S>(&self, mut io: S) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.marker
            .verify(&mut io, duration_from_secs(self.config.marker_timeout))
            .await
            .context("Liveness check failed")?;

        Session::client(io, &self.psk, &self.mux)
            .await
            .context("Session handshake failed")
    }

    /// Accept SOCKS5 clients until the session closes
    async fn serve_clients(&self, session: Session, socks_listener: &TcpListener) {
        let guard = CloseOnDrop(Arc::new(session));
        let session = &guard.0;

        loop {
            let (client, peer) = tokio::select! {
                _ = session.closed() => break,
                accepted = socks_listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept SOCKS5 client: {}", e);
                        continue;
                    }
                },
            };

            let _ = client.set_nodelay(true);
            tokio::spawn(handle_client(
                Arc::clone(session),
                client,
                peer,
                self.authenticator.clone(),
                duration_from_secs(self.config.auth_timeout),
                self.pool.clone(),
            ));
        }
    }
}

/// Closes the session when the accept loop ends or is cancelled, even though
/// client tasks still hold references to it
struct CloseOnDrop(Arc<Session>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Authenticate one SOCKS5 client, then tunnel it through a new stream
async fn handle_client(
    session: Arc<Session>,
    mut client: TcpStream,
    peer: SocketAddr,
    authenticator: Arc<Authenticator>,
    auth_timeout: Duration,
    pool: Arc<BufferPool>,
) {
    match tokio::time::timeout(auth_timeout, authenticator.negotiate(&mut client)).await {
        Ok(Ok(method)) => debug!("SOCKS5 client {} negotiated {:?}", peer, method),
        Ok(Err(e)) => {
            info!("SOCKS5 negotiation with {} failed: {:#}", peer, e);
            return;
        }
        Err(_) => {
            info!("SOCKS5 negotiation with {} timed out", peer);
            return;
        }
    }

    let stream = match session.open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to open stream for {}: {}, closing session", peer, e);
            session.close();
            return;
        }
    };
    let id = stream.id();
    debug!("Stream {} carries client {}", id, peer);

    match relay(client, stream, &pool).await {
        Ok((up, down)) => debug!("Stream {} done: {} bytes up, {} bytes down", id, up, down),
        Err(e) if is_peer_closed(&e) => debug!("Stream {} reset by agent", id),
        Err(e) => info!("Stream {} for {} ended with error: {}", id, peer, e),
    }
}
