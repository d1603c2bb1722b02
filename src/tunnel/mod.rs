//! Reverse tunnel roles
//!
//! ```text
//! SOCKS5 client -> Server ==(marker, session, streams)==> Agent -> Target
//! ```
//!
//! The server listens for agents and SOCKS5 clients; the agent dials out to
//! the server, so only the server needs a reachable address.

mod agent;
mod marker;
mod relay;
mod server;

pub use agent::Agent;
pub use marker::{LivenessMarker, MARKER_LEN};
pub use relay::relay;
pub use server::Server;

use crate::config::{Config, Role};
use anyhow::Result;
use tokio::sync::broadcast;

/// Run whichever role `config` selects until shutdown
pub async fn run(config: Config, shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
    config.validate()?;

    match config.role()? {
        Role::Server => Server::new(&config)?.run(shutdown_rx).await,
        Role::Agent => Agent::new(&config)?.run(shutdown_rx).await,
    }
}
