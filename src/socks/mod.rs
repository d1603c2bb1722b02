//! SOCKS5 protocol handling
//!
//! The server runs method negotiation ([`Authenticator`]) against each
//! client before opening a stream; the agent parses the request that
//! follows and serves CONNECT ([`serve_connect`]).

mod auth;
mod command;
mod connect;
mod consts;
mod types;

pub use auth::{AuthMethod, Authenticator, PasswordAuth};
pub use command::{parse_command, reply_bytes, send_reply};
pub use connect::serve_connect;
pub use consts::*;
pub use types::{SocksCommand, TargetAddr};
