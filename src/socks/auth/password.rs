//! Username/password authentication handler
//!
//! Implements RFC 1929 username/password authentication for SOCKS5.

use crate::error::Socks5Error;
use crate::socks::consts::*;
use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Username/password authentication handler
pub struct PasswordAuth;

impl PasswordAuth {
    /// Perform username/password authentication
    ///
    /// # Protocol
    ///
    /// Client sends:
    /// ```text
    /// +----+------+----------+------+----------+
    /// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    /// +----+------+----------+------+----------+
    /// | 1  |  1   | 0 to 255 |  1   | 0 to 255 |
    /// +----+------+----------+------+----------+
    /// ```
    ///
    /// Server responds:
    /// ```text
    /// +----+--------+
    /// |VER | STATUS |
    /// +----+--------+
    /// | 1  |   1    |
    /// +----+--------+
    /// ```
    ///
    /// Credentials are compared as raw bytes.
    pub async fn authenticate<S>(
        stream: &mut S,
        expected_username: &str,
        expected_password: &str,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;

        let version = buf[0];
        let username_len = buf[1] as usize;

        if version != SOCKS5_AUTH_VERSION {
            send_auth_result(stream, SOCKS5_AUTH_FAILURE).await?;
            bail!("Invalid auth version: {}", version);
        }

        let mut username = vec![0u8; username_len];
        stream.read_exact(&mut username).await?;

        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await?;
        let mut password = vec![0u8; buf[0] as usize];
        stream.read_exact(&mut password).await?;

        if username == expected_username.as_bytes() && password == expected_password.as_bytes() {
            send_auth_result(stream, SOCKS5_AUTH_SUCCESS).await?;
            tracing::debug!(
                "Authentication successful for user: {}",
                String::from_utf8_lossy(&username)
            );
            Ok(())
        } else {
            send_auth_result(stream, SOCKS5_AUTH_FAILURE).await?;
            tracing::debug!(
                "Authentication failed for user: {}",
                String::from_utf8_lossy(&username)
            );
            bail!(Socks5Error::AuthFailed);
        }
    }
}

/// Send authentication result to client
async fn send_auth_result<S: AsyncWrite + Unpin>(stream: &mut S, status: u8) -> Result<()> {
    stream.write_all(&[SOCKS5_AUTH_VERSION, status]).await?;
    stream.flush().await?;
    Ok(())
}
