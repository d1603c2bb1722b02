//! Liveness marker
//!
//! The agent writes a fixed 64-byte value right after the transport is up.
//! The server reads it under a short deadline and drops the connection on
//! mismatch, before any cryptographic work is done.

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Marker length in bytes
pub const MARKER_LEN: usize = 64;

const DEFAULT_MARKER: [u8; MARKER_LEN] = [
    0x6a, 0x1d, 0x3e, 0x74, 0x8b, 0x99, 0x5a, 0x7f, 0xca, 0xef, 0x33, 0x88, 0xac, 0x44, 0x52, 0xbd,
    0x1e, 0x5f, 0x39, 0xd4, 0x6c, 0xb3, 0x72, 0xf8, 0x21, 0x9d, 0x54, 0x68, 0x91, 0xab, 0x43, 0xee,
    0x4c, 0x7a, 0x90, 0x26, 0xf7, 0x35, 0x9b, 0x5e, 0xd1, 0x88, 0x4f, 0xbc, 0x2a, 0x67, 0x91, 0xe4,
    0xaf, 0x34, 0xcd, 0x89, 0x60, 0x18, 0xa2, 0xde, 0x77, 0x93, 0xfb, 0x02, 0x6e, 0x11, 0xc3, 0xf0,
];

/// A 64-byte pre-session marker value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessMarker([u8; MARKER_LEN]);

impl Default for LivenessMarker {
    fn default() -> Self {
        LivenessMarker(DEFAULT_MARKER)
    }
}

impl LivenessMarker {
    /// Wrap raw marker bytes
    pub fn new(bytes: [u8; MARKER_LEN]) -> Self {
        LivenessMarker(bytes)
    }

    /// Decode a marker from base64; it must decode to exactly 64 bytes
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .context("Marker is not valid base64")?;
        let bytes: [u8; MARKER_LEN] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow!("Marker must be {} bytes, got {}", MARKER_LEN, b.len()))?;
        Ok(LivenessMarker(bytes))
    }

    /// Base64 form, as accepted by `from_base64`
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Raw marker bytes
    pub fn as_bytes(&self) -> &[u8; MARKER_LEN] {
        &self.0
    }

    /// Write the marker to a freshly connected transport
    pub async fn send<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.0).await?;
        writer.flush().await
    }

    /// Read the peer's marker within `timeout` and compare
    pub async fn verify<R>(&self, reader: &mut R, timeout: Duration) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut received = [0u8; MARKER_LEN];
        match tokio::time::timeout(timeout, reader.read_exact(&mut received)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e).context("Failed to read marker"),
            Err(_) => bail!("No marker within {:?}", timeout),
        }

        if received != self.0 {
            bail!("Marker mismatch");
        }
        Ok(())
    }
}
