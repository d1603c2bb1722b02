//! Crypto channel
//!
//! Wraps a reliable byte stream with a PSK-keyed AEAD record layer.
//!
//! Handshake: both sides send a bincode `Hello` (version, random nonce,
//! receive window). The PSK is stretched with PBKDF2-HMAC-SHA256, then one
//! ChaCha20-Poly1305 key per direction is derived with HKDF-SHA256, bound to
//! a SHA-256 hash of both serialized hellos (initiator's first). Each side
//! then sends a sealed confirmation record. A peer holding a different PSK,
//! or a hello altered in transit, fails the confirmation and the handshake
//! ends with `MuxError::Authentication`.
//!
//! Records: `len:u16 BE | ciphertext | tag:16`, nonce = 4 zero bytes followed
//! by the per-direction sequence number, AAD = the length prefix.

use bytes::{BufMut, Bytes, BytesMut};
use lazy_static::lazy_static;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, NONCE_LEN};
use ring::{digest, hkdf, pbkdf2};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::debug;

use super::frame::{Frame, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
use super::Side;
use crate::error::MuxError;

/// Current handshake version
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the random nonce each side contributes
pub const HELLO_NONCE_LEN: usize = 32;

/// Size of the length prefix of a record
pub const LEN_PREFIX: usize = 2;

/// Size of the Poly1305 tag
pub const TAG_LEN: usize = 16;

/// Largest sealed body a record may carry
pub const MAX_RECORD_BODY: usize = FRAME_HEADER_SIZE + MAX_FRAME_PAYLOAD + TAG_LEN;

const KDF_SALT: &[u8] = b"revsocks mux v1";
const PSK_SALT: &[u8] = b"revsocks psk v1";
const PSK_ITERATIONS: u32 = 20_000;
const INITIATOR_TO_ACCEPTOR: &[u8] = b"initiator to acceptor";
const ACCEPTOR_TO_INITIATOR: &[u8] = b"acceptor to initiator";
const CONFIRM_LABEL: &[u8] = b"revsocks key confirmation";

/// First message of the handshake, sent in the clear by both sides
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Handshake version
    pub version: u8,
    /// Fresh random nonce
    pub nonce: [u8; HELLO_NONCE_LEN],
    /// Per-stream receive window granted to the peer
    pub window: u32,
}

lazy_static! {
    static ref HELLO_LEN: usize = bincode::serialized_size(&Hello {
        version: PROTOCOL_VERSION,
        nonce: [0u8; HELLO_NONCE_LEN],
        window: 0,
    })
    .map(|len| len as usize)
    .unwrap_or(1 + HELLO_NONCE_LEN + 4);
}

/// Result of a successful handshake
pub struct Handshake<T> {
    /// Sealed read half
    pub reader: SealedReader<ReadHalf<T>>,
    /// Sealed write half
    pub writer: SealedWriter<WriteHalf<T>>,
    /// Receive window the peer grants each of our streams
    pub peer_window: u32,
}

/// Run the handshake over `io`, bounded by `timeout`
pub async fn handshake<T>(
    io: T,
    psk: &str,
    side: Side,
    window: u32,
    timeout: Duration,
) -> Result<Handshake<T>, MuxError>
where
    T: AsyncRead + AsyncWrite,
{
    match tokio::time::timeout(timeout, run_handshake(io, psk, side, window)).await {
        Ok(result) => result,
        Err(_) => Err(MuxError::Authentication(format!(
            "handshake timed out after {:?}",
            timeout
        ))),
    }
}

async fn run_handshake<T>(
    io: T,
    psk: &str,
    side: Side,
    window: u32,
) -> Result<Handshake<T>, MuxError>
where
    T: AsyncRead + AsyncWrite,
{
    let rng = SystemRandom::new();
    let mut nonce = [0u8; HELLO_NONCE_LEN];
    rng.fill(&mut nonce)
        .map_err(|_| MuxError::Io(io::Error::new(io::ErrorKind::Other, "system RNG failed")))?;

    let (mut rd, mut wr) = tokio::io::split(io);

    let local = Hello {
        version: PROTOCOL_VERSION,
        nonce,
        window,
    };
    let local_bytes = bincode::serialize(&local)
        .map_err(|e| MuxError::Protocol(format!("failed to serialize hello: {}", e)))?;
    wr.write_all(&local_bytes).await?;
    wr.flush().await?;

    let mut peer_bytes = vec![0u8; *HELLO_LEN];
    rd.read_exact(&mut peer_bytes).await?;
    let peer: Hello = bincode::deserialize(&peer_bytes)
        .map_err(|e| MuxError::Authentication(format!("malformed hello: {}", e)))?;

    if peer.version != PROTOCOL_VERSION {
        return Err(MuxError::Authentication(format!(
            "protocol version mismatch: expected {}, got {}",
            PROTOCOL_VERSION, peer.version
        )));
    }
    if peer.nonce == local.nonce {
        return Err(MuxError::Authentication("peer reflected our nonce".to_string()));
    }
    if peer.window == 0 {
        return Err(MuxError::Authentication("peer advertised an empty window".to_string()));
    }

    let transcript = match side {
        Side::Initiator => transcript_hash(&local_bytes, &peer_bytes),
        Side::Acceptor => transcript_hash(&peer_bytes, &local_bytes),
    };
    let (send_label, recv_label) = match side {
        Side::Initiator => (INITIATOR_TO_ACCEPTOR, ACCEPTOR_TO_INITIATOR),
        Side::Acceptor => (ACCEPTOR_TO_INITIATOR, INITIATOR_TO_ACCEPTOR),
    };
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, KDF_SALT).extract(&stretch_psk(psk));
    let send_key = derive_key(&prk, send_label, &transcript)?;
    let recv_key = derive_key(&prk, recv_label, &transcript)?;

    let mut writer = SealedWriter::new(wr, send_key);
    let mut reader = SealedReader::new(rd, recv_key);

    writer.write_record(|buf| buf.put_slice(CONFIRM_LABEL)).await?;
    writer.flush().await?;

    let confirm = match reader.read_record().await {
        Ok(plain) => plain,
        Err(MuxError::Integrity) => {
            return Err(MuxError::Authentication(
                "key confirmation failed, pre-shared key mismatch".to_string(),
            ))
        }
        Err(e) => return Err(e),
    };
    if &confirm[..] != CONFIRM_LABEL {
        return Err(MuxError::Authentication(
            "unexpected key confirmation payload".to_string(),
        ));
    }

    debug!("Handshake complete as {:?}", side);

    Ok(Handshake {
        reader,
        writer,
        peer_window: peer.window,
    })
}

/// Slow the PSK down so captured handshakes cannot be brute-forced at hash speed
fn stretch_psk(psk: &str) -> [u8; digest::SHA256_OUTPUT_LEN] {
    let mut out = [0u8; digest::SHA256_OUTPUT_LEN];
    let iterations = std::num::NonZeroU32::new(PSK_ITERATIONS).unwrap_or(std::num::NonZeroU32::MIN);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        PSK_SALT,
        psk.as_bytes(),
        &mut out,
    );
    out
}

/// SHA-256 over both serialized hellos, initiator's first
fn transcript_hash(initiator_hello: &[u8], acceptor_hello: &[u8]) -> digest::Digest {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(initiator_hello);
    ctx.update(acceptor_hello);
    ctx.finish()
}

fn derive_key(
    prk: &hkdf::Prk,
    label: &[u8],
    transcript: &digest::Digest,
) -> Result<LessSafeKey, MuxError> {
    let info = [label, transcript.as_ref()];
    let okm = prk
        .expand(&info, &aead::CHACHA20_POLY1305)
        .map_err(|_| MuxError::Authentication("key derivation failed".to_string()))?;
    Ok(LessSafeKey::new(UnboundKey::from(okm)))
}

/// Per-direction nonce sequence
struct NonceSequence(u64);

impl NonceSequence {
    fn advance(&mut self) -> Result<Nonce, MuxError> {
        let seq = self.0;
        self.0 = seq
            .checked_add(1)
            .ok_or_else(|| MuxError::Protocol("record sequence exhausted".to_string()))?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce[NONCE_LEN - 8..].copy_from_slice(&seq.to_be_bytes());
        Ok(Nonce::assume_unique_for_key(nonce))
    }
}

/// Sealing half of the crypto channel
pub struct SealedWriter<W> {
    inner: W,
    key: LessSafeKey,
    seq: NonceSequence,
    buf: BytesMut,
    in_flight: bool,
}

impl<W: AsyncWrite + Unpin> SealedWriter<W> {
    fn new(inner: W, key: LessSafeKey) -> Self {
        SealedWriter {
            inner,
            key,
            seq: NonceSequence(0),
            buf: BytesMut::with_capacity(LEN_PREFIX + MAX_RECORD_BODY),
            in_flight: false,
        }
    }

    /// Seal and write one frame
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), MuxError> {
        self.write_record(|buf| frame.encode(buf)).await
    }

    async fn write_record<F>(&mut self, fill: F) -> Result<(), MuxError>
    where
        F: FnOnce(&mut BytesMut),
    {
        self.buf.clear();
        self.buf.put_u16(0);
        fill(&mut self.buf);

        let body_len = self.buf.len() - LEN_PREFIX + TAG_LEN;
        if body_len > MAX_RECORD_BODY {
            return Err(MuxError::Protocol(format!(
                "record of {} bytes exceeds maximum",
                body_len
            )));
        }
        let len_prefix = (body_len as u16).to_be_bytes();
        self.buf[..LEN_PREFIX].copy_from_slice(&len_prefix);

        let nonce = self.seq.advance()?;
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::from(len_prefix), &mut self.buf[LEN_PREFIX..])
            .map_err(|_| MuxError::Protocol("failed to seal record".to_string()))?;
        self.buf.put_slice(tag.as_ref());

        self.in_flight = true;
        self.inner.write_all(&self.buf).await?;
        self.in_flight = false;
        Ok(())
    }

    /// Whether a record write was interrupted part way
    ///
    /// A torn record leaves the stream unusable for further records.
    pub fn is_torn(&self) -> bool {
        self.in_flight
    }

    /// Flush the underlying transport
    pub async fn flush(&mut self) -> Result<(), MuxError> {
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the underlying transport's write side
    pub async fn shutdown(&mut self) -> Result<(), MuxError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Opening half of the crypto channel
pub struct SealedReader<R> {
    inner: R,
    key: LessSafeKey,
    seq: NonceSequence,
}

impl<R: AsyncRead + Unpin> SealedReader<R> {
    fn new(inner: R, key: LessSafeKey) -> Self {
        SealedReader {
            inner,
            key,
            seq: NonceSequence(0),
        }
    }

    /// Read, open and decode one frame
    pub async fn read_frame(&mut self) -> Result<Frame, MuxError> {
        let plain = self.read_record().await?;
        Frame::decode(plain)
    }

    async fn read_record(&mut self) -> Result<Bytes, MuxError> {
        let mut len_prefix = [0u8; LEN_PREFIX];
        self.inner.read_exact(&mut len_prefix).await?;
        let body_len = u16::from_be_bytes(len_prefix) as usize;
        if !(TAG_LEN..=MAX_RECORD_BODY).contains(&body_len) {
            return Err(MuxError::Protocol(format!(
                "record length {} out of range",
                body_len
            )));
        }

        let mut body = BytesMut::zeroed(body_len);
        self.inner.read_exact(&mut body).await?;

        let nonce = self.seq.advance()?;
        let plain_len = self
            .key
            .open_in_place(nonce, Aad::from(len_prefix), &mut body)
            .map_err(|_| MuxError::Integrity)?
            .len();
        body.truncate(plain_len);
        Ok(body.freeze())
    }
}
