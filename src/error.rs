//! Error types for Revsocks
//!
//! `MuxError` covers the encrypted multiplexer (crypto channel, session and
//! streams). `Socks5Error` and `Socks5ReplyCode` cover the SOCKS5 front end.
//! Application glue uses `anyhow` on top of these.

use std::io;
use thiserror::Error;

/// Errors produced by the multiplexed session and its streams
#[derive(Error, Debug)]
pub enum MuxError {
    /// Handshake failed: wrong pre-shared key, bad hello or timeout
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// A record failed AEAD verification after the handshake
    #[error("Record failed integrity check")]
    Integrity,

    /// Peer violated the framing or flow-control rules
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The session is closed; no further streams or I/O
    #[error("Session closed")]
    SessionClosed,

    /// The peer reset the stream
    #[error("Stream closed by peer")]
    PeerClosedStream,

    /// The local write side of the stream is closed
    #[error("Stream closed for writing")]
    StreamClosed,

    /// No stream ids left in this session's id space
    #[error("Stream ids exhausted")]
    StreamIdsExhausted,

    /// Transport I/O failure
    #[error("Transport error: {0}")]
    Io(#[from] io::Error),
}

impl MuxError {
    fn io_kind(&self) -> io::ErrorKind {
        match self {
            MuxError::PeerClosedStream => io::ErrorKind::ConnectionReset,
            MuxError::SessionClosed => io::ErrorKind::ConnectionAborted,
            MuxError::StreamClosed => io::ErrorKind::BrokenPipe,
            MuxError::Authentication(_) => io::ErrorKind::PermissionDenied,
            MuxError::StreamIdsExhausted => io::ErrorKind::Other,
            MuxError::Integrity | MuxError::Protocol(_) => io::ErrorKind::InvalidData,
            MuxError::Io(e) => e.kind(),
        }
    }
}

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::Io(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

/// Extract the `MuxError` carried inside an `io::Error`, if any
pub fn mux_error(err: &io::Error) -> Option<&MuxError> {
    err.get_ref().and_then(|inner| inner.downcast_ref::<MuxError>())
}

/// Whether an I/O error means "the peer reset this stream"
///
/// This is the normal "stop serving this connection" signal and is not
/// worth more than a debug log.
pub fn is_peer_closed(err: &io::Error) -> bool {
    matches!(mux_error(err), Some(MuxError::PeerClosedStream))
}

/// SOCKS5 specific errors
#[derive(Error, Debug)]
pub enum Socks5Error {
    /// Unsupported SOCKS version
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// No acceptable authentication method
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Authentication failed
    #[error("Authentication failed")]
    AuthFailed,

    /// Command not supported
    #[error("Command not supported: {0}")]
    CommandNotSupported(u8),

    /// Address type not supported
    #[error("Address type not supported: {0}")]
    AddressTypeNotSupported(u8),

    /// Invalid domain name
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl From<&io::Error> for Socks5ReplyCode {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Socks5ReplyCode::ConnectionRefused,
            io::ErrorKind::TimedOut => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::AddrNotAvailable => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::PermissionDenied => Socks5ReplyCode::ConnectionNotAllowed,
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mux_error_into_io_kind() {
        let err: io::Error = MuxError::PeerClosedStream.into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);

        let err: io::Error = MuxError::SessionClosed.into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);

        let err: io::Error = MuxError::StreamClosed.into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        let err: io::Error = MuxError::Protocol("bad".to_string()).into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_mux_error_io_passthrough() {
        let inner = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let err: io::Error = MuxError::Io(inner).into();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(mux_error(&err).is_none());
    }

    #[test]
    fn test_is_peer_closed() {
        let err: io::Error = MuxError::PeerClosedStream.into();
        assert!(is_peer_closed(&err));

        let err: io::Error = MuxError::SessionClosed.into();
        assert!(!is_peer_closed(&err));

        let err = io::Error::new(io::ErrorKind::ConnectionReset, "plain reset");
        assert!(!is_peer_closed(&err));
    }

    #[test]
    fn test_mux_error_display() {
        let err = MuxError::Authentication("handshake timed out".to_string());
        assert_eq!(format!("{}", err), "Authentication error: handshake timed out");

        assert_eq!(format!("{}", MuxError::SessionClosed), "Session closed");
        assert_eq!(
            format!("{}", MuxError::PeerClosedStream),
            "Stream closed by peer"
        );
    }

    #[test]
    fn test_socks5_reply_code_to_u8() {
        assert_eq!(u8::from(Socks5ReplyCode::Succeeded), 0x00);
        assert_eq!(u8::from(Socks5ReplyCode::GeneralFailure), 0x01);
        assert_eq!(u8::from(Socks5ReplyCode::ConnectionNotAllowed), 0x02);
        assert_eq!(u8::from(Socks5ReplyCode::HostUnreachable), 0x04);
        assert_eq!(u8::from(Socks5ReplyCode::ConnectionRefused), 0x05);
        assert_eq!(u8::from(Socks5ReplyCode::CommandNotSupported), 0x07);
    }

    #[test]
    fn test_socks5_reply_code_from_io_error() {
        let cases = vec![
            (io::ErrorKind::ConnectionRefused, Socks5ReplyCode::ConnectionRefused),
            (io::ErrorKind::TimedOut, Socks5ReplyCode::HostUnreachable),
            (io::ErrorKind::AddrNotAvailable, Socks5ReplyCode::HostUnreachable),
            (io::ErrorKind::PermissionDenied, Socks5ReplyCode::ConnectionNotAllowed),
            (io::ErrorKind::Other, Socks5ReplyCode::GeneralFailure),
            (io::ErrorKind::NotFound, Socks5ReplyCode::GeneralFailure),
        ];

        for (kind, expected) in cases {
            let err = io::Error::new(kind, "test error");
            assert_eq!(Socks5ReplyCode::from(&err), expected);
        }
    }

    #[test]
    fn test_socks5_error_display() {
        let err = Socks5Error::UnsupportedVersion(4);
        assert_eq!(format!("{}", err), "Unsupported SOCKS version: 4");

        let err = Socks5Error::NoAcceptableMethod;
        assert_eq!(format!("{}", err), "No acceptable authentication method");

        let err = Socks5Error::AuthFailed;
        assert_eq!(format!("{}", err), "Authentication failed");

        let err = Socks5Error::CommandNotSupported(0xFF);
        assert_eq!(format!("{}", err), "Command not supported: 255");
    }
}
