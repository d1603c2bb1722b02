//! Frame codec
//!
//! A frame is the plaintext carried by one sealed record:
//!
//! ```text
//! +--------+----------------+-------------------+
//! | type:1 | stream_id:4 BE | payload (0..16K)  |
//! +--------+----------------+-------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MuxError;

/// Stream identifier, unique within a session
pub type StreamId = u32;

/// Size of the type + stream id header
pub const FRAME_HEADER_SIZE: usize = 5;

/// Largest payload a single frame may carry
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Frame type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Open a new stream
    Open = 1,
    /// Stream payload
    Data = 2,
    /// Sender will write no more data on this stream
    CloseWrite = 3,
    /// Abort the stream
    Reset = 4,
    /// Return receive credit for a stream
    WindowUpdate = 5,
    /// Keepalive request
    Ping = 6,
    /// Keepalive answer
    Pong = 7,
    /// Orderly end of the whole session
    SessionClose = 8,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => FrameType::Open,
            2 => FrameType::Data,
            3 => FrameType::CloseWrite,
            4 => FrameType::Reset,
            5 => FrameType::WindowUpdate,
            6 => FrameType::Ping,
            7 => FrameType::Pong,
            8 => FrameType::SessionClose,
            other => return Err(MuxError::Protocol(format!("unknown frame type {}", other))),
        })
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// OPEN for a stream id
    Open(StreamId),
    /// DATA with its payload
    Data(StreamId, Bytes),
    /// CLOSE_WRITE for a stream id
    CloseWrite(StreamId),
    /// RESET for a stream id
    Reset(StreamId),
    /// WINDOW_UPDATE carrying a credit increment
    WindowUpdate(StreamId, u32),
    /// PING carrying an opaque token
    Ping(u64),
    /// PONG echoing a PING token
    Pong(u64),
    /// SESSION_CLOSE
    SessionClose,
}

impl Frame {
    /// Type tag of this frame
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Open(_) => FrameType::Open,
            Frame::Data(..) => FrameType::Data,
            Frame::CloseWrite(_) => FrameType::CloseWrite,
            Frame::Reset(_) => FrameType::Reset,
            Frame::WindowUpdate(..) => FrameType::WindowUpdate,
            Frame::Ping(_) => FrameType::Ping,
            Frame::Pong(_) => FrameType::Pong,
            Frame::SessionClose => FrameType::SessionClose,
        }
    }

    /// Stream id of this frame, 0 for session frames
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Open(id)
            | Frame::Data(id, _)
            | Frame::CloseWrite(id)
            | Frame::Reset(id)
            | Frame::WindowUpdate(id, _) => *id,
            Frame::Ping(_) | Frame::Pong(_) | Frame::SessionClose => 0,
        }
    }

    /// Plaintext size of the encoded frame
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE
            + match self {
                Frame::Data(_, payload) => payload.len(),
                Frame::WindowUpdate(..) => 4,
                Frame::Ping(_) | Frame::Pong(_) => 8,
                _ => 0,
            }
    }

    /// Append the plaintext encoding of this frame to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.frame_type() as u8);
        dst.put_u32(self.stream_id());
        match self {
            Frame::Data(_, payload) => dst.put_slice(payload),
            Frame::WindowUpdate(_, increment) => dst.put_u32(*increment),
            Frame::Ping(token) | Frame::Pong(token) => dst.put_u64(*token),
            _ => {}
        }
    }

    /// Decode one frame from a record's plaintext, enforcing the shape rules
    pub fn decode(mut src: Bytes) -> Result<Frame, MuxError> {
        if src.len() < FRAME_HEADER_SIZE {
            return Err(MuxError::Protocol(format!(
                "frame too short: {} bytes",
                src.len()
            )));
        }
        let frame_type = FrameType::try_from(src.get_u8())?;
        let id = src.get_u32();

        let is_session_frame = matches!(
            frame_type,
            FrameType::Ping | FrameType::Pong | FrameType::SessionClose
        );
        if is_session_frame && id != 0 {
            return Err(MuxError::Protocol(format!(
                "{:?} frame with stream id {}",
                frame_type, id
            )));
        }
        if !is_session_frame && id == 0 {
            return Err(MuxError::Protocol(format!(
                "{:?} frame with stream id 0",
                frame_type
            )));
        }

        let expected = match frame_type {
            FrameType::Data => None,
            FrameType::WindowUpdate => Some(4),
            FrameType::Ping | FrameType::Pong => Some(8),
            _ => Some(0),
        };
        match expected {
            Some(len) if src.len() != len => {
                return Err(MuxError::Protocol(format!(
                    "{:?} frame with {} byte payload",
                    frame_type,
                    src.len()
                )))
            }
            None if src.len() > MAX_FRAME_PAYLOAD => {
                return Err(MuxError::Protocol(format!(
                    "data frame of {} bytes exceeds maximum",
                    src.len()
                )))
            }
            _ => {}
        }

        Ok(match frame_type {
            FrameType::Open => Frame::Open(id),
            FrameType::Data => Frame::Data(id, src),
            FrameType::CloseWrite => Frame::CloseWrite(id),
            FrameType::Reset => Frame::Reset(id),
            FrameType::WindowUpdate => Frame::WindowUpdate(id, src.get_u32()),
            FrameType::Ping => Frame::Ping(src.get_u64()),
            FrameType::Pong => Frame::Pong(src.get_u64()),
            FrameType::SessionClose => Frame::SessionClose,
        })
    }
}
