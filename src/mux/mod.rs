//! Encrypted stream multiplexer
//!
//! One [`Session`] runs over one reliable transport connection and carries
//! any number of [`MuxStream`]s. Every frame travels inside a record sealed
//! with a key derived from the pre-shared key (see [`crypto`]).
//!
//! ```text
//! MuxStream::poll_write ──┐                     ┌──> read loop ──> StreamCore ──> MuxStream::poll_read
//!                         ├─> writer task ──> transport
//! WINDOW_UPDATE / PING ───┘
//! ```

pub mod crypto;
mod frame;
mod session;
mod stream;

pub use frame::{Frame, FrameType, StreamId, FRAME_HEADER_SIZE, MAX_FRAME_PAYLOAD};
pub use session::Session;
pub use stream::{MuxStream, StreamState};

/// Which end of the session this is
///
/// The initiator (`Session::client`) allocates odd stream ids, the acceptor
/// (`Session::server`) even ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Opens streams with odd ids starting at 1
    Initiator,
    /// Opens streams with even ids starting at 2
    Acceptor,
}

impl Side {
    /// First stream id this side allocates
    pub fn first_stream_id(self) -> StreamId {
        match self {
            Side::Initiator => 1,
            Side::Acceptor => 2,
        }
    }

    /// Whether `id` belongs to this side's id space
    pub fn owns(self, id: StreamId) -> bool {
        (id % 2 == 1) == (self == Side::Initiator)
    }
}
