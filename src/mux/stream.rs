//! Multiplexed streams
//!
//! [`StreamCore`] holds the per-stream state shared between the session's
//! read loop and the [`MuxStream`] handle. The session table owns cores by
//! id; a handle keeps its own `Arc` so it can still report a terminal error
//! after the session has forgotten the stream.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::PollSender;
use tracing::trace;

use super::frame::{Frame, StreamId, MAX_FRAME_PAYLOAD};
use super::session::Shared;
use crate::error::MuxError;

pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Id allocated, OPEN not yet queued
    Idle,
    /// Both directions usable
    Open,
    /// Local write side closed
    HalfClosedLocal,
    /// Remote write side closed
    HalfClosedRemote,
    /// Both directions closed, or reset
    Closed,
}

/// Why a stream ended abruptly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Terminal {
    PeerReset,
    LocalReset,
    SessionClosed,
}

impl Terminal {
    fn error(self) -> MuxError {
        match self {
            Terminal::PeerReset => MuxError::PeerClosedStream,
            Terminal::LocalReset => MuxError::StreamClosed,
            Terminal::SessionClosed => MuxError::SessionClosed,
        }
    }
}

struct StreamInner {
    state: StreamState,
    terminal: Option<Terminal>,
    recv_buf: VecDeque<Bytes>,
    /// Credit the peer still holds for this stream
    recv_window: u32,
    /// Bytes read locally but not yet credited back
    recv_consumed: u32,
    send_window: u32,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl StreamInner {
    fn remote_open(&self) -> bool {
        matches!(
            self.state,
            StreamState::Idle | StreamState::Open | StreamState::HalfClosedLocal
        )
    }

    fn local_open(&self) -> bool {
        matches!(
            self.state,
            StreamState::Idle | StreamState::Open | StreamState::HalfClosedRemote
        )
    }

    fn wake_all(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

/// Per-stream state, shared by the session table and the handle
pub(super) struct StreamCore {
    id: StreamId,
    window: u32,
    inner: Mutex<StreamInner>,
}

impl StreamCore {
    pub(super) fn new(id: StreamId, state: StreamState, window: u32, send_window: u32) -> Self {
        StreamCore {
            id,
            window,
            inner: Mutex::new(StreamInner {
                state,
                terminal: None,
                recv_buf: VecDeque::new(),
                recv_window: window,
                recv_consumed: 0,
                send_window,
                read_waker: None,
                write_waker: None,
            }),
        }
    }

    pub(super) fn id(&self) -> StreamId {
        self.id
    }

    pub(super) fn state(&self) -> StreamState {
        lock(&self.inner).state
    }

    pub(super) fn set_open(&self) {
        let mut inner = lock(&self.inner);
        if inner.state == StreamState::Idle {
            inner.state = StreamState::Open;
        }
    }

    /// Queue an inbound DATA payload
    pub(super) fn on_data(&self, payload: Bytes) -> Result<(), MuxError> {
        let mut inner = lock(&self.inner);
        if inner.terminal.is_some() {
            return Ok(());
        }
        if !inner.remote_open() {
            return Err(MuxError::Protocol(format!(
                "data on stream {} after close-write",
                self.id
            )));
        }
        let len = payload.len();
        if len > inner.recv_window as usize {
            return Err(MuxError::Protocol(format!(
                "stream {} sent {} bytes with {} bytes of credit",
                self.id, len, inner.recv_window
            )));
        }
        if len == 0 {
            return Ok(());
        }
        inner.recv_window -= len as u32;
        inner.recv_buf.push_back(payload);
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
        Ok(())
    }

    /// Peer closed its write side; returns true once both sides are closed
    pub(super) fn on_close_write(&self) -> Result<bool, MuxError> {
        let mut inner = lock(&self.inner);
        if inner.terminal.is_some() {
            return Ok(false);
        }
        inner.state = match inner.state {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            StreamState::HalfClosedRemote | StreamState::Closed => {
                return Err(MuxError::Protocol(format!(
                    "duplicate close-write on stream {}",
                    self.id
                )))
            }
        };
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
        Ok(inner.state == StreamState::Closed)
    }

    /// Peer returned send credit
    pub(super) fn on_window_update(&self, increment: u32) -> Result<(), MuxError> {
        let mut inner = lock(&self.inner);
        if inner.terminal.is_some() {
            return Ok(());
        }
        inner.send_window = inner.send_window.checked_add(increment).ok_or_else(|| {
            MuxError::Protocol(format!("send window overflow on stream {}", self.id))
        })?;
        if let Some(waker) = inner.write_waker.take() {
            waker.wake();
        }
        Ok(())
    }

    /// End the stream abruptly, discarding buffered data
    pub(super) fn terminate(&self, reason: Terminal) {
        let mut inner = lock(&self.inner);
        if inner.terminal.is_none() {
            inner.terminal = Some(reason);
        }
        inner.state = StreamState::Closed;
        inner.recv_buf.clear();
        inner.wake_all();
    }

    /// Mark a local abort; returns true if the peer must be sent a RESET
    fn local_reset(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.terminal.is_some() || inner.state == StreamState::Closed {
            return false;
        }
        inner.terminal = Some(Terminal::LocalReset);
        inner.state = StreamState::Closed;
        inner.recv_buf.clear();
        true
    }

    /// Copy buffered data into `buf`; yields credit to return to the peer
    fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<Result<Option<u32>, MuxError>> {
        let mut inner = lock(&self.inner);
        if let Some(terminal) = inner.terminal {
            return Poll::Ready(Err(terminal.error()));
        }
        if inner.recv_buf.is_empty() {
            if !inner.remote_open() {
                return Poll::Ready(Ok(None));
            }
            inner.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let mut copied = 0usize;
        while buf.remaining() > 0 {
            let Some(front) = inner.recv_buf.front_mut() else {
                break;
            };
            let n = front.len().min(buf.remaining());
            buf.put_slice(&front[..n]);
            front.advance(n);
            copied += n;
            if front.is_empty() {
                inner.recv_buf.pop_front();
            }
        }

        inner.recv_consumed += copied as u32;
        if inner.remote_open() && inner.recv_consumed >= self.window / 4 {
            let credit = inner.recv_consumed;
            inner.recv_consumed = 0;
            inner.recv_window += credit;
            return Poll::Ready(Ok(Some(credit)));
        }
        Poll::Ready(Ok(None))
    }

    /// Error a write would fail with right now, if any
    fn write_error(&self) -> Option<MuxError> {
        let inner = lock(&self.inner);
        match inner.terminal {
            Some(terminal) => Some(terminal.error()),
            None if !inner.local_open() => Some(MuxError::StreamClosed),
            None => None,
        }
    }

    /// Take up to `want` bytes of send credit
    fn poll_send_credit(&self, cx: &mut Context<'_>, want: usize) -> Poll<Result<usize, MuxError>> {
        let mut inner = lock(&self.inner);
        if let Some(terminal) = inner.terminal {
            return Poll::Ready(Err(terminal.error()));
        }
        if !inner.local_open() {
            return Poll::Ready(Err(MuxError::StreamClosed));
        }
        if inner.send_window == 0 {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = want.min(inner.send_window as usize);
        inner.send_window -= n as u32;
        Poll::Ready(Ok(n))
    }

    /// Close the local write side
    ///
    /// `Ok(None)` when it was already closed, otherwise whether the stream is
    /// now fully closed.
    fn close_write(&self) -> Result<Option<bool>, MuxError> {
        let mut inner = lock(&self.inner);
        if let Some(terminal) = inner.terminal {
            return Err(terminal.error());
        }
        inner.state = match inner.state {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            StreamState::HalfClosedLocal | StreamState::Closed => return Ok(None),
        };
        Ok(Some(inner.state == StreamState::Closed))
    }
}

/// One full-duplex byte pipe inside a [`Session`](super::Session)
///
/// Reads return buffered data in order, then EOF once the peer has closed
/// its write side. `shutdown()` sends CLOSE_WRITE. Dropping a stream that
/// is not fully closed resets it.
///
/// I/O errors carry a [`MuxError`]: `ConnectionReset` when the peer reset the
/// stream, `ConnectionAborted` when the session closed, `BrokenPipe` when
/// writing after `shutdown()`.
pub struct MuxStream {
    core: Arc<StreamCore>,
    shared: Arc<Shared>,
    sender: PollSender<Frame>,
}

impl MuxStream {
    pub(super) fn new(shared: Arc<Shared>, core: Arc<StreamCore>) -> Self {
        let sender = PollSender::new(shared.data_sender());
        MuxStream {
            core,
            shared,
            sender,
        }
    }

    /// Stream id
    pub fn id(&self) -> StreamId {
        self.core.id()
    }

    /// Current lifecycle state
    pub fn state(&self) -> StreamState {
        self.core.state()
    }

    /// Abort the stream: the peer sees `PeerClosedStream`, buffered data is
    /// discarded
    pub fn reset(self) {
        drop(self)
    }
}

impl fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxStream")
            .field("id", &self.core.id())
            .field("state", &self.core.state())
            .finish()
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let this = self.get_mut();
        match ready!(this.core.poll_read(cx, buf)) {
            Ok(Some(credit)) => {
                this.shared
                    .send_control(Frame::WindowUpdate(this.core.id(), credit));
                Poll::Ready(Ok(()))
            }
            Ok(None) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(e.into())),
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let this = self.get_mut();
        if let Some(e) = this.core.write_error() {
            return Poll::Ready(Err(e.into()));
        }
        if ready!(this.sender.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(MuxError::SessionClosed.into()));
        }

        let want = buf.len().min(MAX_FRAME_PAYLOAD);
        let n = match this.core.poll_send_credit(cx, want) {
            Poll::Ready(Ok(n)) => n,
            Poll::Ready(Err(e)) => {
                this.sender.abort_send();
                return Poll::Ready(Err(e.into()));
            }
            Poll::Pending => {
                this.sender.abort_send();
                return Poll::Pending;
            }
        };

        let frame = Frame::Data(this.core.id(), Bytes::copy_from_slice(&buf[..n]));
        if this.sender.send_item(frame).is_err() {
            return Poll::Ready(Err(MuxError::SessionClosed.into()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the session writer as soon as they are written
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if ready!(this.sender.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(MuxError::SessionClosed.into()));
        }
        match this.core.close_write() {
            Ok(Some(fully_closed)) => {
                let id = this.core.id();
                if this.sender.send_item(Frame::CloseWrite(id)).is_err() {
                    return Poll::Ready(Err(MuxError::SessionClosed.into()));
                }
                trace!("Stream {} closed for writing", id);
                if fully_closed {
                    this.shared.forget(id);
                }
                Poll::Ready(Ok(()))
            }
            Ok(None) => {
                this.sender.abort_send();
                Poll::Ready(Ok(()))
            }
            Err(e) => {
                this.sender.abort_send();
                Poll::Ready(Err(e.into()))
            }
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        let id = self.core.id();
        if self.core.local_reset() {
            trace!("Resetting stream {}", id);
            self.shared.send_reset(id);
        }
        self.shared.forget(id);
    }
}
