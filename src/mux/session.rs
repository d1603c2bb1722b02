//! Multiplexer session
//!
//! A session owns one crypto channel and three tasks:
//!
//! - the writer, sole owner of the sealed write half. It drains the control
//!   queue (WINDOW_UPDATE, PING, PONG) before the ordered data queue (OPEN,
//!   DATA, CLOSE_WRITE, RESET), one record at a time.
//! - the read loop, which routes inbound frames to streams. It never waits
//!   on a consumer: stream buffers are bounded by the receive window.
//! - the keepalive ticker (optional).
//!
//! Closing the session cancels all three, terminates every stream and drops
//! the transport.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::crypto::{self, Handshake, SealedReader, SealedWriter};
use super::frame::{Frame, StreamId};
use super::stream::{lock, MuxStream, StreamCore, StreamState, Terminal};
use super::Side;
use crate::config::MuxConfig;
use crate::error::MuxError;

/// Upper bound for the goodbye frame and transport shutdown on close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared by the session handle, its tasks and its streams
pub(super) struct Shared {
    side: Side,
    window: u32,
    peer_window: u32,
    /// Next id to hand out; wider than `StreamId` so the last id is usable
    next_id: AtomicU64,
    streams: Mutex<HashMap<StreamId, Arc<StreamCore>>>,
    data_tx: mpsc::Sender<Frame>,
    ctrl_tx: mpsc::UnboundedSender<Frame>,
    closed: AtomicBool,
    local_close: AtomicBool,
    token: CancellationToken,
}

impl Shared {
    pub(super) fn data_sender(&self) -> mpsc::Sender<Frame> {
        self.data_tx.clone()
    }

    pub(super) fn send_control(&self, frame: Frame) {
        let _ = self.ctrl_tx.send(frame);
    }

    /// Queue a RESET without blocking (called from `Drop`)
    pub(super) fn send_reset(&self, id: StreamId) {
        match self.data_tx.try_send(Frame::Reset(id)) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                if let Ok(handle) = Handle::try_current() {
                    let tx = self.data_tx.clone();
                    handle.spawn(async move {
                        let _ = tx.send(frame).await;
                    });
                }
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Drop a stream from the table
    pub(super) fn forget(&self, id: StreamId) {
        lock(&self.streams).remove(&id);
    }

    fn lookup(&self, id: StreamId) -> Option<Arc<StreamCore>> {
        lock(&self.streams).get(&id).cloned()
    }

    fn allocate_id(&self) -> Result<StreamId, MuxError> {
        self.next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                (id <= u64::from(StreamId::MAX)).then_some(id + 2)
            })
            .ok()
            .and_then(|id| StreamId::try_from(id).ok())
            .ok_or(MuxError::StreamIdsExhausted)
    }

    fn register(&self, core: Arc<StreamCore>) -> Result<(), MuxError> {
        let mut streams = lock(&self.streams);
        // Checked under the table lock so close() cannot miss this stream
        if self.closed.load(Ordering::SeqCst) {
            return Err(MuxError::SessionClosed);
        }
        let id = core.id();
        if streams.contains_key(&id) {
            return Err(MuxError::Protocol(format!("stream {} is already open", id)));
        }
        streams.insert(id, core);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self, local: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.local_close.store(local, Ordering::SeqCst);
        self.token.cancel();

        let cores: Vec<_> = lock(&self.streams).drain().map(|(_, core)| core).collect();
        debug!(
            "Session closed ({}), terminating {} streams",
            if local { "local" } else { "remote" },
            cores.len()
        );
        for core in cores {
            core.terminate(Terminal::SessionClosed);
        }
    }

    fn accept_remote(
        self: &Arc<Self>,
        id: StreamId,
        accept_tx: &mpsc::Sender<MuxStream>,
    ) -> Result<(), MuxError> {
        if self.side.owns(id) {
            return Err(MuxError::Protocol(format!(
                "peer opened stream {} from our id space",
                id
            )));
        }
        let core = Arc::new(StreamCore::new(
            id,
            StreamState::Open,
            self.window,
            self.peer_window,
        ));
        self.register(core.clone())?;

        let stream = MuxStream::new(self.clone(), core);
        match accept_tx.try_send(stream) {
            Ok(()) => trace!("Stream {} queued for accept", id),
            Err(TrySendError::Full(stream)) => {
                warn!("Accept backlog full, resetting stream {}", id);
                drop(stream);
            }
            Err(TrySendError::Closed(stream)) => drop(stream),
        }
        Ok(())
    }

    async fn recv_frames<R>(
        self: &Arc<Self>,
        reader: &mut SealedReader<R>,
        accept_tx: &mpsc::Sender<MuxStream>,
        idle_timeout: Option<Duration>,
    ) -> Result<(), MuxError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = match idle_timeout {
                Some(limit) => tokio::time::timeout(limit, reader.read_frame())
                    .await
                    .map_err(|_| {
                        MuxError::Io(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("no frame received for {:?}", limit),
                        ))
                    })??,
                None => reader.read_frame().await?,
            };

            match frame {
                Frame::Open(id) => self.accept_remote(id, accept_tx)?,
                Frame::Data(id, payload) => match self.lookup(id) {
                    Some(core) => core.on_data(payload)?,
                    None => trace!("Dropping data for unknown stream {}", id),
                },
                Frame::CloseWrite(id) => {
                    if let Some(core) = self.lookup(id) {
                        if core.on_close_write()? {
                            self.forget(id);
                        }
                    }
                }
                Frame::Reset(id) => {
                    let core = lock(&self.streams).remove(&id);
                    if let Some(core) = core {
                        debug!("Stream {} reset by peer", id);
                        core.terminate(Terminal::PeerReset);
                    }
                }
                Frame::WindowUpdate(id, increment) => {
                    if let Some(core) = self.lookup(id) {
                        core.on_window_update(increment)?;
                    }
                }
                Frame::Ping(token) => self.send_control(Frame::Pong(token)),
                Frame::Pong(token) => trace!("Pong {}", token),
                Frame::SessionClose => {
                    info!("Peer closed the session");
                    return Ok(());
                }
            }
        }
    }
}

/// An encrypted, multiplexed session over one transport connection
///
/// Dropping the session closes it.
pub struct Session {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
}

impl Session {
    /// Run the handshake as the initiator (odd stream ids)
    pub async fn client<T>(io: T, psk: &str, config: &MuxConfig) -> Result<Session, MuxError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Session::establish(io, psk, Side::Initiator, config).await
    }

    /// Run the handshake as the acceptor (even stream ids)
    pub async fn server<T>(io: T, psk: &str, config: &MuxConfig) -> Result<Session, MuxError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Session::establish(io, psk, Side::Acceptor, config).await
    }

    async fn establish<T>(
        io: T,
        psk: &str,
        side: Side,
        config: &MuxConfig,
    ) -> Result<Session, MuxError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Handshake {
            reader,
            writer,
            peer_window,
        } = crypto::handshake(
            io,
            psk,
            side,
            config.stream_window,
            config.handshake_timeout(),
        )
        .await?;

        let (data_tx, data_rx) = mpsc::channel(config.write_queue);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);

        let shared = Arc::new(Shared {
            side,
            window: config.stream_window,
            peer_window,
            next_id: AtomicU64::new(u64::from(side.first_stream_id())),
            streams: Mutex::new(HashMap::new()),
            data_tx,
            ctrl_tx,
            closed: AtomicBool::new(false),
            local_close: AtomicBool::new(false),
            token: CancellationToken::new(),
        });

        tokio::spawn(write_loop(shared.clone(), writer, data_rx, ctrl_rx));
        tokio::spawn(read_loop(
            shared.clone(),
            reader,
            accept_tx,
            config.keepalive_timeout(),
        ));
        if let Some(interval) = config.keepalive_interval() {
            tokio::spawn(keepalive(
                shared.token.clone(),
                shared.ctrl_tx.clone(),
                interval,
            ));
        }

        Ok(Session {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        })
    }

    /// Which end of the session this is
    pub fn side(&self) -> Side {
        self.shared.side
    }

    /// Open a new stream
    ///
    /// Does not wait for the peer; only waits for room in the local write
    /// queue.
    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        let shared = &self.shared;
        let permit = tokio::select! {
            biased;
            _ = shared.token.cancelled() => return Err(MuxError::SessionClosed),
            permit = shared.data_tx.reserve() => permit.map_err(|_| MuxError::SessionClosed)?,
        };

        let id = shared.allocate_id()?;
        let core = Arc::new(StreamCore::new(
            id,
            StreamState::Idle,
            shared.window,
            shared.peer_window,
        ));
        shared.register(core.clone())?;
        permit.send(Frame::Open(id));
        core.set_open();

        debug!("Opened stream {}", id);
        Ok(MuxStream::new(shared.clone(), core))
    }

    /// Wait for the peer to open a stream
    pub async fn accept_stream(&self) -> Result<MuxStream, MuxError> {
        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.shared.token.cancelled() => Err(MuxError::SessionClosed),
            stream = accept_rx.recv() => stream.ok_or(MuxError::SessionClosed),
        }
    }

    /// Close the session; idempotent
    pub fn close(&self) {
        self.shared.close(true);
    }

    /// Whether the session is closed
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves once the session is closed, by either side
    pub async fn closed(&self) {
        self.shared.token.cancelled().await
    }

    /// Number of streams currently in the session table
    pub fn stream_count(&self) -> usize {
        lock(&self.shared.streams).len()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.close(true);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("side", &self.shared.side)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    mut writer: SealedWriter<W>,
    mut data_rx: mpsc::Receiver<Frame>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    let token = shared.token.clone();
    let result = tokio::select! {
        _ = token.cancelled() => Ok(()),
        res = pump_frames(&mut writer, &mut data_rx, &mut ctrl_rx) => res,
    };
    if let Err(e) = result {
        warn!("Session writer failed: {}", e);
    }
    // No-op when the session was already closed
    shared.close(false);

    if shared.local_close.load(Ordering::SeqCst) && !writer.is_torn() {
        let goodbye = async {
            writer.write_frame(&Frame::SessionClose).await?;
            writer.flush().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, goodbye).await {
            Ok(Ok(())) => trace!("Sent session close"),
            Ok(Err(e)) => debug!("Failed to send session close: {}", e),
            Err(_) => debug!("Timed out sending session close"),
        }
    }
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await;
}

async fn pump_frames<W>(
    writer: &mut SealedWriter<W>,
    data_rx: &mut mpsc::Receiver<Frame>,
    ctrl_rx: &mut mpsc::UnboundedReceiver<Frame>,
) -> Result<(), MuxError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            Some(frame) = ctrl_rx.recv() => frame,
            Some(frame) = data_rx.recv() => frame,
            else => return Ok(()),
        };
        writer.write_frame(&frame).await?;
        if ctrl_rx.is_empty() && data_rx.is_empty() {
            writer.flush().await?;
        }
    }
}

async fn read_loop<R>(
    shared: Arc<Shared>,
    mut reader: SealedReader<R>,
    accept_tx: mpsc::Sender<MuxStream>,
    idle_timeout: Option<Duration>,
) where
    R: AsyncRead + Unpin,
{
    let token = shared.token.clone();
    let result = tokio::select! {
        _ = token.cancelled() => Ok(()),
        res = shared.recv_frames(&mut reader, &accept_tx, idle_timeout) => res,
    };
    match result {
        Ok(()) | Err(MuxError::SessionClosed) => debug!("Session read loop finished"),
        Err(MuxError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
            info!("Session transport closed by peer")
        }
        Err(e) => warn!("Session read loop failed: {}", e),
    }
    shared.close(false);
}

async fn keepalive(
    token: CancellationToken,
    ctrl_tx: mpsc::UnboundedSender<Frame>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    let mut seq = 0u64;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                seq = seq.wrapping_add(1);
                if ctrl_tx.send(Frame::Ping(seq)).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    const PSK: &str = "s3cr3t";

    fn config() -> MuxConfig {
        MuxConfig {
            keepalive_interval: 0,
            ..Default::default()
        }
    }

    async fn session_pair(config: &MuxConfig) -> (Session, Session) {
        let (a, b) = duplex(256 * 1024);
        let (client, server) = tokio::join!(
            Session::client(a, PSK, config),
            Session::server(b, PSK, config)
        );
        (client.unwrap(), server.unwrap())
    }

    /// A session on one end, the raw sealed channel on the other
    async fn raw_peer(
        config: &MuxConfig,
    ) -> (
        Session,
        SealedReader<tokio::io::ReadHalf<DuplexStream>>,
        SealedWriter<tokio::io::WriteHalf<DuplexStream>>,
    ) {
        let (a, b) = duplex(256 * 1024);
        let (session, raw) = tokio::join!(
            Session::client(a, PSK, config),
            crypto::handshake(
                b,
                PSK,
                Side::Acceptor,
                config.stream_window,
                Duration::from_secs(5)
            )
        );
        let raw = raw.unwrap();
        (session.unwrap(), raw.reader, raw.writer)
    }

    #[tokio::test]
    async fn test_open_accept_round_trip() {
        let (client, server) = session_pair(&config()).await;

        let mut outbound = client.open_stream().await.unwrap();
        assert_eq!(outbound.id(), 1);
        outbound.write_all(b"ping").await.unwrap();

        let mut inbound = server.accept_stream().await.unwrap();
        assert_eq!(inbound.id(), 1);
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        inbound.write_all(b"pong").await.unwrap();
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        let second = server.open_stream().await.unwrap();
        assert_eq!(second.id(), 2);
        assert_eq!(client.accept_stream().await.unwrap().id(), 2);
    }

    #[tokio::test]
    async fn test_flow_control_large_transfer() {
        let config = MuxConfig {
            stream_window: 16 * 1024,
            ..config()
        };
        let (client, server) = session_pair(&config).await;

        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let mut outbound = client.open_stream().await.unwrap();
        let writer = tokio::spawn(async move {
            outbound.write_all(&payload).await.unwrap();
            outbound.shutdown().await.unwrap();
            outbound
        });

        let mut inbound = server.accept_stream().await.unwrap();
        let mut received = Vec::new();
        inbound.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), expected.len());
        assert_eq!(received, expected);

        let _outbound = writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_close_forgets_streams() {
        let (client, server) = session_pair(&config()).await;

        let mut outbound = client.open_stream().await.unwrap();
        let mut inbound = server.accept_stream().await.unwrap();

        outbound.shutdown().await.unwrap();
        let mut buf = Vec::new();
        inbound.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        assert_eq!(inbound.state(), StreamState::HalfClosedRemote);

        inbound.shutdown().await.unwrap();
        assert_eq!(inbound.state(), StreamState::Closed);
        outbound.read_to_end(&mut buf).await.unwrap();
        assert_eq!(outbound.state(), StreamState::Closed);

        assert_eq!(client.stream_count(), 0);
        assert_eq!(server.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_write_after_shutdown_is_broken_pipe() {
        let (client, _server) = session_pair(&config()).await;
        let mut outbound = client.open_stream().await.unwrap();
        outbound.shutdown().await.unwrap();
        // Second shutdown is a no-op
        outbound.shutdown().await.unwrap();

        let err = outbound.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_accept_backlog_overflow_resets() {
        let config = MuxConfig {
            accept_backlog: 1,
            ..config()
        };
        let (client, server) = session_pair(&config).await;

        let _first = client.open_stream().await.unwrap();
        let mut second = client.open_stream().await.unwrap();

        // The second OPEN finds the backlog full and is reset
        let mut buf = [0u8; 1];
        let err = second.read(&mut buf).await.unwrap_err();
        assert!(crate::error::is_peer_closed(&err));

        assert_eq!(server.accept_stream().await.unwrap().id(), 1);
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn test_open_with_own_parity_is_protocol_error() {
        let (session, _reader, mut writer) = raw_peer(&config()).await;
        // The client owns odd ids; the peer must not open them
        writer.write_frame(&Frame::Open(1)).await.unwrap();
        writer.flush().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();
        assert!(matches!(
            session.accept_stream().await,
            Err(MuxError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_data_beyond_window_is_protocol_error() {
        let config = MuxConfig {
            stream_window: 16 * 1024,
            ..config()
        };
        let (session, _reader, mut writer) = raw_peer(&config).await;
        writer.write_frame(&Frame::Open(2)).await.unwrap();
        let chunk = Bytes::from(vec![0u8; 16 * 1024]);
        writer.write_frame(&Frame::Data(2, chunk.clone())).await.unwrap();
        writer.write_frame(&Frame::Data(2, chunk)).await.unwrap();
        writer.flush().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (_session, mut reader, mut writer) = raw_peer(&config()).await;
        writer.write_frame(&Frame::Ping(99)).await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap(), Frame::Pong(99));
    }

    #[tokio::test]
    async fn test_local_close_sends_session_close() {
        let (session, mut reader, _writer) = raw_peer(&config()).await;
        session.close();
        assert_eq!(reader.read_frame().await.unwrap(), Frame::SessionClose);
    }

    #[tokio::test]
    async fn test_keepalive_timeout_closes_session() {
        let config = MuxConfig {
            keepalive_interval: 1,
            keepalive_timeout: 2,
            ..Default::default()
        };
        // The raw peer never answers pings
        let (session, _reader, _writer) = raw_peer(&config).await;
        tokio::time::timeout(Duration::from_secs(6), session.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_opens_get_unique_ids() {
        let (client, server) = session_pair(&config()).await;
        let client = Arc::new(client);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                client.open_stream().await.unwrap()
            }));
        }
        let mut streams = Vec::new();
        for handle in handles {
            streams.push(handle.await.unwrap());
        }
        let mut ids: Vec<_> = streams.iter().map(|s| s.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 32);
        assert!(ids.iter().all(|id| id % 2 == 1));

        for _ in 0..32 {
            server.accept_stream().await.unwrap();
        }
    }

    fn shared_at(side: Side, next_id: StreamId) -> Shared {
        let (data_tx, _data_rx) = mpsc::channel(1);
        let (ctrl_tx, _ctrl_rx) = mpsc::unbounded_channel();
        Shared {
            side,
            window: 1024,
            peer_window: 1024,
            next_id: AtomicU64::new(u64::from(next_id)),
            streams: Mutex::new(HashMap::new()),
            data_tx,
            ctrl_tx,
            closed: AtomicBool::new(false),
            local_close: AtomicBool::new(false),
            token: CancellationToken::new(),
        }
    }

    #[test]
    fn test_allocate_id_exhaustion() {
        let shared = shared_at(Side::Initiator, u32::MAX - 2);
        assert_eq!(shared.allocate_id().unwrap(), u32::MAX - 2);
        // The highest odd id is still handed out
        assert_eq!(shared.allocate_id().unwrap(), u32::MAX);
        assert!(matches!(
            shared.allocate_id(),
            Err(MuxError::StreamIdsExhausted)
        ));
        // Exhaustion is sticky
        assert!(matches!(
            shared.allocate_id(),
            Err(MuxError::StreamIdsExhausted)
        ));
    }

    #[test]
    fn test_allocate_id_exhaustion_acceptor() {
        let shared = shared_at(Side::Acceptor, u32::MAX - 1);
        assert_eq!(shared.allocate_id().unwrap(), u32::MAX - 1);
        assert!(matches!(
            shared.allocate_id(),
            Err(MuxError::StreamIdsExhausted)
        ));
    }
}
