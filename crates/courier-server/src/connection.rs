//! Per-socket connection handling.
//!
//! Each accepted socket gets one [`ConnectionHandler`] task that reads,
//! frames and dispatches sequentially, plus a writer task draining the
//! connection's [`Outbox`]. The writer is the only code that touches the
//! socket's write half; everyone else (dispatcher replies, relayed
//! messages from other connections) goes through the outbox.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use courier_shared::constants::FRAME_DELIMITER;
use courier_shared::protocol::ServerFrame;
use courier_shared::types::{ConnectionId, UserId};

use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::registry::SessionRegistry;

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 8192;

/// Frames that may wait in one connection's outbox. A peer that falls this
/// far behind is disconnected.
pub const OUTBOX_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

/// Closing state shared by a connection's reader, writer and outboxes.
///
/// `closing` alone is a graceful close: queued frames are still written.
/// An abort additionally wakes the reader and the writer so both stop
/// immediately.
#[derive(Debug, Clone)]
struct CloseSignal {
    closing: Arc<AtomicBool>,
    aborted: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    fn new() -> Self {
        let (aborted, _) = watch::channel(false);
        Self {
            closing: Arc::new(AtomicBool::new(false)),
            aborted: Arc::new(aborted),
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn mark_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }

    fn abort(&self) {
        self.closing.store(true, Ordering::Release);
        self.aborted.send_replace(true);
    }

    /// Resolves once [`abort`](Self::abort) has been called, even if that
    /// happened before this future was created.
    async fn aborted(&self) {
        let mut rx = self.aborted.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Write handle for one connection.
///
/// Cheap to clone. Holding an outbox never keeps the socket open: once the
/// connection starts closing, every send is refused.
#[derive(Debug, Clone)]
pub struct Outbox {
    conn_id: ConnectionId,
    tx: mpsc::Sender<ServerFrame>,
    signal: CloseSignal,
}

impl Outbox {
    pub fn new(conn_id: ConnectionId) -> (Self, mpsc::Receiver<ServerFrame>) {
        Self::with_capacity(conn_id, OUTBOX_CAPACITY)
    }

    pub fn with_capacity(
        conn_id: ConnectionId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let outbox = Self {
            conn_id,
            tx,
            signal: CloseSignal::new(),
        };
        (outbox, rx)
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    /// Queue a frame for the writer. Returns `false` if the connection is
    /// closing or already gone; the frame is dropped in that case.
    ///
    /// A full outbox aborts the connection.
    pub fn send(&self, frame: ServerFrame) -> bool {
        if self.is_closing() {
            return false;
        }
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = %self.conn_id, "outbox full, disconnecting slow peer");
                self.signal.abort();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.signal.is_closing()
    }

    /// Flip the closing flag. Returns `true` for the caller that flipped it.
    pub fn mark_closing(&self) -> bool {
        self.signal.mark_closing()
    }

    /// Resolves once the connection has been aborted.
    pub async fn aborted(&self) {
        self.signal.aborted().await
    }
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated { user_id: UserId, username: String },
}

/// Protocol state of one connection, owned by its handler task.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub auth: AuthState,
    pub outbox: Outbox,
}

impl Connection {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            id: outbox.conn_id(),
            auth: AuthState::Unauthenticated,
            outbox,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        match &self.auth {
            AuthState::Authenticated { user_id, .. } => Some(*user_id),
            AuthState::Unauthenticated => None,
        }
    }

    pub fn authenticate(&mut self, user_id: UserId, username: String) {
        self.auth = AuthState::Authenticated { user_id, username };
    }

    pub fn send(&self, frame: ServerFrame) {
        if !self.outbox.send(frame) {
            debug!(conn = %self.id, "dropping frame for closing connection");
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Accumulates raw bytes and yields complete `\n`-terminated frames.
///
/// Partial frames stay buffered until their terminator arrives; several
/// frames arriving in one read come out one by one. Empty (or
/// whitespace-only) frames are skipped.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_frame_size,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Strip and return the next complete frame, without its terminator.
    ///
    /// Fails once a frame (complete or still partial) grows past the
    /// configured maximum; the connection cannot resynchronise after that.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ServerError> {
        loop {
            let Some(pos) = self.buf.iter().position(|b| *b == FRAME_DELIMITER) else {
                if self.buf.len() > self.max_frame_size {
                    return Err(self.too_large(self.buf.len()));
                }
                return Ok(None);
            };

            let mut frame = self.buf.split_to(pos + 1);
            frame.truncate(pos);

            if frame.len() > self.max_frame_size {
                return Err(self.too_large(frame.len()));
            }
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(frame.freeze()));
        }
    }

    fn too_large(&self, size: usize) -> ServerError {
        ServerError::FrameTooLarge {
            size,
            max: self.max_frame_size,
        }
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub struct ConnectionHandler {
    id: ConnectionId,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    registry: SessionRegistry,
    max_frame_size: usize,
}

impl ConnectionHandler {
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        registry: SessionRegistry,
        max_frame_size: usize,
    ) -> Self {
        Self {
            id,
            peer,
            dispatcher,
            registry,
            max_frame_size,
        }
    }

    /// Read and dispatch frames until the peer goes away, a write fails,
    /// the outbox overflows or the peer sends an oversized frame, then
    /// close.
    pub async fn run<R, W>(self, mut reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Self {
            id,
            peer,
            dispatcher,
            registry,
            max_frame_size,
        } = self;

        let (outbox, rx) = Outbox::new(id);
        tokio::spawn(write_loop(id, writer, rx, outbox.signal.clone()));

        let mut conn = Connection::new(outbox);
        let mut frames = FrameBuffer::new(max_frame_size);
        let mut chunk = [0u8; READ_CHUNK];

        debug!(conn = %id, peer = %peer, "connection started");

        'read: loop {
            let n = tokio::select! {
                result = reader.read(&mut chunk) => match result {
                    Ok(0) => {
                        debug!(conn = %id, "peer closed connection");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(conn = %id, error = %e, "read error");
                        break;
                    }
                },
                _ = conn.outbox.aborted() => break,
            };

            frames.extend(&chunk[..n]);
            loop {
                match frames.next_frame() {
                    Ok(Some(frame)) => dispatcher.handle(&frame, &mut conn).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(conn = %id, peer = %peer, error = %e, "closing connection");
                        conn.send(ServerFrame::error(e.client_message()));
                        break 'read;
                    }
                }
            }

            if conn.outbox.is_closing() {
                break;
            }
        }

        close(conn, &registry).await;
        info!(conn = %id, peer = %peer, "connection closed");
    }
}

/// Tear down the protocol side of a connection. Idempotent.
///
/// Already-queued frames are still written unless the connection was
/// aborted; the writer shuts the socket down once the queue drains.
async fn close(conn: Connection, registry: &SessionRegistry) {
    if !conn.outbox.mark_closing() {
        debug!(conn = %conn.id, "connection already closing");
    }
    if let Some(user_id) = conn.user_id() {
        if registry.release(user_id, conn.id).await {
            info!(conn = %conn.id, user_id = %user_id, "session released");
        }
    }
}

async fn write_loop<W>(
    id: ConnectionId,
    mut writer: W,
    mut rx: mpsc::Receiver<ServerFrame>,
    signal: CloseSignal,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = signal.aborted() => return,
        };

        let line = match frame.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(conn = %id, error = %e, "failed to serialize frame");
                continue;
            }
        };

        let written = tokio::select! {
            result = writer.write_all(line.as_bytes()) => result,
            _ = signal.aborted() => return,
        };
        if let Err(e) = written {
            debug!(conn = %id, error = %e, "write error, closing connection");
            signal.abort();
            return;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(conn = %id, error = %e, "socket shutdown failed");
    }
}
