//! One forwarded connection: a local stream, a remote stream, two pumps.
//!
//! Each stream is split. The read halves belong to the pumps; the write
//! halves live in the [`Session`] so that teardown can close both streams no
//! matter which pump (or which failure) triggers it.
//!
//! ```text
//! local  ──read──▶ pump(LocalToRemote) ──write──▶ remote
//! remote ──read──▶ pump(RemoteToLocal) ──write──▶ local
//! ```
//!
//! Teardown moves the session from `Open` to `Closed` under a lock, fires the
//! session token (which unblocks the sibling pump), then shuts down both
//! write halves. Every call after the first is a no-op.

use crate::rules::ForwardingRule;
use crate::stream::BoxedStream;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bytes requested per read by a pump.
pub const PUMP_BUFFER_SIZE: usize = 65535;

type Reader = ReadHalf<BoxedStream>;
type Writer = WriteHalf<BoxedStream>;

/// Which end of the session a stream is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => f.write_str("local"),
            Side::Remote => f.write_str("remote"),
        }
    }
}

/// Direction a pump relays bytes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl Direction {
    pub fn sink(self) -> Side {
        match self {
            Direction::LocalToRemote => Side::Remote,
            Direction::RemoteToLocal => Side::Local,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::LocalToRemote => f.write_str("local->remote"),
            Direction::RemoteToLocal => f.write_str("remote->local"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Closed,
}

/// Why a pump stopped.
#[derive(Debug)]
enum PumpEnd {
    Eof,
    Closed,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
}

/// Shared state of one forwarded connection.
pub struct Session {
    rule: Arc<ForwardingRule>,
    state: Mutex<SessionState>,
    /// Fired when teardown starts, to stop both pumps. Not tied to the
    /// tunnel's token: shutting the tunnel down leaves running transfers alone.
    closing: CancellationToken,
    /// Fired once both streams have been shut down.
    closed: CancellationToken,
    local_writer: tokio::sync::Mutex<Option<Writer>>,
    remote_writer: tokio::sync::Mutex<Option<Writer>>,
    sent: AtomicU64,
    received: AtomicU64,
}

impl Session {
    /// Split both streams and build the session around their write halves.
    ///
    /// Returns the session plus the local and remote read halves, in that
    /// order. Use [`Session::start`] to also launch the pumps.
    pub fn new(
        rule: Arc<ForwardingRule>,
        local: BoxedStream,
        remote: BoxedStream,
    ) -> (Arc<Self>, Reader, Reader) {
        let (local_reader, local_writer) = tokio::io::split(local);
        let (remote_reader, remote_writer) = tokio::io::split(remote);
        let session = Arc::new(Self {
            rule,
            state: Mutex::new(SessionState::Open),
            closing: CancellationToken::new(),
            closed: CancellationToken::new(),
            local_writer: tokio::sync::Mutex::new(Some(local_writer)),
            remote_writer: tokio::sync::Mutex::new(Some(remote_writer)),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
        });
        (session, local_reader, remote_reader)
    }

    /// Build the session and spawn both pumps. Not joined by anyone.
    pub fn start(rule: Arc<ForwardingRule>, local: BoxedStream, remote: BoxedStream) -> Arc<Self> {
        let (session, local_reader, remote_reader) = Self::new(rule, local, remote);
        tokio::spawn(copy_pump(session.clone(), Direction::LocalToRemote, local_reader));
        tokio::spawn(copy_pump(session.clone(), Direction::RemoteToLocal, remote_reader));
        session
    }

    pub fn is_closed(&self) -> bool {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) == SessionState::Closed
    }

    /// Wait until teardown has closed both streams.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Bytes relayed local->remote and remote->local so far.
    pub fn transferred(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.received.load(Ordering::Relaxed),
        )
    }

    /// Close both streams. Only the first call does anything; it returns
    /// `true`, every later call returns `false` straight away.
    pub async fn teardown(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == SessionState::Closed {
                return false;
            }
            *state = SessionState::Closed;
        }
        self.closing.cancel();

        self.close_side(Side::Local).await;
        self.close_side(Side::Remote).await;
        self.closed.cancel();

        let (sent, received) = self.transferred();
        debug!(rule = %self.rule, sent, received, "connection closed");
        true
    }

    async fn close_side(&self, side: Side) {
        let writer = self.writer(side).lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                warn!(rule = %self.rule, %side, error = %e, "failed to close stream");
            }
        }
    }

    fn writer(&self, side: Side) -> &tokio::sync::Mutex<Option<Writer>> {
        match side {
            Side::Local => &self.local_writer,
            Side::Remote => &self.remote_writer,
        }
    }

    /// Write all of `data` to one side, giving up as soon as the session closes.
    async fn write(&self, side: Side, data: &[u8]) -> io::Result<()> {
        let mut guard = tokio::select! {
            biased;
            _ = self.closing.cancelled() => return Err(session_closed()),
            guard = self.writer(side).lock() => guard,
        };
        let writer = guard.as_mut().ok_or_else(session_closed)?;
        tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(session_closed()),
            result = writer.write_all(data) => result,
        }
    }

    fn record(&self, direction: Direction, n: usize) {
        let counter = match direction {
            Direction::LocalToRemote => &self.sent,
            Direction::RemoteToLocal => &self.received,
        };
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

fn session_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "session closed")
}

/// Relay bytes from `reader` to the opposite side of `session` until EOF,
/// an error, or teardown; then tear the session down.
pub async fn copy_pump(session: Arc<Session>, direction: Direction, mut reader: Reader) {
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];

    let end = loop {
        let n = tokio::select! {
            biased;
            _ = session.closing.cancelled() => break PumpEnd::Closed,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break PumpEnd::Eof,
                Ok(n) => n,
                Err(e) => break PumpEnd::ReadFailed(e),
            },
        };
        if let Err(e) = session.write(direction.sink(), &buf[..n]).await {
            break if session.is_closed() {
                PumpEnd::Closed
            } else {
                PumpEnd::WriteFailed(e)
            };
        }
        session.record(direction, n);
    };

    match &end {
        PumpEnd::Eof => debug!(rule = %session.rule, %direction, "end of stream"),
        PumpEnd::Closed => debug!(rule = %session.rule, %direction, "peer pump closed session"),
        PumpEnd::ReadFailed(e) if !session.is_closed() => {
            warn!(rule = %session.rule, %direction, error = %e, "failed to read")
        }
        PumpEnd::ReadFailed(_) => {}
        PumpEnd::WriteFailed(e) => {
            warn!(rule = %session.rule, %direction, error = %e, "failed to write")
        }
    }

    session.teardown().await;
}
