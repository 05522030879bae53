//! Byte streams handed between dialers, handlers and pumps.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};
use tracing::debug;

/// A bidirectional byte stream (a TCP socket, a proxied socket, a test duplex).
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// A stream with a fixed absolute read/write deadline.
///
/// Once the deadline passes every read, write and flush fails with
/// [`io::ErrorKind::TimedOut`]. Shutdown is never refused, so a connection
/// that hit its deadline can still be torn down.
///
/// Reads and writes keep separate timers: the two halves of a split stream
/// are polled from different tasks and a single timer only wakes the last
/// task that polled it.
pub struct DeadlineStream<S> {
    inner: S,
    read_timer: Pin<Box<Sleep>>,
    write_timer: Pin<Box<Sleep>>,
}

impl<S> DeadlineStream<S> {
    pub fn new(inner: S, deadline: Instant) -> Self {
        Self {
            inner,
            read_timer: Box::pin(tokio::time::sleep_until(deadline)),
            write_timer: Box::pin(tokio::time::sleep_until(deadline)),
        }
    }
}

fn poll_expired(timer: &mut Pin<Box<Sleep>>, cx: &mut Context<'_>) -> io::Result<()> {
    match timer.as_mut().poll(cx) {
        Poll::Ready(()) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "read/write deadline exceeded",
        )),
        Poll::Pending => Ok(()),
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        poll_expired(&mut this.read_timer, cx)?;
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        poll_expired(&mut this.write_timer, cx)?;
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        poll_expired(&mut this.write_timer, cx)?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Disable Nagle on a freshly connected or accepted socket. Failure only
/// costs latency, so it is logged and ignored.
pub(crate) fn set_nodelay(stream: &TcpStream, peer: &str) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer, error = %e, "failed to set TCP_NODELAY");
    }
}
