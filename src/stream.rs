//! The stream handed back once a tunnel is established.
//!
//! [`TunnelStream`] wraps the negotiated socket. It replays any bytes the
//! handshake read past the proxy's response, and applies the read/write
//! timeout from the [`Settings`][crate::Settings] to each I/O operation: a read
//! or write that makes no progress for that long fails with
//! [`io::ErrorKind::TimedOut`].

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};

use crate::info::TunnelInfo;

/// How late an expired timer may be observed and still count against the
/// operation polling it.
///
/// A pending operation is woken by its timer at the deadline. A timer whose
/// deadline passed long before the stream was polled again was left behind
/// by an operation that was dropped while pending.
const TIMER_GRACE: Duration = Duration::from_millis(25);

/// A bidirectional byte stream to the destination.
///
/// Dropping the stream closes the socket.
#[pin_project]
pub struct TunnelStream {
    #[pin]
    inner: TcpStream,
    prefix: Option<Bytes>,
    info: TunnelInfo,
    timeout: Option<Duration>,
    read_timer: Option<Pin<Box<Sleep>>>,
    write_timer: Option<Pin<Box<Sleep>>>,
}

impl fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelStream")
            .field("info", &self.info)
            .field("timeout", &self.timeout)
            .field("buffered", &self.prefix.as_ref().map_or(0, Bytes::len))
            .finish()
    }
}

impl TunnelStream {
    pub(crate) fn new(
        inner: TcpStream,
        prefix: Bytes,
        info: TunnelInfo,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner,
            prefix: (!prefix.is_empty()).then_some(prefix),
            info,
            timeout,
            read_timer: None,
            write_timer: None,
        }
    }

    /// Addresses of the tunnel.
    pub fn info(&self) -> &TunnelInfo {
        &self.info
    }

    /// The read/write timeout applied to this stream.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Borrow the underlying socket.
    pub fn get_ref(&self) -> &TcpStream {
        &self.inner
    }

    /// Release the socket, along with any buffered bytes not yet read.
    ///
    /// The buffered bytes were received from the destination before the
    /// socket and must be consumed first.
    pub fn into_parts(self) -> (TcpStream, Bytes) {
        (self.inner, self.prefix.unwrap_or_default())
    }
}

fn poll_timer(
    timer: &mut Option<Pin<Box<Sleep>>>,
    timeout: Option<Duration>,
    cx: &mut Context<'_>,
) -> Poll<io::Error> {
    let Some(timeout) = timeout else {
        return Poll::Pending;
    };

    let now = Instant::now();
    let sleep = timer.get_or_insert_with(|| Box::pin(tokio::time::sleep_until(now + timeout)));
    if sleep.deadline() + TIMER_GRACE < now {
        tracing::trace!("restarting i/o timer left by an abandoned operation");
        sleep.as_mut().reset(now + timeout);
    }

    match sleep.as_mut().poll(cx) {
        Poll::Ready(()) => {
            *timer = None;
            tracing::trace!(?timeout, "tunnel stream i/o timed out");
            Poll::Ready(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no progress after {}ms", timeout.as_millis()),
            ))
        }
        Poll::Pending => Poll::Pending,
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();

        if let Some(mut prefix) = this.prefix.take() {
            let n = std::cmp::min(prefix.len(), buf.remaining());
            buf.put_slice(&prefix[..n]);
            prefix.advance(n);
            if !prefix.is_empty() {
                *this.prefix = Some(prefix);
            }
            return Poll::Ready(Ok(()));
        }

        match this.inner.poll_read(cx, buf) {
            Poll::Ready(result) => {
                *this.read_timer = None;
                Poll::Ready(result)
            }
            Poll::Pending => poll_timer(this.read_timer, *this.timeout, cx).map(Err),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(result) => {
                *this.write_timer = None;
                Poll::Ready(result)
            }
            Poll::Pending => poll_timer(this.write_timer, *this.timeout, cx).map(Err),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.inner.poll_write_vectored(cx, bufs) {
            Poll::Ready(result) => {
                *this.write_timer = None;
                Poll::Ready(result)
            }
            Poll::Pending => poll_timer(this.write_timer, *this.timeout, cx).map(Err),
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_shutdown(cx) {
            Poll::Ready(result) => {
                *this.write_timer = None;
                Poll::Ready(result)
            }
            Poll::Pending => poll_timer(this.write_timer, *this.timeout, cx).map(Err),
        }
    }
}
