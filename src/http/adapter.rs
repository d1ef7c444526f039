//! Byte-stream transports and per-connection stream adapters.
//!
//! The engine only needs a duplex byte stream. Anything that implements
//! tokio's `AsyncRead + AsyncWrite` qualifies: a `TcpStream`, one end of a
//! `tokio::io::duplex` pair, or a TLS stream built elsewhere. Adapters wrap
//! that stream at accept time, in registration order, before the engine
//! sees a single byte.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use crate::http::connection::ConnectionId;

pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// A transform applied to every accepted stream.
pub trait ConnectionAdapter: Send + Sync + 'static {
    fn wrap(&self, id: ConnectionId, stream: BoxedTransport) -> BoxedTransport;
}

/// Traces the size of every read and write passing through the stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingAdapter;

impl ConnectionAdapter for LoggingAdapter {
    fn wrap(&self, id: ConnectionId, stream: BoxedTransport) -> BoxedTransport {
        Box::new(LoggingStream { id, inner: stream })
    }
}

struct LoggingStream {
    id: ConnectionId,
    inner: BoxedTransport,
}

impl AsyncRead for LoggingStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = buf.filled().len() - before;
            trace!(connection_id = %self.id, bytes = n, "read");
        }
        poll
    }
}

impl AsyncWrite for LoggingStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, data);
        if let Poll::Ready(Ok(n)) = &poll {
            trace!(connection_id = %self.id, bytes = *n, "write");
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let poll = Pin::new(&mut self.inner).poll_shutdown(cx);
        if let Poll::Ready(Ok(())) = &poll {
            trace!(connection_id = %self.id, "shutdown");
        }
        poll
    }
}
