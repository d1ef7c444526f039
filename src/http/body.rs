//! Request body streaming.
//!
//! The connection owns the read half of the transport and a single receive
//! buffer. Bytes past the current request's body (a pipelined next request)
//! stay in that buffer for the parser.

use std::io;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::debug;

use crate::config::MinDataRate;
use crate::error::BodyError;
use crate::http::abort::{AbortReason, AbortSignal};
use crate::http::adapter::BoxedTransport;
use crate::http::chunked::{ChunkedDecoder, Decoded};
use crate::http::connection::ConnectionShared;
use crate::http::headers::Headers;
use crate::http::parser::ParseError;
use crate::http::request::{BodyFraming, RequestHead};
use crate::http::response::StatusCode;
use crate::http::writer;

const READ_CHUNK: usize = 4096;

pub(crate) enum Fill {
    Data(usize),
    Eof,
    Aborted(AbortReason),
}

enum BodyDecoder {
    /// No body, or the declared body has been fully read.
    Done,
    Length(u64),
    Chunked(ChunkedDecoder),
    /// Raw pass-through after `101 Switching Protocols`.
    Upgraded,
}

/// Read side of a connection.
pub(crate) struct Input {
    reader: ReadHalf<BoxedTransport>,
    pub(crate) buf: BytesMut,
    eof: bool,
    body: BodyDecoder,
    consumed: u64,
    max_body_size: Option<u64>,
    /// A `100 Continue` is owed before the first body read.
    continue_pending: bool,
}

impl Input {
    pub(crate) fn new(reader: ReadHalf<BoxedTransport>) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
            eof: false,
            body: BodyDecoder::Done,
            consumed: 0,
            max_body_size: None,
            continue_pending: false,
        }
    }

    /// Reads more bytes from the transport into the receive buffer, giving
    /// up as soon as the connection is aborted.
    pub(crate) async fn fill(&mut self, abort: &AbortSignal) -> io::Result<Fill> {
        if self.eof {
            return Ok(Fill::Eof);
        }
        self.buf.reserve(READ_CHUNK);
        tokio::select! {
            biased;
            reason = abort.aborted() => Ok(Fill::Aborted(reason)),
            n = self.reader.read_buf(&mut self.buf) => match n? {
                0 => {
                    self.eof = true;
                    Ok(Fill::Eof)
                }
                n => Ok(Fill::Data(n)),
            },
        }
    }

    pub(crate) fn begin_body(&mut self, head: &RequestHead, max_body_size: Option<u64>) {
        self.body = match head.framing {
            BodyFraming::None | BodyFraming::ContentLength(0) => BodyDecoder::Done,
            BodyFraming::ContentLength(n) => BodyDecoder::Length(n),
            BodyFraming::Chunked => BodyDecoder::Chunked(ChunkedDecoder::new()),
        };
        self.consumed = 0;
        self.max_body_size = max_body_size;
        self.continue_pending = head.expect_continue && head.has_body();
    }

    pub(crate) fn begin_upgraded(&mut self) {
        self.body = BodyDecoder::Upgraded;
        self.continue_pending = false;
    }

    pub(crate) fn is_complete(&self) -> bool {
        match &self.body {
            BodyDecoder::Done => true,
            BodyDecoder::Length(_) | BodyDecoder::Upgraded => false,
            BodyDecoder::Chunked(decoder) => decoder.is_done(),
        }
    }

    /// The client asked for `100 Continue` and never got it, so it may not
    /// have sent the body at all.
    pub(crate) fn continue_pending(&self) -> bool {
        self.continue_pending
    }

    pub(crate) fn trailers(&self) -> Option<&Headers> {
        match &self.body {
            BodyDecoder::Chunked(decoder) if decoder.is_done() => Some(decoder.trailers()),
            _ => None,
        }
    }

    /// Decodes buffered body bytes into `out`. `None` means more input is
    /// needed; `Some(0)` is the end of the body.
    fn decode(&mut self, out: &mut [u8]) -> Result<Option<usize>, ParseError> {
        match &mut self.body {
            BodyDecoder::Done => Ok(Some(0)),
            BodyDecoder::Length(remaining) => {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let n = (*remaining).min(self.buf.len() as u64).min(out.len() as u64) as usize;
                out[..n].copy_from_slice(&self.buf[..n]);
                self.buf.advance(n);
                *remaining -= n as u64;
                if *remaining == 0 {
                    self.body = BodyDecoder::Done;
                }
                Ok(Some(n))
            }
            BodyDecoder::Chunked(decoder) => match decoder.decode(&mut self.buf, out.len())? {
                Decoded::Data(data) => {
                    out[..data.len()].copy_from_slice(&data);
                    Ok(Some(data.len()))
                }
                Decoded::NeedMore => Ok(None),
                Decoded::Done => Ok(Some(0)),
            },
            BodyDecoder::Upgraded => {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let n = self.buf.len().min(out.len());
                out[..n].copy_from_slice(&self.buf[..n]);
                self.buf.advance(n);
                Ok(Some(n))
            }
        }
    }

    /// Reads the next piece of the request body. Malformed framing rejects
    /// the request and aborts the connection.
    pub(crate) async fn read_body(
        &mut self,
        conn: &ConnectionShared,
        out: &mut [u8],
    ) -> Result<usize, BodyError> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(reason) = conn.abort.reason() {
                return Err(BodyError::from_abort(reason));
            }

            match self.decode(out) {
                Ok(Some(n)) => {
                    // body bytes arrived without waiting for 100 Continue
                    self.continue_pending = false;
                    self.consumed += n as u64;
                    if self.max_body_size.is_some_and(|max| self.consumed > max) {
                        debug!(connection_id = %conn.id, "bad request data: request body too large");
                        conn.reject(StatusCode::PAYLOAD_TOO_LARGE);
                        return Err(BodyError::TooLarge);
                    }
                    return Ok(n);
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(connection_id = %conn.id, error = %e, "bad request data");
                    conn.reject(e.status_code());
                    return Err(BodyError::BadRequest(e));
                }
            }

            if self.continue_pending {
                self.continue_pending = false;
                writer::send_continue(conn).await;
            }

            conn.timeouts.resume_read_timing();
            let filled = self.fill(&conn.abort).await;
            conn.timeouts.pause_read_timing();

            match filled {
                Ok(Fill::Data(n)) => conn.timeouts.bytes_read(n),
                Ok(Fill::Eof) => {
                    if let BodyDecoder::Upgraded = self.body {
                        return Ok(0);
                    }
                    debug!(connection_id = %conn.id, "bad request data: unexpected end of request content");
                    conn.reject(StatusCode::BAD_REQUEST);
                    return Err(BodyError::UnexpectedEof);
                }
                Ok(Fill::Aborted(reason)) => return Err(BodyError::from_abort(reason)),
                Err(e) => {
                    debug!(connection_id = %conn.id, error = %e, "connection reset while reading request body");
                    conn.abort.abort(AbortReason::ConnectionReset);
                    return Err(BodyError::ConnectionReset);
                }
            }
        }
    }
}

/// The handle a multi-threaded runtime needs for blocking calls, if we are
/// running on one.
pub(crate) fn blocking_handle() -> Option<Handle> {
    let handle = Handle::try_current().ok()?;
    (handle.runtime_flavor() == RuntimeFlavor::MultiThread).then_some(handle)
}

/// The body of one request.
///
/// Reads after the exchange is over return end-of-body.
pub struct RequestBody {
    conn: Arc<ConnectionShared>,
    seq: u64,
}

impl RequestBody {
    pub(crate) fn new(conn: Arc<ConnectionShared>, seq: u64) -> Self {
        Self { conn, seq }
    }

    fn is_current(&self) -> bool {
        self.conn.exchange().seq == self.seq
    }

    /// Reads body bytes into `buf`, returning 0 at the end of the body.
    ///
    /// The first read of a request that sent `Expect: 100-continue` sends
    /// the interim `100 Continue` response.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, BodyError> {
        let mut input = self.conn.input.lock().await;
        if !self.is_current() {
            return Ok(0);
        }
        input.read_body(&self.conn, buf).await
    }

    /// Reads the rest of the body into memory.
    pub async fn read_to_end(&mut self) -> Result<Bytes, BodyError> {
        let mut body = BytesMut::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(body.freeze());
            }
            body.extend_from_slice(&chunk[..n]);
        }
    }

    /// Blocking variant of [`RequestBody::read`]. Fails unless synchronous
    /// I/O is allowed; needs the multi-threaded runtime.
    pub fn read_sync(&mut self, buf: &mut [u8]) -> Result<usize, BodyError> {
        if !self.conn.allow_sync_io() {
            return Err(BodyError::SynchronousIoDisallowed);
        }
        let handle = blocking_handle().ok_or(BodyError::SynchronousIoDisallowed)?;
        tokio::task::block_in_place(|| handle.block_on(self.read(buf)))
    }

    /// Trailer fields of a chunked body, once the body has been read to the
    /// end.
    pub async fn trailers(&self) -> Option<Headers> {
        let input = self.conn.input.lock().await;
        if !self.is_current() {
            return None;
        }
        input.trailers().cloned()
    }

    pub async fn is_complete(&self) -> bool {
        let input = self.conn.input.lock().await;
        !self.is_current() || input.is_complete()
    }

    pub(crate) fn set_min_data_rate(&self, rate: Option<MinDataRate>) {
        if self.is_current() {
            self.conn.timeouts.set_read_rate(rate);
        }
    }

    pub(crate) fn set_allow_synchronous_io(&self, allow: bool) {
        if self.is_current() {
            self.conn.set_allow_sync_io(allow);
        }
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBody")
            .field("connection_id", &self.conn.id)
            .field("request_id", &self.seq)
            .finish()
    }
}
