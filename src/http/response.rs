use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, MutexGuard};

use tracing::{debug, error};

use crate::error::ResponseError;
use crate::http::abort::AbortReason;
use crate::http::connection::ConnectionShared;
use crate::http::headers::Headers;
use crate::http::request::{Method, RequestHead, Version};
use crate::http::upgrade::{self, Upgraded};
use crate::http::writer::{self, ResponseFraming};

/// An HTTP status code.
///
/// Any three-digit code can be sent; the associated constants cover the ones
/// the engine itself produces plus the common application codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const CONTINUE: StatusCode = StatusCode(100);
    pub const SWITCHING_PROTOCOLS: StatusCode = StatusCode(101);
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const RESET_CONTENT: StatusCode = StatusCode(205);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
    pub const URI_TOO_LONG: StatusCode = StatusCode(414);
    pub const REQUEST_HEADER_FIELDS_TOO_LARGE: StatusCode = StatusCode(431);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const HTTP_VERSION_NOT_SUPPORTED: StatusCode = StatusCode(505);

    /// Accepts any code in `100..=999`.
    ///
    /// ```
    /// # use sentinel_h1::http::response::StatusCode;
    /// assert_eq!(StatusCode::from_u16(404), Some(StatusCode::NOT_FOUND));
    /// assert_eq!(StatusCode::from_u16(42), None);
    /// ```
    pub const fn from_u16(code: u16) -> Option<Self> {
        if code >= 100 && code <= 999 {
            Some(StatusCode(code))
        } else {
            None
        }
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns the standard HTTP reason phrase for this status code, or an
    /// empty string for codes without one.
    ///
    /// ```
    /// # use sentinel_h1::http::response::StatusCode;
    /// assert_eq!(StatusCode::OK.reason_phrase(), "OK");
    /// assert_eq!(StatusCode::REQUEST_TIMEOUT.reason_phrase(), "Request Timeout");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            205 => "Reset Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            409 => "Conflict",
            411 => "Length Required",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            415 => "Unsupported Media Type",
            417 => "Expectation Failed",
            426 => "Upgrade Required",
            429 => "Too Many Requests",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => "",
        }
    }

    /// 1xx, 204, 205 and 304 responses never carry a body.
    pub fn allows_body(&self) -> bool {
        !(self.0 < 200 || matches!(self.0, 204 | 205 | 304))
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<StatusCode> for u16 {
    fn from(status: StatusCode) -> u16 {
        status.0
    }
}

/// Status and headers of a response that has not started yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: Headers,
}

pub(crate) type OnStarting = Box<dyn FnOnce(&mut ResponseHead) -> anyhow::Result<()> + Send>;
pub(crate) type OnCompleted = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    NotStarted,
    Started,
    Completed,
}

/// Everything the connection tracks about the response of the current
/// exchange. Reset, not reallocated, at the start of every request.
pub(crate) struct ExchangeState {
    pub(crate) seq: u64,
    pub(crate) head: ResponseHead,
    /// The connection's own header list while a handler-supplied one is in use.
    pooled: Option<Headers>,
    pub(crate) phase: Phase,
    pub(crate) version: Version,
    pub(crate) is_head: bool,
    pub(crate) upgradable: bool,
    pub(crate) keep_alive: bool,
    pub(crate) framing: Option<ResponseFraming>,
    pub(crate) bytes_written: u64,
    pub(crate) head_suppressed: u64,
    /// Some byte of this response was handed to the transport.
    pub(crate) wire_started: bool,
    pub(crate) upgraded: bool,
    pub(crate) app_error: bool,
    pub(crate) framing_error: bool,
    /// Set when the request body turned out to be malformed.
    pub(crate) rejected: Option<StatusCode>,
    pub(crate) on_starting: Vec<OnStarting>,
    pub(crate) on_completed: Vec<OnCompleted>,
}

impl ExchangeState {
    pub(crate) fn new() -> Self {
        Self {
            seq: 0,
            head: ResponseHead {
                status: StatusCode::OK,
                headers: Headers::with_capacity(8),
            },
            pooled: None,
            phase: Phase::Completed,
            version: Version::Http11,
            is_head: false,
            upgradable: false,
            keep_alive: false,
            framing: None,
            bytes_written: 0,
            head_suppressed: 0,
            wire_started: false,
            upgraded: false,
            app_error: false,
            framing_error: false,
            rejected: None,
            on_starting: Vec::new(),
            on_completed: Vec::new(),
        }
    }

    pub(crate) fn reset(&mut self, seq: u64, request: &RequestHead) {
        if let Some(pooled) = self.pooled.take() {
            self.head.headers = pooled;
        }
        self.head.headers.clear();
        self.head.status = StatusCode::OK;
        self.seq = seq;
        self.phase = Phase::NotStarted;
        self.version = request.version;
        self.is_head = request.method == Method::HEAD;
        self.upgradable = request.is_upgrade_request();
        self.keep_alive = request.keep_alive();
        self.framing = None;
        self.bytes_written = 0;
        self.head_suppressed = 0;
        self.wire_started = false;
        self.upgraded = false;
        self.app_error = false;
        self.framing_error = false;
        self.rejected = None;
        self.on_starting.clear();
        self.on_completed.clear();
    }

    /// Swaps in `headers` for the rest of this response. The connection's
    /// own list comes back at the next [`ExchangeState::reset`].
    pub(crate) fn replace_headers(&mut self, headers: Headers) {
        let previous = std::mem::replace(&mut self.head.headers, headers);
        if self.pooled.is_none() {
            self.pooled = Some(previous);
        }
    }
}

/// Runs the OnCompleted callbacks of exchange `seq`, most recently
/// registered first. Failures are logged and never stop the remaining
/// callbacks.
pub(crate) fn run_on_completed(conn: &ConnectionShared, seq: u64) {
    let callbacks = {
        let mut ex = conn.exchange();
        if ex.seq != seq {
            return;
        }
        std::mem::take(&mut ex.on_completed)
    };

    for callback in callbacks.into_iter().rev() {
        match panic::catch_unwind(AssertUnwindSafe(callback)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                connection_id = %conn.id,
                request_id = seq,
                error = %format!("{e:#}"),
                "an OnCompleted callback failed"
            ),
            Err(_) => error!(
                connection_id = %conn.id,
                request_id = seq,
                "an OnCompleted callback panicked"
            ),
        }
    }
}

/// The response side of one exchange, handed to the handler.
///
/// Status and headers can be changed until the response starts, which
/// happens at the first write or flush. Writes are framed according to the
/// decision taken at that point; see the `writer` module.
pub struct Response {
    conn: Arc<ConnectionShared>,
    seq: u64,
}

impl Response {
    pub(crate) fn new(conn: Arc<ConnectionShared>, seq: u64) -> Self {
        Self { conn, seq }
    }

    fn current(&self) -> Result<MutexGuard<'_, ExchangeState>, ResponseError> {
        let ex = self.conn.exchange();
        if ex.seq != self.seq || ex.phase == Phase::Completed {
            return Err(ResponseError::Completed);
        }
        Ok(ex)
    }

    fn head_mut(&self) -> Result<MutexGuard<'_, ExchangeState>, ResponseError> {
        let ex = self.current()?;
        if ex.phase != Phase::NotStarted {
            return Err(ResponseError::HeadersReadOnly);
        }
        Ok(ex)
    }

    pub fn status(&self) -> StatusCode {
        self.conn.exchange().head.status
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<(), ResponseError> {
        self.head_mut()?.head.status = status;
        Ok(())
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.conn.exchange().head.headers.get(name).map(str::to_owned)
    }

    /// A snapshot of the current response headers.
    pub fn headers(&self) -> Headers {
        self.conn.exchange().head.headers.clone()
    }

    pub fn insert_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ResponseError> {
        let (name, value) = (name.into(), value.into());
        check_header(&name, &value)?;
        self.head_mut()?.head.headers.insert(name, value);
        Ok(())
    }

    pub fn append_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ResponseError> {
        let (name, value) = (name.into(), value.into());
        check_header(&name, &value)?;
        self.head_mut()?.head.headers.append(name, value);
        Ok(())
    }

    pub fn remove_header(&mut self, name: &str) -> Result<Option<String>, ResponseError> {
        Ok(self.head_mut()?.head.headers.remove(name))
    }

    /// Uses `headers` instead of the connection's header list for the rest
    /// of this response.
    pub fn replace_headers(&mut self, headers: Headers) -> Result<(), ResponseError> {
        for (name, value) in headers.iter() {
            check_header(name, value)?;
        }
        self.head_mut()?.replace_headers(headers);
        Ok(())
    }

    /// Sets or clears `Content-Length`.
    pub fn set_content_length(&mut self, len: Option<u64>) -> Result<(), ResponseError> {
        let mut ex = self.head_mut()?;
        match len {
            Some(len) => ex.head.headers.insert("Content-Length", len.to_string()),
            None => {
                ex.head.headers.remove("Content-Length");
            }
        }
        Ok(())
    }

    /// Registers a callback to run just before the head is serialized.
    /// Callbacks run most recently registered first and may still change
    /// status and headers.
    pub fn on_starting<F>(&mut self, callback: F) -> Result<(), ResponseError>
    where
        F: FnOnce(&mut ResponseHead) -> anyhow::Result<()> + Send + 'static,
    {
        self.head_mut()?.on_starting.push(Box::new(callback));
        Ok(())
    }

    /// Registers a callback to run once the exchange is over, however it
    /// ended. Callbacks run most recently registered first.
    pub fn on_completed<F>(&mut self, callback: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let mut ex = self.conn.exchange();
        if ex.seq == self.seq {
            ex.on_completed.push(Box::new(callback));
        }
    }

    pub fn has_started(&self) -> bool {
        let ex = self.conn.exchange();
        ex.seq != self.seq || ex.phase != Phase::NotStarted
    }

    /// Writes body bytes, starting the response first if needed.
    ///
    /// An empty `data` writes no body bytes but still flushes the head.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ResponseError> {
        self.current()?;
        if let Some(reason) = self.conn.abort.reason() {
            return Err(ResponseError::Aborted(reason));
        }

        let mut out = self.conn.output.lock().await;
        let framing = writer::start_response(&self.conn, &mut out, false)?;
        if !data.is_empty() {
            let mut ex = self.current()?;
            if ex.is_head {
                ex.head_suppressed += data.len() as u64;
            } else {
                if !ex.head.status.allows_body() {
                    return Err(ResponseError::BodyNotAllowed(ex.head.status));
                }
                let total = ex.bytes_written + data.len() as u64;
                if let ResponseFraming::ContentLength(declared) = framing {
                    if total > declared {
                        ex.framing_error = true;
                        ex.keep_alive = false;
                        error!(
                            connection_id = %self.conn.id,
                            request_id = self.seq,
                            "Response Content-Length mismatch: too many bytes written ({} of {}).",
                            total,
                            declared
                        );
                        return Err(ResponseError::TooManyBytes {
                            written: total,
                            expected: declared,
                        });
                    }
                }
                ex.bytes_written = total;
                writer::frame_body(framing, data, &mut out.pending);
            }
        }
        writer::flush_pending(&self.conn, &mut out).await
    }

    /// Blocking variant of [`Response::write`]. Fails unless synchronous I/O
    /// is allowed; needs the multi-threaded runtime.
    pub fn write_sync(&mut self, data: &[u8]) -> Result<(), ResponseError> {
        if !self.conn.allow_sync_io() {
            return Err(ResponseError::SynchronousIoDisallowed);
        }
        let handle = crate::http::body::blocking_handle()
            .ok_or(ResponseError::SynchronousIoDisallowed)?;
        tokio::task::block_in_place(|| handle.block_on(self.write(data)))
    }

    /// Starts the response if needed and pushes buffered bytes out.
    pub async fn flush(&mut self) -> Result<(), ResponseError> {
        self.write(&[]).await
    }

    /// Finishes the response now: the head is sent if it was not, and the
    /// chunked terminator is written when chunked framing is in use.
    pub async fn complete(&mut self) -> Result<(), ResponseError> {
        if self.conn.exchange().seq != self.seq {
            return Err(ResponseError::Completed);
        }
        if let Some(reason) = self.conn.abort.reason() {
            return Err(ResponseError::Aborted(reason));
        }
        writer::produce_end(&self.conn, self.seq, false).await;
        Ok(())
    }

    /// Sends `101 Switching Protocols` and turns the connection into a raw
    /// byte pipe. Only valid for requests carrying `Connection: upgrade`.
    pub async fn upgrade(self) -> Result<Upgraded, ResponseError> {
        upgrade::switch_protocols(self.conn, self.seq).await
    }

    /// Tears the connection down without sending anything further.
    pub fn abort(&self) {
        if self.conn.abort.abort(AbortReason::Application) {
            debug!(
                connection_id = %self.conn.id,
                request_id = self.seq,
                "connection aborted by application"
            );
        }
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("connection_id", &self.conn.id)
            .field("request_id", &self.seq)
            .finish()
    }
}

fn check_header(name: &str, value: &str) -> Result<(), ResponseError> {
    if name.eq_ignore_ascii_case("Content-Length") && value.trim().parse::<u64>().is_err() {
        return Err(ResponseError::InvalidContentLength);
    }
    Ok(())
}
