//! Response serialization and framing.
//!
//! The framing of a response is decided once, when it starts:
//!
//! - an application `Content-Length` is used as is and enforced,
//! - an application `Transfer-Encoding` is passed through untouched; if its
//!   final coding is not `chunked` the connection closes afterwards,
//! - a response that completes without a body gets `Content-Length: 0`,
//! - otherwise HTTP/1.1 gets `Transfer-Encoding: chunked` and HTTP/1.0 is
//!   delimited by closing the connection.

use std::io;
use std::time::{Duration, SystemTime};

use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tracing::{debug, error};

use crate::config::Config;
use crate::error::ResponseError;
use crate::http::abort::{AbortReason, AbortSignal};
use crate::http::adapter::BoxedTransport;
use crate::http::chunked::{LAST_CHUNK, encode_chunk};
use crate::http::connection::ConnectionShared;
use crate::http::headers::Headers;
use crate::http::request::Version;
use crate::http::response::{Phase, StatusCode};
use crate::http::timeout::{TimeoutControl, TimeoutReason};

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Upper bound for writes the engine makes on its own behalf (error
/// responses) after the connection is already failing.
const FINAL_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseFraming {
    ContentLength(u64),
    /// Automatic chunked encoding.
    Chunked,
    /// The application set `Transfer-Encoding` and frames the body itself.
    Raw,
    CloseDelimited,
    NoBody,
}

pub(crate) struct FramingInput {
    pub(crate) version: Version,
    pub(crate) status: StatusCode,
    pub(crate) is_head: bool,
    pub(crate) keep_alive: bool,
    pub(crate) app_completed: bool,
    pub(crate) upgraded: bool,
}

/// Picks the framing for a response and adds the headers it implies.
/// Returns the framing and whether the connection may be reused.
pub(crate) fn decide_framing(
    headers: &mut Headers,
    input: &FramingInput,
) -> (ResponseFraming, bool) {
    if input.upgraded {
        return (ResponseFraming::NoBody, false);
    }

    let mut keep_alive = input.keep_alive && !headers.has_token("Connection", "close");

    let framing = if headers.contains("Transfer-Encoding") {
        headers.remove("Content-Length");
        let chunked_last = headers
            .last_token("Transfer-Encoding")
            .is_some_and(|t| t.eq_ignore_ascii_case("chunked"));
        if !chunked_last {
            keep_alive = false;
        }
        ResponseFraming::Raw
    } else if let Some(len) = headers
        .get("Content-Length")
        .and_then(|v| v.trim().parse().ok())
    {
        ResponseFraming::ContentLength(len)
    } else if input.is_head || !input.status.allows_body() {
        ResponseFraming::NoBody
    } else if input.app_completed {
        headers.insert("Content-Length", "0");
        ResponseFraming::ContentLength(0)
    } else if input.version == Version::Http11 {
        headers.insert("Transfer-Encoding", "chunked");
        ResponseFraming::Chunked
    } else {
        keep_alive = false;
        ResponseFraming::CloseDelimited
    };

    if !keep_alive {
        if !headers.has_token("Connection", "close") {
            headers.insert("Connection", "close");
        }
    } else if input.version == Version::Http10 && !headers.contains("Connection") {
        headers.insert("Connection", "keep-alive");
    }

    (framing, keep_alive)
}

/// Appends `data` to `out` in the given framing.
pub(crate) fn frame_body(framing: ResponseFraming, data: &[u8], out: &mut BytesMut) {
    match framing {
        ResponseFraming::Chunked => encode_chunk(data, out),
        ResponseFraming::NoBody => {}
        ResponseFraming::ContentLength(_)
        | ResponseFraming::Raw
        | ResponseFraming::CloseDelimited => out.extend_from_slice(data),
    }
}

/// Serializes a status line and header block.
///
/// `Connection` goes first, then `Date` and `Server`, then the remaining
/// headers in insertion order, then the framing headers.
pub(crate) fn encode_head(status: StatusCode, headers: &Headers, config: &Config) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256);
    buf.extend_from_slice(
        format!("HTTP/1.1 {} {}\r\n", status.as_u16(), status.reason_phrase()).as_bytes(),
    );

    let is = |name: &str, wanted: &str| name.eq_ignore_ascii_case(wanted);

    for (name, value) in headers.iter().filter(|(n, _)| is(n, "Connection")) {
        put_header(&mut buf, name, value);
    }
    if config.add_date_header && !headers.contains("Date") {
        put_header(&mut buf, "Date", &httpdate::fmt_http_date(SystemTime::now()));
    }
    if let Some(server) = config.server_header.as_deref() {
        if !headers.contains("Server") {
            put_header(&mut buf, "Server", server);
        }
    }
    for (name, value) in headers.iter().filter(|(n, _)| {
        !is(n, "Connection") && !is(n, "Transfer-Encoding") && !is(n, "Content-Length")
    }) {
        put_header(&mut buf, name, value);
    }
    for (name, value) in headers.iter().filter(|(n, _)| is(n, "Transfer-Encoding")) {
        put_header(&mut buf, name, value);
    }
    for (name, value) in headers.iter().filter(|(n, _)| is(n, "Content-Length")) {
        put_header(&mut buf, name, value);
    }

    buf.extend_from_slice(b"\r\n");
    buf
}

fn put_header(buf: &mut BytesMut, name: &str, value: &str) {
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

/// An engine-generated response with an empty body.
pub(crate) fn error_head(
    config: &Config,
    status: StatusCode,
    version: Version,
    keep_alive: bool,
) -> BytesMut {
    let mut headers = Headers::with_capacity(2);
    if !keep_alive {
        headers.insert("Connection", "close");
    } else if version == Version::Http10 {
        headers.insert("Connection", "keep-alive");
    }
    headers.insert("Content-Length", "0");
    encode_head(status, &headers, config)
}

/// Write side of a connection, plus the bytes of the current response not
/// yet handed to the transport.
pub(crate) struct Output {
    writer: WriteHalf<BoxedTransport>,
    pub(crate) pending: BytesMut,
}

impl Output {
    pub(crate) fn new(writer: WriteHalf<BoxedTransport>) -> Self {
        Self {
            writer,
            pending: BytesMut::with_capacity(4096),
        }
    }

    /// Writes `data` under the minimum response data rate.
    pub(crate) async fn write_timed(
        &mut self,
        data: &[u8],
        timeouts: &TimeoutControl,
        abort: &AbortSignal,
    ) -> Result<(), ResponseError> {
        timeouts.start_write(data.len());
        let result = tokio::select! {
            biased;
            reason = abort.aborted() => Err(ResponseError::Aborted(reason)),
            r = write_and_flush(&mut self.writer, data) => r.map_err(ResponseError::Io),
        };
        timeouts.end_write();
        result
    }

    pub(crate) async fn write_untimed(&mut self, data: &[u8]) -> io::Result<()> {
        write_and_flush(&mut self.writer, data).await
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

async fn write_and_flush(writer: &mut WriteHalf<BoxedTransport>, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

/// Hands the pending response bytes to the transport.
pub(crate) async fn flush_pending(
    conn: &ConnectionShared,
    out: &mut Output,
) -> Result<(), ResponseError> {
    if out.pending.is_empty() {
        return Ok(());
    }
    conn.exchange().wire_started = true;
    let data = out.pending.split();
    let result = out.write_timed(&data, &conn.timeouts, &conn.abort).await;
    if let Err(ResponseError::Io(e)) = &result {
        debug!(connection_id = %conn.id, error = %e, "connection reset while writing response");
        conn.abort.abort(AbortReason::ConnectionReset);
    }
    result
}

/// Starts the response if it has not started: runs OnStarting callbacks,
/// decides the framing and queues the serialized head.
pub(crate) fn start_response(
    conn: &ConnectionShared,
    out: &mut Output,
    app_completed: bool,
) -> Result<ResponseFraming, ResponseError> {
    let mut ex = conn.exchange();
    match ex.phase {
        Phase::Completed => return Err(ResponseError::Completed),
        // no framing yet means an OnStarting callback failed
        Phase::Started => return ex.framing.ok_or(ResponseError::OnStarting),
        Phase::NotStarted => {}
    }
    ex.phase = Phase::Started;

    let callbacks = std::mem::take(&mut ex.on_starting);
    let mut failed = false;
    for callback in callbacks.into_iter().rev() {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&mut ex.head))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    connection_id = %conn.id,
                    request_id = ex.seq,
                    error = %format!("{e:#}"),
                    "an OnStarting callback failed"
                );
                failed = true;
            }
            Err(_) => {
                error!(
                    connection_id = %conn.id,
                    request_id = ex.seq,
                    "an OnStarting callback panicked"
                );
                failed = true;
            }
        }
    }
    if failed {
        ex.app_error = true;
        return Err(ResponseError::OnStarting);
    }

    let input = FramingInput {
        version: ex.version,
        status: ex.head.status,
        is_head: ex.is_head,
        keep_alive: ex.keep_alive,
        app_completed,
        upgraded: ex.upgraded,
    };
    let (framing, keep_alive) = decide_framing(&mut ex.head.headers, &input);
    ex.framing = Some(framing);
    ex.keep_alive = keep_alive;

    let head = encode_head(ex.head.status, &ex.head.headers, &conn.config);
    out.pending.extend_from_slice(&head);
    Ok(framing)
}

/// Sends the interim `100 Continue`, unless the real response already
/// started. Does not start the response.
pub(crate) async fn send_continue(conn: &ConnectionShared) {
    if conn.exchange().phase != Phase::NotStarted {
        return;
    }
    let mut out = conn.output.lock().await;
    if let Err(e) = out
        .write_timed(CONTINUE_RESPONSE, &conn.timeouts, &conn.abort)
        .await
    {
        debug!(connection_id = %conn.id, error = %e, "failed to send 100 Continue");
        if let ResponseError::Io(_) = e {
            conn.abort.abort(AbortReason::ConnectionReset);
        }
    }
}

pub(crate) struct EndOutcome {
    pub(crate) keep_alive: bool,
    pub(crate) upgraded: bool,
}

/// Finishes exchange `seq` if nothing finished it yet.
pub(crate) async fn produce_end(conn: &ConnectionShared, seq: u64, app_failed: bool) -> EndOutcome {
    let mut out = conn.output.lock().await;
    {
        let ex = conn.exchange();
        if ex.seq != seq {
            return EndOutcome {
                keep_alive: false,
                upgraded: false,
            };
        }
        if ex.upgraded {
            return EndOutcome {
                keep_alive: false,
                upgraded: true,
            };
        }
        if ex.phase == Phase::Completed {
            return EndOutcome {
                keep_alive: ex.keep_alive && !conn.abort.is_aborted(),
                upgraded: false,
            };
        }
    }
    let keep_alive = end_response(conn, &mut out, app_failed).await;
    EndOutcome {
        keep_alive,
        upgraded: false,
    }
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Application,
    Framing,
    Rejected(StatusCode),
}

/// What is left to do on the wire once the exchange state is settled.
enum EndAction {
    Close,
    Flush { keep_alive: bool },
    ErrorHead { head: BytesMut, keep_alive: bool },
}

async fn end_response(conn: &ConnectionShared, out: &mut Output, app_failed: bool) -> bool {
    match settle_end(conn, out, app_failed) {
        EndAction::Close => false,
        EndAction::Flush { keep_alive } => flush_pending(conn, out).await.is_ok() && keep_alive,
        EndAction::ErrorHead { head, keep_alive } => {
            write_final(conn, out, &head).await && keep_alive
        }
    }
}

/// Marks the exchange completed and queues its tail, or decides on the
/// error response or abort.
fn settle_end(conn: &ConnectionShared, out: &mut Output, app_failed: bool) -> EndAction {
    let aborted = conn.abort.reason();
    let mut failure = app_failed.then_some(Failure::Application);

    if failure.is_none() && aborted.is_none() && start_response(conn, out, true).is_err() {
        failure = Some(Failure::Application);
    }

    let mut ex = conn.exchange();
    if ex.app_error && failure.is_none() {
        failure = Some(Failure::Application);
    }
    if ex.framing_error {
        failure = Some(Failure::Framing);
    }
    if let Some(status) = ex.rejected {
        failure = Some(Failure::Rejected(status));
    }
    if aborted == Some(AbortReason::Timeout(TimeoutReason::ReadDataRate)) {
        failure = Some(Failure::Rejected(StatusCode::REQUEST_TIMEOUT));
    }

    if failure.is_none() {
        if let Some(ResponseFraming::ContentLength(declared)) = ex.framing {
            if !ex.is_head && ex.head.status.allows_body() && ex.bytes_written < declared {
                if aborted.is_some() {
                    debug!(
                        connection_id = %conn.id,
                        request_id = ex.seq,
                        "Response Content-Length mismatch: too few bytes written ({} of {}).",
                        ex.bytes_written,
                        declared
                    );
                } else {
                    error!(
                        connection_id = %conn.id,
                        request_id = ex.seq,
                        "Response Content-Length mismatch: too few bytes written ({} of {}).",
                        ex.bytes_written,
                        declared
                    );
                }
                failure = Some(Failure::Framing);
            }
        }
    }

    let Some(failure) = failure else {
        ex.phase = Phase::Completed;
        if aborted.is_some() {
            ex.keep_alive = false;
            return EndAction::Close;
        }
        if ex.framing == Some(ResponseFraming::Chunked) {
            out.pending.extend_from_slice(LAST_CHUNK);
        }
        if ex.head_suppressed > 0 {
            debug!(
                connection_id = %conn.id,
                request_id = ex.seq,
                "Write of {} body bytes to non-body HEAD response.",
                ex.head_suppressed
            );
        }
        return EndAction::Flush {
            keep_alive: ex.keep_alive,
        };
    };

    let (status, keep_alive) = match failure {
        Failure::Application => (StatusCode::INTERNAL_SERVER_ERROR, ex.keep_alive),
        Failure::Framing => (StatusCode::INTERNAL_SERVER_ERROR, false),
        Failure::Rejected(status) => (status, false),
    };
    let can_respond = !ex.wire_started && aborted.is_none_or(|r| r.allows_error_response());
    ex.phase = Phase::Completed;
    out.pending.clear();

    if !can_respond {
        ex.keep_alive = false;
        drop(ex);
        let reason = match failure {
            Failure::Framing => AbortReason::ResponseFraming,
            _ => AbortReason::Application,
        };
        if conn.abort.abort(reason) {
            debug!(connection_id = %conn.id, %reason, "response already started, aborting connection");
        }
        return EndAction::Close;
    }

    ex.head.status = status;
    ex.keep_alive = keep_alive;
    EndAction::ErrorHead {
        head: error_head(&conn.config, status, ex.version, keep_alive),
        keep_alive,
    }
}

/// Writes an engine-generated response without rate timing.
pub(crate) async fn write_final(conn: &ConnectionShared, out: &mut Output, data: &[u8]) -> bool {
    match tokio::time::timeout(FINAL_WRITE_TIMEOUT, out.write_untimed(data)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(connection_id = %conn.id, error = %e, "connection reset while writing response");
            conn.abort.abort(AbortReason::ConnectionReset);
            false
        }
        Err(_) => {
            debug!(connection_id = %conn.id, "gave up writing error response");
            false
        }
    }
}
