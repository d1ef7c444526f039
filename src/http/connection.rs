use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use bytes::Buf;
use tracing::{debug, error, info, trace};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::BodyError;
use crate::http::abort::{AbortReason, AbortSignal};
use crate::http::adapter::BoxedTransport;
use crate::http::body::{Fill, Input, RequestBody};
use crate::http::handler::Handler;
use crate::http::parser::{ParseLimits, RequestParser};
use crate::http::request::{Request, RequestHead, Version};
use crate::http::response::{self, ExchangeState, Response, StatusCode};
use crate::http::timeout::{TimeoutControl, TimeoutReason};
use crate::http::writer::{self, Output};
use crate::server::heartbeat::{Heartbeat, Registration};

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection, used in every log line it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// State shared between the connection loop and the request/response
/// handles given to the handler.
///
/// Lock order: `input` before `output`; `exchange` is never held across an
/// await.
pub(crate) struct ConnectionShared {
    pub(crate) id: ConnectionId,
    pub(crate) config: Arc<Config>,
    pub(crate) timeouts: Arc<TimeoutControl>,
    pub(crate) abort: AbortSignal,
    pub(crate) input: tokio::sync::Mutex<Input>,
    pub(crate) output: tokio::sync::Mutex<Output>,
    exchange: Mutex<ExchangeState>,
    sync_io: AtomicBool,
}

impl ConnectionShared {
    pub(crate) fn exchange(&self) -> MutexGuard<'_, ExchangeState> {
        self.exchange.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn allow_sync_io(&self) -> bool {
        self.sync_io.load(Ordering::SeqCst)
    }

    pub(crate) fn set_allow_sync_io(&self, allow: bool) {
        self.sync_io.store(allow, Ordering::SeqCst);
    }

    /// Marks the current request as malformed: the engine answers with
    /// `status` (if nothing was sent yet) and closes the connection.
    pub(crate) fn reject(&self, status: StatusCode) {
        {
            let mut ex = self.exchange();
            ex.rejected.get_or_insert(status);
            ex.keep_alive = false;
        }
        self.abort.abort(AbortReason::BadRequest);
    }

    async fn begin_exchange(&self, seq: u64, head: &RequestHead) {
        self.exchange().reset(seq, head);
        self.set_allow_sync_io(self.config.allow_synchronous_io);
        self.input
            .lock()
            .await
            .begin_body(head, self.config.limits.max_request_body_size);
        if head.has_body() {
            self.timeouts
                .start_read_timing(self.config.limits.min_request_body_data_rate);
        } else {
            self.timeouts.stop_read_timing();
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Between requests; the keep-alive timer is armed.
    Idle,
    /// Part of a request head has arrived; the headers timer is armed.
    AwaitingHeaders,
    Processing(Box<RequestHead>),
    /// The response is done but the handler left request body unread.
    Draining { request_id: u64 },
    /// Switched protocols; the connection ends with the handler.
    Upgraded,
    Closed,
}

/// One client connection, from accept to close.
pub struct Connection {
    shared: Arc<ConnectionShared>,
    handler: Arc<dyn Handler>,
    parser: RequestParser,
    state: ConnectionState,
    requests: u64,
    _registration: Registration,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        stream: BoxedTransport,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        handler: Arc<dyn Handler>,
        heartbeat: &Arc<Heartbeat>,
    ) -> Self {
        let abort = AbortSignal::new();
        let timeouts = Arc::new(TimeoutControl::new(
            id,
            clock,
            abort.clone(),
            config.limits.min_response_data_rate,
        ));
        let registration = heartbeat.register(id, &timeouts);
        let (reader, writer) = tokio::io::split(stream);

        let shared = Arc::new(ConnectionShared {
            id,
            timeouts,
            abort,
            input: tokio::sync::Mutex::new(Input::new(reader)),
            output: tokio::sync::Mutex::new(Output::new(writer)),
            exchange: Mutex::new(ExchangeState::new()),
            sync_io: AtomicBool::new(config.allow_synchronous_io),
            config: config.clone(),
        });

        Self {
            shared,
            handler,
            parser: RequestParser::new(ParseLimits::from(&config.limits)),
            state: ConnectionState::Idle,
            requests: 0,
            _registration: registration,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Serves requests until the connection closes.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        debug!(connection_id = %self.shared.id, "connection started");

        loop {
            let state = std::mem::replace(&mut self.state, ConnectionState::Closed);
            trace!(connection_id = %self.shared.id, state = ?state, "connection state");
            self.state = match state {
                ConnectionState::Idle => {
                    self.shared.timeouts.set_timeout(
                        self.shared.config.limits.keep_alive_timeout,
                        TimeoutReason::KeepAlive,
                    );
                    self.read_head().await
                }
                ConnectionState::AwaitingHeaders => self.read_head().await,
                ConnectionState::Processing(head) => self.process_request(*head).await,
                ConnectionState::Draining { request_id } => self.drain(request_id).await,
                ConnectionState::Upgraded | ConnectionState::Closed => break,
            };
        }

        self.shared.timeouts.cancel_timeout();
        let mut out = self.shared.output.lock().await;
        if let Err(e) = out.shutdown().await {
            debug!(connection_id = %self.shared.id, error = %e, "error closing connection");
        }
        debug!(
            connection_id = %self.shared.id,
            requests = self.requests,
            "connection closed"
        );
        Ok(())
    }

    async fn read_head(&mut self) -> ConnectionState {
        let shared = self.shared.clone();
        let mut input = shared.input.lock().await;

        loop {
            if !input.buf.is_empty() {
                if self.state != ConnectionState::AwaitingHeaders {
                    // one deadline for the whole head, armed by its first byte
                    self.state = ConnectionState::AwaitingHeaders;
                    shared.timeouts.set_timeout(
                        shared.config.limits.request_headers_timeout,
                        TimeoutReason::RequestHeaders,
                    );
                }

                match self.parser.parse(&input.buf) {
                    Ok(Some((head, consumed))) => {
                        input.buf.advance(consumed);
                        shared.timeouts.cancel_timeout();
                        return ConnectionState::Processing(Box::new(head));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        drop(input);
                        debug!(connection_id = %shared.id, error = %e, "bad request data");
                        self.send_error(e.status_code()).await;
                        return ConnectionState::Closed;
                    }
                }
            }

            match input.fill(&shared.abort).await {
                Ok(Fill::Data(_)) => {}
                Ok(Fill::Eof) => {
                    if input.buf.is_empty() {
                        debug!(connection_id = %shared.id, "client closed connection");
                        return ConnectionState::Closed;
                    }
                    drop(input);
                    debug!(
                        connection_id = %shared.id,
                        "bad request data: unexpected end of request headers"
                    );
                    self.send_error(StatusCode::BAD_REQUEST).await;
                    return ConnectionState::Closed;
                }
                Ok(Fill::Aborted(reason)) => {
                    drop(input);
                    return self.aborted_while_reading(reason).await;
                }
                Err(e) => {
                    debug!(connection_id = %shared.id, error = %e, "connection reset");
                    shared.abort.abort(AbortReason::ConnectionReset);
                    return ConnectionState::Closed;
                }
            }
        }
    }

    async fn aborted_while_reading(&mut self, reason: AbortReason) -> ConnectionState {
        let id = self.shared.id;
        match reason {
            AbortReason::Timeout(TimeoutReason::RequestHeaders) => {
                debug!(connection_id = %id, "bad request data: request headers timeout");
                self.send_error(StatusCode::REQUEST_TIMEOUT).await;
            }
            AbortReason::Timeout(TimeoutReason::KeepAlive) => {
                debug!(connection_id = %id, "connection keep-alive timeout");
            }
            other => {
                debug!(connection_id = %id, reason = %other, "connection aborted");
            }
        }
        ConnectionState::Closed
    }

    /// Sends an engine-generated error response that closes the connection.
    async fn send_error(&mut self, status: StatusCode) {
        let shared = &self.shared;
        let head = writer::error_head(&shared.config, status, Version::Http11, false);
        let mut out = shared.output.lock().await;
        writer::write_final(shared, &mut out, &head).await;
    }

    async fn process_request(&mut self, head: RequestHead) -> ConnectionState {
        self.requests += 1;
        let seq = self.requests;
        let shared = self.shared.clone();
        shared.begin_exchange(seq, &head).await;

        debug!(
            connection_id = %shared.id,
            request_id = seq,
            method = head.method.as_str(),
            target = %head.target,
            "request started"
        );

        let request = Request::new(head, RequestBody::new(shared.clone(), seq));
        let response = Response::new(shared.clone(), seq);

        // run on its own task so a panicking handler can't take the
        // connection down with it
        let result = match tokio::spawn(self.handler.call(request, response)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(anyhow!("request handler panicked")),
            Err(e) => Err(anyhow!(e)),
        };

        if let Err(e) = &result {
            match shared.abort.reason() {
                Some(reason) => debug!(
                    connection_id = %shared.id,
                    request_id = seq,
                    %reason,
                    error = %format!("{e:#}"),
                    "request handler failed after the connection was aborted"
                ),
                None => error!(
                    connection_id = %shared.id,
                    request_id = seq,
                    error = %format!("{e:#}"),
                    "unhandled error in request handler"
                ),
            }
        }
        shared.timeouts.stop_read_timing();

        let end = writer::produce_end(&shared, seq, result.is_err()).await;
        if end.upgraded {
            response::run_on_completed(&shared, seq);
            return ConnectionState::Upgraded;
        }

        let keep_alive = end.keep_alive && !shared.abort.is_aborted();
        if keep_alive && !shared.input.lock().await.is_complete() {
            return ConnectionState::Draining { request_id: seq };
        }

        response::run_on_completed(&shared, seq);
        if keep_alive {
            ConnectionState::Idle
        } else {
            ConnectionState::Closed
        }
    }

    /// Discards the unread rest of the request body so the next request
    /// can be parsed.
    async fn drain(&mut self, seq: u64) -> ConnectionState {
        let shared = self.shared.clone();
        let drained = {
            let mut input = shared.input.lock().await;
            if input.continue_pending() {
                debug!(
                    connection_id = %shared.id,
                    request_id = seq,
                    "request body was never requested with 100 Continue, closing"
                );
                false
            } else {
                shared.timeouts.set_timeout(
                    shared.config.limits.request_body_drain_timeout,
                    TimeoutReason::RequestBodyDrain,
                );
                let mut scratch = vec![0u8; 4096];
                let drained = loop {
                    match input.read_body(&shared, &mut scratch).await {
                        Ok(0) => break true,
                        Ok(_) => {}
                        Err(BodyError::Aborted(AbortReason::Timeout(
                            TimeoutReason::RequestBodyDrain,
                        ))) => {
                            info!(
                                connection_id = %shared.id,
                                request_id = seq,
                                "request body drain timed out"
                            );
                            break false;
                        }
                        Err(e) => {
                            debug!(
                                connection_id = %shared.id,
                                request_id = seq,
                                error = %e,
                                "failed to drain request body"
                            );
                            break false;
                        }
                    }
                };
                shared.timeouts.cancel_timeout();
                drained
            }
        };

        response::run_on_completed(&shared, seq);
        if drained {
            ConnectionState::Idle
        } else {
            ConnectionState::Closed
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state)
            .field("requests", &self.requests)
            .finish()
    }
}
