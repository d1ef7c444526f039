//! Errors handed to request handlers.
//!
//! Protocol problems the engine handles itself (bad request data, timeouts,
//! resets) only show up here when a handler is in the middle of reading the
//! body or writing the response; the connection is torn down regardless of
//! whether the handler swallows them.

use thiserror::Error;

use crate::http::abort::AbortReason;
use crate::http::parser::ParseError;
use crate::http::response::StatusCode;

/// Outcome of a failed request body read.
#[derive(Debug, Error)]
pub enum BodyError {
    /// The body arrived slower than the minimum data rate.
    #[error("request body read timed out: minimum data rate not satisfied")]
    Timeout,

    #[error("request body too large")]
    TooLarge,

    #[error("unexpected end of request content")]
    UnexpectedEof,

    #[error("bad request body: {0}")]
    BadRequest(#[source] ParseError),

    #[error("synchronous I/O is disallowed; use the async read instead")]
    SynchronousIoDisallowed,

    #[error("connection aborted: {0}")]
    Aborted(AbortReason),

    #[error("connection reset by peer")]
    ConnectionReset,
}

impl BodyError {
    pub(crate) fn from_abort(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Timeout(crate::http::timeout::TimeoutReason::ReadDataRate) => {
                BodyError::Timeout
            }
            AbortReason::ConnectionReset => BodyError::ConnectionReset,
            other => BodyError::Aborted(other),
        }
    }
}

/// Failure of a response operation.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("headers are read-only, the response has already started")]
    HeadersReadOnly,

    #[error("the response has already completed")]
    Completed,

    #[error("Response Content-Length mismatch: too many bytes written ({written} of {expected}).")]
    TooManyBytes { written: u64, expected: u64 },

    #[error("writing to the body of a {0} response is not allowed")]
    BodyNotAllowed(StatusCode),

    #[error("invalid Content-Length value")]
    InvalidContentLength,

    #[error("an OnStarting callback failed")]
    OnStarting,

    #[error("the request cannot be upgraded")]
    NotUpgradable,

    #[error("synchronous I/O is disallowed; use the async write instead")]
    SynchronousIoDisallowed,

    #[error("connection aborted: {0}")]
    Aborted(AbortReason),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
