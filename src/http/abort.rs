//! The per-connection abort signal.
//!
//! Every way a connection can die early (timeouts, bad framing, peer resets,
//! an explicit `abort()` from a handler) funnels into one [`AbortSignal`].
//! The first reason wins; later triggers are ignored. Pending reads and
//! writes race against [`AbortSignal::aborted`] and fail fast once it fires.

use std::sync::Arc;
use tokio::sync::watch;

use crate::http::timeout::TimeoutReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Timeout(TimeoutReason),
    /// Malformed request data.
    BadRequest,
    /// The peer reset or closed the transport.
    ConnectionReset,
    /// A handler called `Response::abort`.
    Application,
    /// The response broke its declared framing after bytes hit the wire.
    ResponseFraming,
    /// The server is shutting down.
    Shutdown,
}

impl AbortReason {
    /// Whether the engine may still send an error response of its own
    /// (for example a `408`) after this abort.
    pub fn allows_error_response(&self) -> bool {
        matches!(
            self,
            AbortReason::Timeout(TimeoutReason::RequestHeaders | TimeoutReason::ReadDataRate)
                | AbortReason::BadRequest
        )
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Timeout(reason) => write!(f, "timeout ({reason})"),
            AbortReason::BadRequest => f.write_str("bad request"),
            AbortReason::ConnectionReset => f.write_str("connection reset"),
            AbortReason::Application => f.write_str("aborted by application"),
            AbortReason::ResponseFraming => f.write_str("response framing violation"),
            AbortReason::Shutdown => f.write_str("server shutdown"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<Option<AbortReason>>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Records `reason` unless another reason was recorded first.
    /// Returns `true` if this call triggered the abort.
    pub fn abort(&self, reason: AbortReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn reason(&self) -> Option<AbortReason> {
        *self.tx.borrow()
    }

    pub fn is_aborted(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once the connection is aborted.
    pub async fn aborted(&self) -> AbortReason {
        let mut rx = self.tx.subscribe();
        if let Ok(reason) = rx.wait_for(Option::is_some).await {
            if let Some(reason) = *reason {
                return reason;
            }
        }
        // the sender lives in `self`, so the channel cannot close under us
        std::future::pending().await
    }
}
