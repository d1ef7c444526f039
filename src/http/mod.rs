//! HTTP/1.x protocol engine.
//!
//! The HTTP layer is organized into several submodules:
//!
//! - **`connection`**: the per-connection state machine driving everything else
//! - **`parser`**, **`headers`**, **`request`**: incremental request head parsing
//! - **`timeout`**, **`abort`**: deadlines, data rates, and the abort signal they trip
//! - **`body`**, **`chunked`**: request body streaming and chunked coding
//! - **`response`**, **`writer`**: the handler's response handle, framing and serialization
//! - **`upgrade`**: the raw byte pipe after `101 Switching Protocols`
//! - **`adapter`**: the transport abstraction and stream adapters
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │    Idle     │ ← keep-alive timer armed
//!        └──────┬──────┘
//!               │ first byte of a request
//!               ▼
//!        ┌──────────────────┐
//!        │ AwaitingHeaders  │ ← request-headers timer armed
//!        └──────┬───────────┘
//!               │ head parsed
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← handler runs; body reads are rate-checked
//!        └──────┬───────────┘
//!               │ response completed
//!               ├─ body left unread → Draining → Idle
//!               ├─ 101 → Upgraded → Closed
//!               ├─ Keep-Alive → Idle (same connection)
//!               └─ Close → Closed
//! ```
//!
//! Bytes of the next request may already sit in the receive buffer while a
//! response is written, but the next handler only starts after the previous
//! response completed.

pub mod abort;
pub mod adapter;
pub mod body;
pub mod chunked;
pub mod connection;
pub mod handler;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod timeout;
pub mod upgrade;
pub mod writer;

pub use handler::Handler;
pub use request::Request;
pub use response::Response;
