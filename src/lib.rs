//! Sentinel H1 - HTTP/1.x connection engine
//!
//! Core library: request parsing, timeouts and data rates, body streaming,
//! response framing, and the accept loop that ties them together.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod server;
