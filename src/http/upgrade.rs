//! Protocol switching.
//!
//! After `101 Switching Protocols` the connection is a plain byte pipe: no
//! framing, no keep-alive, no timers. Bytes the client pipelined behind the
//! upgrade request are delivered first.

use std::io;
use std::sync::Arc;

use tracing::debug;

use crate::error::ResponseError;
use crate::http::connection::ConnectionShared;
use crate::http::response::{Phase, StatusCode};
use crate::http::writer;

/// The raw duplex stream of an upgraded connection. The connection closes
/// once the handler that upgraded it returns.
pub struct Upgraded {
    conn: Arc<ConnectionShared>,
}

pub(crate) async fn switch_protocols(
    conn: Arc<ConnectionShared>,
    seq: u64,
) -> Result<Upgraded, ResponseError> {
    {
        let mut ex = conn.exchange();
        if ex.seq != seq || ex.phase == Phase::Completed {
            return Err(ResponseError::Completed);
        }
        if ex.phase != Phase::NotStarted {
            return Err(ResponseError::HeadersReadOnly);
        }
        if !ex.upgradable {
            return Err(ResponseError::NotUpgradable);
        }
        ex.upgraded = true;
        ex.head.status = StatusCode::SWITCHING_PROTOCOLS;
        if !ex.head.headers.contains("Connection") {
            ex.head.headers.insert("Connection", "Upgrade");
        }
    }

    conn.timeouts.disable();
    conn.input.lock().await.begin_upgraded();

    let mut out = conn.output.lock().await;
    writer::start_response(&conn, &mut out, false)?;
    writer::flush_pending(&conn, &mut out).await?;
    drop(out);

    debug!(connection_id = %conn.id, request_id = seq, "connection upgraded");
    Ok(Upgraded { conn })
}

impl Upgraded {
    /// Reads raw bytes; 0 means the peer closed its side.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut input = self.conn.input.lock().await;
        input.read_body(&self.conn, buf).await.map_err(io::Error::other)
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut out = self.conn.output.lock().await;
        out.write_timed(data, &self.conn.timeouts, &self.conn.abort)
            .await
            .map_err(|e| match e {
                ResponseError::Io(e) => e,
                other => io::Error::other(other),
            })
    }

    /// Closes the write side.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.conn.output.lock().await.shutdown().await
    }
}

impl std::fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgraded")
            .field("connection_id", &self.conn.id)
            .finish()
    }
}
