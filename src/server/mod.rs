//! Accepting connections and wiring them to the HTTP engine.

pub mod heartbeat;
pub mod listener;

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::http::abort::AbortReason;
use crate::http::adapter::{BoxedTransport, ConnectionAdapter, Transport};
use crate::http::connection::{Connection, ConnectionId};
use crate::http::handler::Handler;

pub use heartbeat::Heartbeat;

/// Everything a connection needs: configuration, clock, heartbeat, stream
/// adapters and the application handler. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    config: Arc<Config>,
    heartbeat: Arc<Heartbeat>,
    handler: Arc<dyn Handler>,
    adapters: Vec<Arc<dyn ConnectionAdapter>>,
}

impl Server {
    pub fn new(config: Config, handler: impl Handler) -> Self {
        Self {
            config: Arc::new(config),
            heartbeat: Arc::new(Heartbeat::new(Arc::new(SystemClock::new()))),
            handler: Arc::new(handler),
            adapters: Vec::new(),
        }
    }

    /// Replaces the time source. Must be called before any connection is
    /// served.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.heartbeat = Arc::new(Heartbeat::new(clock));
        self
    }

    /// Adds a stream adapter. Adapters wrap each accepted stream in the
    /// order they were added, so the last one is outermost.
    pub fn with_adapter(mut self, adapter: impl ConnectionAdapter) -> Self {
        self.adapters.push(Arc::new(adapter));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn heartbeat(&self) -> &Arc<Heartbeat> {
        &self.heartbeat
    }

    /// Builds the connection for an accepted stream.
    pub fn connection(&self, stream: impl Transport) -> Connection {
        let id = ConnectionId::new();
        let mut stream: BoxedTransport = Box::new(stream);
        for adapter in &self.adapters {
            stream = adapter.wrap(id, stream);
        }
        Connection::new(
            id,
            stream,
            self.config.clone(),
            self.heartbeat.clock().clone(),
            self.handler.clone(),
            &self.heartbeat,
        )
    }

    /// Serves one accepted stream until it closes.
    pub async fn serve_connection(&self, stream: impl Transport) -> anyhow::Result<()> {
        self.connection(stream).run().await
    }

    /// Starts the background heartbeat at the configured interval.
    pub fn start_heartbeat(&self) -> JoinHandle<()> {
        self.heartbeat.spawn(self.config.heartbeat_interval)
    }

    /// Aborts every open connection. In-flight reads and writes fail
    /// immediately; idle connections close.
    pub fn shutdown(&self) {
        self.heartbeat.abort_all(AbortReason::Shutdown);
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("heartbeat", &self.heartbeat)
            .field("adapters", &self.adapters.len())
            .finish()
    }
}
