#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sentinel_h1::clock::{Clock, ManualClock};
use sentinel_h1::config::Config;
use sentinel_h1::http::Handler;
use sentinel_h1::http::adapter::ConnectionAdapter;
use sentinel_h1::server::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tracing::Level;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Defaults for connection tests: no `Date` header so responses can be
/// compared byte for byte, and short timeouts.
pub fn test_config() -> Config {
    let mut config = Config {
        add_date_header: false,
        ..Config::default()
    };
    config.limits.keep_alive_timeout = Duration::from_secs(10);
    config.limits.request_headers_timeout = Duration::from_secs(10);
    config
}

/// Lets spawned connection tasks catch up with what the test just did.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}

pub struct TestServer {
    pub server: Server,
    pub clock: Arc<ManualClock>,
}

impl TestServer {
    pub fn new(handler: impl Handler) -> Self {
        Self::with_config(test_config(), handler)
    }

    pub fn with_config(config: Config, handler: impl Handler) -> Self {
        let clock = Arc::new(ManualClock::new());
        let server = Server::new(config, handler).with_clock(clock.clone() as Arc<dyn Clock>);
        Self { server, clock }
    }

    pub fn with_adapter(mut self, adapter: impl ConnectionAdapter) -> Self {
        self.server = self.server.with_adapter(adapter);
        self
    }

    pub fn connect(&self) -> TestConnection {
        self.connect_with_capacity(256 * 1024)
    }

    /// Connects through a pipe that buffers at most `capacity` bytes each
    /// way, so a client that stops reading stalls the server's writes.
    pub fn connect_with_capacity(&self, capacity: usize) -> TestConnection {
        let (client, server_io) = tokio::io::duplex(capacity);
        let server = self.server.clone();
        let task = tokio::spawn(async move { server.serve_connection(server_io).await });
        TestConnection { stream: client, task }
    }

    /// Moves the clock forward and runs a heartbeat tick.
    pub async fn advance(&self, by: Duration) {
        settle().await;
        self.clock.advance(by);
        self.server.heartbeat().tick();
        settle().await;
    }

    /// Moves the clock forward in one-second heartbeat steps.
    pub async fn advance_by_ticks(&self, total: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.advance(Duration::from_secs(1)).await;
            elapsed += Duration::from_secs(1);
        }
    }
}

pub struct TestConnection {
    pub stream: DuplexStream,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestConnection {
    pub async fn send(&mut self, data: &str) {
        self.stream.write_all(data.as_bytes()).await.unwrap();
    }

    /// Sends `data` one byte at a time.
    pub async fn send_slowly(&mut self, data: &str) {
        for b in data.bytes() {
            self.stream.write_all(&[b]).await.unwrap();
            settle().await;
        }
    }

    /// Reads exactly `expected.len()` bytes and compares them.
    pub async fn receive(&mut self, expected: &str) {
        let mut buf = vec![0u8; expected.len()];
        tokio::time::timeout(IO_TIMEOUT, self.stream.read_exact(&mut buf))
            .await
            .expect("timed out waiting for response bytes")
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&buf), expected);
    }

    /// Reads up to and including the blank line ending a response head.
    pub async fn receive_head(&mut self) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = tokio::time::timeout(IO_TIMEOUT, self.stream.read(&mut byte))
                .await
                .expect("timed out waiting for response head")
                .unwrap();
            assert!(n > 0, "connection closed mid-head: {:?}", String::from_utf8_lossy(&head));
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    /// Reads until the server closes the connection.
    pub async fn receive_to_end(&mut self) -> String {
        let mut data = Vec::new();
        tokio::time::timeout(IO_TIMEOUT, self.stream.read_to_end(&mut data))
            .await
            .expect("timed out waiting for the connection to close")
            .unwrap();
        String::from_utf8_lossy(&data).into_owned()
    }

    /// Reads `expected` and then requires the connection to close.
    pub async fn receive_end(&mut self, expected: &str) {
        assert_eq!(self.receive_to_end().await, expected);
    }

    /// True if nothing arrives and the connection stays open for a moment.
    pub async fn is_open_and_quiet(&mut self) -> bool {
        let mut byte = [0u8; 1];
        tokio::time::timeout(Duration::from_millis(100), self.stream.read(&mut byte))
            .await
            .is_err()
    }

    pub async fn shutdown_write(&mut self) {
        self.stream.shutdown().await.unwrap();
    }

    /// Drops the client side without a clean shutdown and waits for the
    /// server side to notice.
    pub async fn reset(self) -> anyhow::Result<()> {
        drop(self.stream);
        tokio::time::timeout(IO_TIMEOUT, self.task)
            .await
            .expect("connection did not finish")
            .unwrap()
    }

    /// Waits for the server side of the connection to finish.
    pub async fn join(self) -> anyhow::Result<()> {
        tokio::time::timeout(IO_TIMEOUT, self.task)
            .await
            .expect("connection did not finish")
            .unwrap()
    }
}

/// Captures formatted log output of the current thread.
///
/// Connection tests run on the current-thread runtime, so the connection
/// tasks log on the same thread as the test body.
#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = LogCapture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(Level::TRACE)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }

    /// Log lines emitted at `level` ("ERROR", "INFO", "DEBUG", ...).
    pub fn lines_at(&self, level: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.split_whitespace().nth(1) == Some(level))
            .map(str::to_owned)
            .collect()
    }

    pub fn logged_at(&self, level: &str, needle: &str) -> bool {
        self.lines_at(level).iter().any(|line| line.contains(needle))
    }

    /// Every line containing `needle`, whatever its level.
    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.contains(needle))
            .map(str::to_owned)
            .collect()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
