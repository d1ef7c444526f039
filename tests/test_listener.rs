mod common;

use std::sync::Arc;

use common::{LogCapture, TestServer, test_config};
use sentinel_h1::clock::{Clock, ManualClock};
use sentinel_h1::http::adapter::LoggingAdapter;
use sentinel_h1::http::{Request, Response};
use sentinel_h1::server::{Server, listener};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn hello(req: Request, mut res: Response) -> anyhow::Result<()> {
    let body = format!("hello {}", req.path());
    res.set_content_length(Some(body.len() as u64))?;
    res.write(body.as_bytes()).await?;
    Ok(())
}

#[tokio::test]
async fn test_serves_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(test_config(), hello);
    let accept = tokio::spawn(listener::serve(listener, server));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /tcp HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert_eq!(
        response,
        "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 10\r\n\r\nhello /tcp"
    );

    accept.abort();
}

#[tokio::test]
async fn test_tcp_connections_are_independent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(test_config(), hello);
    let accept = tokio::spawn(listener::serve(listener, server.clone()));

    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();
    first.write_all(b"GET /a HTTP/1.1\r\nHost: h\r\n").await.unwrap();
    second
        .write_all(b"GET /b HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    // the second connection is answered while the first is still mid-head
    let mut response = String::new();
    second.read_to_string(&mut response).await.unwrap();
    assert!(response.ends_with("hello /b"));

    first.write_all(b"Connection: close\r\n\r\n").await.unwrap();
    let mut response = String::new();
    first.read_to_string(&mut response).await.unwrap();
    assert!(response.ends_with("hello /a"));

    accept.abort();
}

#[tokio::test]
async fn test_logging_adapter_traces_traffic() {
    let (logs, _guard) = LogCapture::install();
    let clock = Arc::new(ManualClock::new());
    let server = Server::new(test_config(), hello)
        .with_clock(clock.clone() as Arc<dyn Clock>)
        .with_adapter(LoggingAdapter);
    let server = TestServer { server, clock };
    let mut conn = server.connect();

    conn.send("GET /x HTTP/1.1\r\nHost:\r\n\r\n").await;
    conn.receive("HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nhello /x").await;

    assert!(
        logs.lines_at("TRACE")
            .iter()
            .any(|line| line.contains("read") && line.contains("bytes=26"))
    );
    assert!(
        logs.lines_at("TRACE")
            .iter()
            .any(|line| line.contains("write") && line.contains("bytes=46"))
    );
}
