mod common;

use common::{LogCapture, TestServer, settle};
use sentinel_h1::error::ResponseError;
use sentinel_h1::http::{Handler, Request, Response};
use tokio::sync::mpsc;

const GET: &str = "GET / HTTP/1.1\r\nHost:\r\n\r\n";

/// A handler declaring `declared` bytes and writing `writes` in order,
/// reporting the result of every write.
fn declared_writes(
    declared: u64,
    writes: &'static [&'static str],
) -> (impl Handler, mpsc::UnboundedReceiver<Result<(), ResponseError>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |_req: Request, mut res: Response| {
        let tx = tx.clone();
        async move {
            res.set_content_length(Some(declared))?;
            for chunk in writes {
                let result = res.write(chunk.as_bytes()).await;
                let failed = result.is_err();
                tx.send(result).unwrap();
                if failed {
                    break;
                }
            }
            anyhow::Ok(())
        }
    };
    (handler, rx)
}

#[tokio::test]
async fn test_exact_length_keeps_connection_alive() {
    let (logs, _guard) = LogCapture::install();
    let (handler, _rx) = declared_writes(11, &["Hello", " World"]);
    let server = TestServer::new(handler);
    let mut conn = server.connect();

    conn.send(GET).await;
    conn.receive("HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nHello World").await;
    conn.send(GET).await;
    conn.receive("HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nHello World").await;

    assert!(conn.is_open_and_quiet().await);
    assert!(logs.lines_at("ERROR").is_empty());
}

#[tokio::test]
async fn test_too_few_bytes_logs_and_closes() {
    let (logs, _guard) = LogCapture::install();
    let (handler, _rx) = declared_writes(11, &["Hello"]);
    let server = TestServer::new(handler);
    let mut conn = server.connect();

    conn.send(GET).await;
    conn.receive_end("HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nHello").await;
    settle().await;

    let errors = logs.lines_at("ERROR");
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].contains(
        "Response Content-Length mismatch: too few bytes written (5 of 11)."
    ));
}

#[tokio::test]
async fn test_too_many_bytes_before_start_sends_500() {
    let (logs, _guard) = LogCapture::install();
    let (handler, mut rx) = declared_writes(5, &["Hello World"]);
    let server = TestServer::new(handler);
    let mut conn = server.connect();

    conn.send(GET).await;
    conn.receive_end(
        "HTTP/1.1 500 Internal Server Error\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
    )
    .await;

    match rx.recv().await.unwrap() {
        Err(ResponseError::TooManyBytes { written, expected }) => {
            assert_eq!((written, expected), (11, 5));
        }
        other => panic!("unexpected write result: {other:?}"),
    }
    assert!(logs.logged_at(
        "ERROR",
        "Response Content-Length mismatch: too many bytes written (11 of 5)."
    ));
}

#[tokio::test]
async fn test_too_many_bytes_after_start_aborts() {
    let (handler, mut rx) = declared_writes(5, &["Hello", " World"]);
    let server = TestServer::new(handler);
    let mut conn = server.connect();

    conn.send(GET).await;
    conn.receive_end("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nHello").await;

    assert!(rx.recv().await.unwrap().is_ok());
    assert!(matches!(
        rx.recv().await.unwrap(),
        Err(ResponseError::TooManyBytes {
            written: 11,
            expected: 5
        })
    ));
}

#[tokio::test]
async fn test_declared_zero_length() {
    let (handler, _rx) = declared_writes(0, &[]);
    let server = TestServer::new(handler);
    let mut conn = server.connect();

    conn.send(GET).await;
    conn.receive("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
    assert!(conn.is_open_and_quiet().await);
}

#[tokio::test]
async fn test_head_response_may_declare_length_without_body() {
    let (logs, _guard) = LogCapture::install();
    let (handler, _rx) = declared_writes(11, &[]);
    let server = TestServer::new(handler);
    let mut conn = server.connect();

    conn.send("HEAD / HTTP/1.1\r\nHost:\r\n\r\n").await;
    conn.receive("HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\n").await;
    assert!(conn.is_open_and_quiet().await);
    assert!(logs.lines_at("ERROR").is_empty());
}
