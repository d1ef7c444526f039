mod common;

use common::{TestServer, test_config};
use sentinel_h1::error::BodyError;
use sentinel_h1::error::ResponseError;
use sentinel_h1::http::response::StatusCode;
use sentinel_h1::http::{Request, Response};
use tokio::sync::mpsc;

const BAD_REQUEST: &str =
    "HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";
const PAYLOAD_TOO_LARGE: &str =
    "HTTP/1.1 413 Payload Too Large\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

async fn echo(mut req: Request, mut res: Response) -> anyhow::Result<()> {
    let body = req.body().read_to_end().await?;
    res.set_content_length(Some(body.len() as u64))?;
    res.write(&body).await?;
    Ok(())
}

/// Reads the whole body and reports how it went; never writes a response.
fn reporting_reader() -> (
    impl sentinel_h1::http::Handler,
    mpsc::UnboundedReceiver<Result<Vec<u8>, BodyError>>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |mut req: Request, _res: Response| {
        let tx = tx.clone();
        async move {
            let result = req.body().read_to_end().await.map(|b| b.to_vec());
            tx.send(result).unwrap();
            anyhow::Ok(())
        }
    };
    (handler, rx)
}

#[tokio::test]
async fn test_content_length_body() {
    let server = TestServer::new(echo);
    let mut conn = server.connect();

    conn.send("POST / HTTP/1.1\r\nHost:\r\nContent-Length: 11\r\n\r\nHello World")
        .await;
    conn.receive("HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nHello World").await;
}

#[tokio::test]
async fn test_body_split_across_packets() {
    let server = TestServer::new(echo);
    let mut conn = server.connect();

    conn.send("POST / HTTP/1.1\r\nHost:\r\nContent-Length: 11\r\n\r\nHel").await;
    conn.send_slowly("lo World").await;
    conn.receive("HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nHello World").await;
}

#[tokio::test]
async fn test_chunked_body() {
    let server = TestServer::new(echo);
    let mut conn = server.connect();

    conn.send(
        "POST / HTTP/1.1\r\nHost:\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nHello \r\n6;ext=1\r\nWorld!\r\n0\r\n\r\n",
    )
    .await;
    conn.receive("HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\nHello World!").await;
}

#[tokio::test]
async fn test_chunked_trailers() {
    let server = TestServer::new(|mut req: Request, mut res: Response| async move {
        let before = req.body().trailers().await;
        let body = req.body().read_to_end().await?;
        let trailers = req.body().trailers().await.unwrap_or_default();
        let checksum = trailers.get("x-checksum").unwrap_or("missing").to_string();
        let reply = format!("{} {} {}", before.is_none(), body.len(), checksum);
        res.set_content_length(Some(reply.len() as u64))?;
        res.write(reply.as_bytes()).await?;
        anyhow::Ok(())
    });
    let mut conn = server.connect();

    conn.send(
        "POST / HTTP/1.1\r\nHost:\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nX-Checksum: 900150983cd24fb0\r\n\r\n",
    )
    .await;
    conn.receive("HTTP/1.1 200 OK\r\nContent-Length: 23\r\n\r\ntrue 3 900150983cd24fb0")
        .await;
}

#[tokio::test]
async fn test_continue_sent_on_first_read() {
    let server = TestServer::new(|mut req: Request, mut res: Response| async move {
        let body = req.body().read_to_end().await?;
        // the interim response did not start the real one
        res.set_status(StatusCode::CREATED)?;
        res.set_content_length(Some(body.len() as u64))?;
        res.write(&body).await?;
        anyhow::Ok(())
    });
    let mut conn = server.connect();

    conn.send("PUT / HTTP/1.1\r\nHost:\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n")
        .await;
    conn.receive("HTTP/1.1 100 Continue\r\n\r\n").await;
    conn.send("hello").await;
    conn.receive("HTTP/1.1 201 Created\r\nContent-Length: 5\r\n\r\nhello").await;
}

#[tokio::test]
async fn test_no_continue_after_response_started() {
    let server = TestServer::new(|mut req: Request, mut res: Response| async move {
        res.set_content_length(Some(2))?;
        res.write(b"ok").await?;
        req.body().read_to_end().await?;
        anyhow::Ok(())
    });
    let mut conn = server.connect();

    conn.send("PUT / HTTP/1.1\r\nHost:\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n")
        .await;
    conn.receive("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
    conn.send("hello").await;
    conn.send("GET / HTTP/1.1\r\nHost:\r\n\r\n").await;
    conn.receive("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
}

#[tokio::test]
async fn test_malformed_chunk_is_bad_request() {
    let (handler, mut rx) = reporting_reader();
    let server = TestServer::new(handler);
    let mut conn = server.connect();

    conn.send("POST / HTTP/1.1\r\nHost:\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nhello\r\n")
        .await;
    conn.receive_end(BAD_REQUEST).await;
    assert!(matches!(
        rx.recv().await.unwrap(),
        Err(BodyError::BadRequest(_))
    ));
}

#[tokio::test]
async fn test_truncated_body_is_bad_request() {
    let (handler, mut rx) = reporting_reader();
    let server = TestServer::new(handler);
    let mut conn = server.connect();

    conn.send("POST / HTTP/1.1\r\nHost:\r\nContent-Length: 10\r\n\r\nabc").await;
    conn.shutdown_write().await;
    conn.receive_end(BAD_REQUEST).await;
    assert!(matches!(
        rx.recv().await.unwrap(),
        Err(BodyError::UnexpectedEof)
    ));
}

#[tokio::test]
async fn test_declared_body_too_large() {
    let mut config = test_config();
    config.limits.max_request_body_size = Some(10);
    let (handler, _rx) = reporting_reader();
    let server = TestServer::with_config(config, handler);
    let mut conn = server.connect();

    conn.send("POST / HTTP/1.1\r\nHost:\r\nContent-Length: 11\r\n\r\n").await;
    conn.receive_end(PAYLOAD_TOO_LARGE).await;
}

#[tokio::test]
async fn test_chunked_body_too_large() {
    let mut config = test_config();
    config.limits.max_request_body_size = Some(10);
    let (handler, mut rx) = reporting_reader();
    let server = TestServer::with_config(config, handler);
    let mut conn = server.connect();

    conn.send(
        "POST / HTTP/1.1\r\nHost:\r\nTransfer-Encoding: chunked\r\n\r\nb\r\nHello World\r\n0\r\n\r\n",
    )
    .await;
    conn.receive_end(PAYLOAD_TOO_LARGE).await;
    assert!(matches!(rx.recv().await.unwrap(), Err(BodyError::TooLarge)));
}

#[tokio::test]
async fn test_body_size_unlimited() {
    let mut config = test_config();
    config.limits.max_request_body_size = None;
    let server = TestServer::with_config(config, echo);
    let mut conn = server.connect();

    let body = "x".repeat(64 * 1024);
    conn.send(&format!(
        "POST / HTTP/1.1\r\nHost:\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    ))
    .await;
    let head = conn.receive_head().await;
    assert_eq!(head, "HTTP/1.1 200 OK\r\nContent-Length: 65536\r\n\r\n");
    conn.receive(&body).await;
}

#[tokio::test]
async fn test_synchronous_io_disallowed_by_default() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = TestServer::new(move |mut req: Request, mut res: Response| {
        let tx = tx.clone();
        async move {
            let mut buf = [0u8; 8];
            let read = req.body().read_sync(&mut buf);
            let write = res.write_sync(b"x");
            tx.send((read, write)).unwrap();
            anyhow::Ok(())
        }
    });
    let mut conn = server.connect();

    conn.send("POST / HTTP/1.1\r\nHost:\r\nContent-Length: 2\r\n\r\nhi").await;
    conn.receive("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;

    let (read, write) = rx.recv().await.unwrap();
    assert!(matches!(read, Err(BodyError::SynchronousIoDisallowed)));
    assert!(matches!(write, Err(ResponseError::SynchronousIoDisallowed)));
}

async fn sync_echo(mut req: Request, mut res: Response) -> anyhow::Result<()> {
    req.set_allow_synchronous_io(true);
    let mut body = Vec::new();
    let mut buf = [0u8; 4];
    loop {
        let n = req.body().read_sync(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    res.set_content_length(Some(body.len() as u64))?;
    res.write_sync(&body)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_synchronous_io_when_allowed() {
    let server = TestServer::new(sync_echo);
    let mut conn = server.connect();

    conn.send("POST / HTTP/1.1\r\nHost:\r\nContent-Length: 11\r\n\r\nHello World")
        .await;
    conn.receive("HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nHello World").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_synchronous_io_allowed_by_config() {
    let mut config = test_config();
    config.allow_synchronous_io = true;
    let server = TestServer::with_config(config, |mut req: Request, mut res: Response| async move {
        let mut buf = [0u8; 16];
        let n = req.body().read_sync(&mut buf)?;
        res.write_sync(&buf[..n])?;
        anyhow::Ok(())
    });
    let mut conn = server.connect();

    conn.send("POST / HTTP/1.1\r\nHost:\r\nContent-Length: 2\r\n\r\nhi").await;
    conn.receive("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n")
        .await;
}
