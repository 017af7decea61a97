use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use blockwatch::status::{query_status, StatusError};
use blockwatch::varint;

const STATUS_JSON: &str =
    r#"{"description":{"text":"A"},"version":{"name":"1.17"},"players":{"online":2,"max":20}}"#;

fn frame_response(json: &str) -> Vec<u8> {
    let mut inner = varint::encode(0); // packet id
    inner.extend(varint::encode(json.len() as u32));
    inner.extend(json.as_bytes());
    let mut framed = varint::encode(inner.len() as u32);
    framed.extend(inner);
    framed
}

/// Accept one connection, read the request, reply with a framed status
/// document. When `chunked`, the response is dribbled out in two writes.
async fn spawn_status_server(json: &'static str, chunked: bool) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 512];
        let _ = socket.read(&mut buf).await.unwrap();

        let framed = frame_response(json);
        if chunked {
            let mid = framed.len() / 2;
            socket.write_all(&framed[..mid]).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            socket.write_all(&framed[mid..]).await.unwrap();
        } else {
            socket.write_all(&framed).await.unwrap();
        }
    });
    port
}

#[tokio::test]
async fn test_query_parses_status_document() {
    let port = spawn_status_server(STATUS_JSON, false).await;
    let status = query_status("127.0.0.1", port, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(status.description.text, "A");
    assert_eq!(status.version.name, "1.17");
    assert_eq!(status.players.online, 2);
    assert_eq!(status.players.max, 20);
}

#[tokio::test]
async fn test_query_handles_partial_reads() {
    let port = spawn_status_server(STATUS_JSON, true).await;
    let status = query_status("127.0.0.1", port, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(status.players.online, 2);
}

#[tokio::test]
async fn test_query_sends_handshake_then_status_request() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 512];
        // The two request packets total a handful of bytes; one read per
        // chunk until the trailing status request shows up.
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if buf.ends_with(&[1, 0]) {
                break;
            }
        }
        socket.write_all(&frame_response(STATUS_JSON)).await.unwrap();
        buf
    });

    query_status("127.0.0.1", port, Duration::from_secs(2))
        .await
        .unwrap();

    let buf = server.await.unwrap();
    let (body_len, consumed) = varint::decode(&buf).unwrap();
    let body = &buf[consumed..consumed + body_len as usize];
    // [id=0][protocol=0][host len][host][port BE][next state=1]
    assert_eq!(body[0], 0);
    assert_eq!(body[1], 0);
    let (host_len, host_len_bytes) = varint::decode(&body[2..]).unwrap();
    let host_start = 2 + host_len_bytes;
    let host_end = host_start + host_len as usize;
    assert_eq!(&body[host_start..host_end], b"127.0.0.1");
    assert_eq!(&body[host_end..host_end + 2], &port.to_be_bytes());
    assert_eq!(body[host_end + 2], 1);
    // Followed by the empty status request.
    assert_eq!(&buf[consumed + body_len as usize..], &[1, 0]);
}

#[tokio::test]
async fn test_query_times_out_when_server_is_silent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        // Hold the connection open without ever responding.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let result = query_status("127.0.0.1", port, Duration::from_millis(200)).await;
    assert!(matches!(result, Err(StatusError::Timeout)));
}

#[tokio::test]
async fn test_query_reports_connection_refused() {
    // Bind and immediately drop to get a port nobody is listening on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = query_status("127.0.0.1", port, Duration::from_secs(2)).await;
    assert!(matches!(result, Err(StatusError::ConnectFailed(_))));
}

#[tokio::test]
async fn test_query_rejects_non_json_body() {
    let port = spawn_status_server("definitely not json", false).await;
    let result = query_status("127.0.0.1", port, Duration::from_secs(2)).await;
    assert!(matches!(result, Err(StatusError::MalformedResponse(_))));
}
