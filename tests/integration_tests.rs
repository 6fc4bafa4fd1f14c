//! End-to-end proxy tests against local backends.

use akam_proxy::domain::RouteEntry;
use akam_proxy::inbound::ProxyListener;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_proxy(routes: Vec<RouteEntry>) -> SocketAddr {
    let routes = Arc::new(RwLock::new(routes));
    let listener = ProxyListener::bind("127.0.0.1:0", routes).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = listener.serve().await;
    });
    addr
}

/// Backend that echoes every byte back to the sender.
async fn spawn_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Backend that answers any HTTP request with a fixed 200.
async fn spawn_http_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let _ = stream
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
                    )
                    .await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

/// Read from the stream until the end of the HTTP header block.
async fn read_headers(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "stream closed before headers completed");
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

/// A port that is bound and immediately released, so nothing listens on it.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_connect_tunnel_relays_both_ways() {
    let backend = spawn_echo_backend().await;
    let proxy = spawn_proxy(Vec::new()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", backend.port()).as_bytes())
        .await
        .unwrap();

    let response = read_headers(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    client.write_all(b"ping").await.unwrap();
    let mut echo = [0u8; 4];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"ping");
}

#[tokio::test]
async fn test_connect_routes_managed_domain_to_edge() {
    let backend = spawn_echo_backend().await;
    let routes = vec![RouteEntry {
        pattern: "akamaized.net".into(),
        host: Some("127.0.0.1".into()),
    }];
    let proxy = spawn_proxy(routes).await;

    // the hostname does not resolve anywhere; only mapping can reach the backend
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(
            format!(
                "CONNECT upos-hz-mirrorakam.akamaized.net:{} HTTP/1.1\r\n\r\n",
                backend.port()
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let response = read_headers(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    client.write_all(b"tunneled").await.unwrap();
    let mut echo = [0u8; 8];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"tunneled");
}

#[tokio::test]
async fn test_backend_close_propagates_to_client() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    let proxy = spawn_proxy(Vec::new()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(
            format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", backend_addr.port()).as_bytes(),
        )
        .await
        .unwrap();
    let (backend_stream, _) = backend.accept().await.unwrap();

    let response = read_headers(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    // backend hangs up; the tunnel must close toward the client too
    drop(backend_stream);
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "client should see EOF after backend close");
}

#[tokio::test]
async fn test_client_close_propagates_to_backend() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    let proxy = spawn_proxy(Vec::new()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(
            format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", backend_addr.port()).as_bytes(),
        )
        .await
        .unwrap();
    let (mut backend_stream, _) = backend.accept().await.unwrap();

    let response = read_headers(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);

    // client hangs up; the tunnel must close toward the backend too
    drop(client);
    let mut buf = [0u8; 16];
    let n = backend_stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "backend should see EOF after client close");
}

#[tokio::test]
async fn test_plain_http_forward() {
    let backend = spawn_http_backend().await;
    let proxy = spawn_proxy(Vec::new()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(
            format!(
                "GET http://127.0.0.1:{}/index.html HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
                backend.port()
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {}", response);
    assert!(response.ends_with("hello"), "got: {}", response);
}

#[tokio::test]
async fn test_https_absolute_uri_is_forwarded() {
    let backend = spawn_http_backend().await;
    let proxy = spawn_proxy(Vec::new()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(
            format!(
                "GET https://127.0.0.1:{}/secure HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
                backend.port()
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut response = String::new();
    client.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {}", response);
}

#[tokio::test]
async fn test_binary_junk_returns_400() {
    let proxy = spawn_proxy(Vec::new()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    // looks like the start of a TLS handshake, not HTTP text
    client
        .write_all(&[0x16, 0x03, 0x01, 0xff, 0xfe])
        .await
        .unwrap();
    client.shutdown().await.unwrap();

    let response = read_headers(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 400"), "got: {}", response);
}

#[tokio::test]
async fn test_connect_to_dead_backend_returns_502() {
    let port = closed_port().await;
    let proxy = spawn_proxy(Vec::new()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", port).as_bytes())
        .await
        .unwrap();

    let response = read_headers(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 502"), "got: {}", response);
}

#[tokio::test]
async fn test_garbage_request_returns_400() {
    let proxy = spawn_proxy(Vec::new()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(b"GARBAGE\r\n\r\n").await.unwrap();

    let response = read_headers(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 400"), "got: {}", response);
}

#[tokio::test]
async fn test_origin_form_request_returns_500() {
    let proxy = spawn_proxy(Vec::new()).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    let response = read_headers(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 500"), "got: {}", response);
}
