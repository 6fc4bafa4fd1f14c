//! HTTP forward proxy inbound.
//!
//! One listener handles both plain HTTP requests (absolute-form URI) and
//! CONNECT tunnels. Every target hostname is mapped through the routing
//! snapshot before dialing, so requests for managed CDN domains land on
//! the currently best edge IP while everything else passes through.

use crate::common::net::{configure_tcp_stream, is_benign_disconnect};
use crate::domain::SharedRoutes;
use crate::mapper::{map_target, HostPort};
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Forward proxy listener
pub struct ProxyListener {
    listener: TcpListener,
    routes: SharedRoutes,
    running: AtomicBool,
}

impl ProxyListener {
    /// Bind the listen socket. Serving starts with [`serve`].
    ///
    /// [`serve`]: ProxyListener::serve
    pub async fn bind(addr: &str, routes: SharedRoutes) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(ProxyListener {
            listener,
            routes,
            running: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Runs until [`stop`] is called.
    ///
    /// [`stop`]: ProxyListener::stop
    pub async fn serve(&self) -> Result<()> {
        let addr = self.local_addr()?;
        info!("proxy listening on {}", addr);
        self.running.store(true, Ordering::SeqCst);

        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let routes = Arc::clone(&self.routes);
                    tokio::spawn(async move {
                        handle_connection(routes, stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    if self.running.load(Ordering::SeqCst) {
                        error!("accept error: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn handle_connection(routes: SharedRoutes, stream: TcpStream, peer_addr: SocketAddr) {
    configure_tcp_stream(&stream);
    if let Err(e) = process_connection(routes, stream, peer_addr).await {
        match &e {
            Error::Io(io_err) if is_benign_disconnect(io_err) => {}
            _ => debug!("connection error from {}: {}", peer_addr, e),
        }
    }
}

async fn process_connection(
    routes: SharedRoutes,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<()> {
    let mut reader = BufReader::new(stream);

    let mut first_line = String::new();
    // binary junk on the proxy port (e.g. a raw TLS handshake) surfaces as
    // InvalidData and still deserves the 400 before teardown
    if let Err(e) = reader.read_line(&mut first_line).await {
        if e.kind() == std::io::ErrorKind::InvalidData {
            return respond_and_fail(
                reader.into_inner(),
                400,
                "Bad Request",
                Error::protocol("request is not valid HTTP text"),
            )
            .await;
        }
        return Err(e.into());
    }
    let first_line = first_line.trim().to_string();

    if first_line.is_empty() {
        return respond_and_fail(
            reader.into_inner(),
            400,
            "Bad Request",
            Error::protocol("empty request"),
        )
        .await;
    }

    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 3 {
        return respond_and_fail(
            reader.into_inner(),
            400,
            "Bad Request",
            Error::protocol("invalid request line"),
        )
        .await;
    }

    let method = parts[0].to_string();
    let uri = parts[1].to_string();
    let version = parts[2].to_string();

    // Headers are kept as raw lines so the forwarded request preserves the
    // client's casing and ordering.
    let mut raw_headers: Vec<String> = Vec::new();
    loop {
        let mut line = String::new();
        if let Err(e) = reader.read_line(&mut line).await {
            if e.kind() == std::io::ErrorKind::InvalidData {
                return respond_and_fail(
                    reader.into_inner(),
                    400,
                    "Bad Request",
                    Error::protocol("request headers are not valid HTTP text"),
                )
                .await;
            }
            return Err(e.into());
        }
        let line = line.trim_end_matches(|c| c == '\r' || c == '\n').to_string();
        if line.is_empty() {
            break;
        }
        raw_headers.push(line);
    }

    // Body or tunnel bytes the client pipelined behind the headers.
    let leftover = reader.buffer().to_vec();
    let stream = reader.into_inner();

    if method == "CONNECT" {
        handle_connect(routes, stream, &uri, &leftover, peer_addr).await
    } else {
        handle_http(
            routes,
            stream,
            &method,
            &uri,
            &version,
            &raw_headers,
            &leftover,
            peer_addr,
        )
        .await
    }
}

async fn handle_connect(
    routes: SharedRoutes,
    mut stream: TcpStream,
    uri: &str,
    leftover: &[u8],
    peer_addr: SocketAddr,
) -> Result<()> {
    let target = match parse_connect_target(uri) {
        Ok(t) => t,
        Err(e) => {
            return respond_and_fail(stream, 500, "Internal Server Error", e).await;
        }
    };

    let mapped = {
        let routes = routes.read();
        map_target(&routes, &target)
    };
    debug!(
        "CONNECT {} -> {} (dialing {})",
        peer_addr,
        target.to_addr(),
        mapped.to_addr()
    );

    let mut remote = match TcpStream::connect(mapped.to_addr()).await {
        Ok(r) => r,
        Err(e) => {
            return respond_and_fail(
                stream,
                502,
                "Bad Gateway",
                Error::connection(format!("connect {}: {}", mapped.to_addr(), e)),
            )
            .await;
        }
    };
    configure_tcp_stream(&remote);

    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    // TLS ClientHello is often pipelined right behind the CONNECT header
    if !leftover.is_empty() {
        remote.write_all(leftover).await?;
    }

    let (sent, received) = tokio::io::copy_bidirectional(&mut stream, &mut remote).await?;
    debug!(
        "CONNECT {} -> {} closed (sent: {}, received: {})",
        peer_addr,
        target.to_addr(),
        sent,
        received
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_http(
    routes: SharedRoutes,
    mut stream: TcpStream,
    method: &str,
    uri: &str,
    version: &str,
    raw_headers: &[String],
    leftover: &[u8],
    peer_addr: SocketAddr,
) -> Result<()> {
    let (target, path) = match parse_absolute_uri(uri) {
        Ok(t) => t,
        Err(e) => {
            return respond_and_fail(stream, 500, "Internal Server Error", e).await;
        }
    };

    let mapped = {
        let routes = routes.read();
        map_target(&routes, &target)
    };
    debug!(
        "HTTP {} {} {} -> dialing {}",
        peer_addr,
        method,
        uri,
        mapped.to_addr()
    );

    let mut remote = match TcpStream::connect(mapped.to_addr()).await {
        Ok(r) => r,
        Err(e) => {
            return respond_and_fail(
                stream,
                502,
                "Bad Gateway",
                Error::connection(format!("connect {}: {}", mapped.to_addr(), e)),
            )
            .await;
        }
    };
    configure_tcp_stream(&remote);

    // Origin-form request line, headers forwarded verbatim. The Host header
    // still names the original domain, which is what the edge expects.
    let mut request = format!("{} {} {}\r\n", method, path, version);
    for line in raw_headers {
        request.push_str(line);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    remote.write_all(request.as_bytes()).await?;
    if !leftover.is_empty() {
        remote.write_all(leftover).await?;
    }

    let (sent, received) = tokio::io::copy_bidirectional(&mut stream, &mut remote).await?;
    debug!(
        "HTTP {} {} closed (sent: {}, received: {})",
        method, uri, sent, received
    );
    Ok(())
}

/// Write an error status to the client, then surface the failure.
async fn respond_and_fail(
    mut stream: TcpStream,
    code: u16,
    reason: &str,
    err: Error,
) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nConnection: close\r\n\r\n",
        code, reason
    );
    // The client may already be gone; the original error is the one to keep.
    let _ = stream.write_all(response.as_bytes()).await;
    Err(err)
}

/// Parse the `host:port` authority of a CONNECT request.
fn parse_connect_target(uri: &str) -> Result<HostPort> {
    let (host, port) = match uri.rfind(':') {
        Some(idx) => {
            let port: u16 = uri[idx + 1..]
                .parse()
                .map_err(|_| Error::address(format!("invalid CONNECT port in {}", uri)))?;
            (&uri[..idx], port)
        }
        None => (uri, 443),
    };
    if host.is_empty() {
        return Err(Error::address("empty CONNECT host"));
    }
    Ok(HostPort::new(host, port))
}

/// Split an absolute-form request URI into its target and origin-form path.
fn parse_absolute_uri(uri: &str) -> Result<(HostPort, String)> {
    let (rest, default_port) = if let Some(rest) = uri.strip_prefix("http://") {
        (rest, 80)
    } else if let Some(rest) = uri.strip_prefix("https://") {
        (rest, 443)
    } else {
        return Err(Error::address(format!("expected absolute URI, got {}", uri)));
    };

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    if authority.is_empty() {
        return Err(Error::address("empty host in request URI"));
    }

    let (host, port) = match authority.rfind(':') {
        Some(idx) => {
            let port: u16 = authority[idx + 1..]
                .parse()
                .map_err(|_| Error::address(format!("invalid port in {}", authority)))?;
            (&authority[..idx], port)
        }
        None => (authority, default_port),
    };
    Ok((HostPort::new(host, port), path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_target() {
        let t = parse_connect_target("example.com:443").unwrap();
        assert_eq!(t, HostPort::new("example.com", 443));

        let t = parse_connect_target("example.com").unwrap();
        assert_eq!(t.port, 443);

        assert!(parse_connect_target("example.com:x").is_err());
        assert!(parse_connect_target(":443").is_err());
    }

    #[test]
    fn test_parse_absolute_uri() {
        let (t, path) = parse_absolute_uri("http://example.com/a/b?q=1").unwrap();
        assert_eq!(t, HostPort::new("example.com", 80));
        assert_eq!(path, "/a/b?q=1");

        let (t, path) = parse_absolute_uri("http://example.com:8080").unwrap();
        assert_eq!(t, HostPort::new("example.com", 8080));
        assert_eq!(path, "/");
    }

    #[test]
    fn test_parse_absolute_uri_https_defaults_to_443() {
        let (t, path) = parse_absolute_uri("https://example.com/secure").unwrap();
        assert_eq!(t, HostPort::new("example.com", 443));
        assert_eq!(path, "/secure");

        let (t, _) = parse_absolute_uri("https://example.com:8443/").unwrap();
        assert_eq!(t.port, 8443);
    }

    #[test]
    fn test_parse_absolute_uri_rejects_origin_form() {
        assert!(parse_absolute_uri("/index.html").is_err());
        assert!(parse_absolute_uri("ftp://example.com/").is_err());
    }
}
